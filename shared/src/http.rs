use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Peer address of the inbound connection, injected as a request extension
/// so handlers can populate forwarded-for headers.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

/// Wraps a shared service and stamps each request with the peer address.
struct WithClientAddr<S> {
    inner: Arc<S>,
    peer: SocketAddr,
}

impl<S> Service<Request<Incoming>> for WithClientAddr<S>
where
    S: Service<Request<Incoming>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        req.extensions_mut().insert(ClientAddr(self.peer));
        self.inner.call(req)
    }
}

pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "listening");
    let service_arc = Arc::new(service);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = WithClientAddr {
            inner: service_arc.clone(),
            peer: peer_addr,
        };

        // Hand the connection to hyper; auto-detect h1/h2 on this socket.
        // Dropping the task when the client goes away abandons any in-flight
        // outbound work for that connection.
        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}

/// Boxes a byte body under an arbitrary error type. `Full` never fails, so
/// the error mapping is unreachable.
pub fn full_body<E>(bytes: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Builds a JSON response with the given status.
pub fn json_response<E>(
    status: StatusCode,
    value: &serde_json::Value,
) -> Response<BoxBody<Bytes, E>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut res = Response::new(full_body(body));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    res
}

/// Canned JSON error body. Failure responses always carry `error` and a
/// human-readable `message`, never an empty body.
pub fn json_error_response<E>(
    status: StatusCode,
    error: &str,
    message: &str,
) -> Response<BoxBody<Bytes, E>> {
    json_response(
        status,
        &serde_json::json!({
            "error": error,
            "message": message,
        }),
    )
}
