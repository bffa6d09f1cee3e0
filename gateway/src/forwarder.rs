//! Outbound request path: one attempt builder plus the retry loop.
//!
//! The backends are serverless functions that sleep when idle, so a refused
//! connection or a timed-out attempt usually means a cold start in progress.
//! Transport failures are retried with exponential backoff and a growing
//! per-attempt timeout; application responses of any status are returned
//! immediately and never retried.

use crate::config::RetryConfig;
use crate::errors::GatewayError;
use http::header::{ACCEPT, CONTENT_TYPE, EXPECT, HOST, HeaderMap, HeaderValue};
use http::{Method, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::headers::{add_via_header, filter_hop_by_hop};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use url::Url;

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

/// Everything needed to issue (and re-issue) one outbound request. Built per
/// inbound request; each attempt clones from it so retries never consume the
/// original.
pub struct ForwardRequest {
    pub method: Method,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Backend base URL with the rewritten path and original query applied
    pub target: Url,
    pub client_addr: Option<SocketAddr>,
    pub original_host: Option<String>,
}

pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    retry: RetryConfig,
    request_counter: AtomicU64,
}

impl Forwarder {
    pub fn new(retry: RetryConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            retry,
            request_counter: AtomicU64::new(1),
        }
    }

    /// Sends the request with bounded retries and returns the backend's
    /// response with its body collected. The loop is sequential, so at most
    /// one response ever comes back per call; a stale attempt can never
    /// complete after a response has been produced.
    pub async fn forward(
        &self,
        service: &str,
        fwd: &ForwardRequest,
    ) -> Result<Response<Bytes>, GatewayError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let mut last_err = GatewayError::BackendUnreachable {
            service: service.to_string(),
            detail: "no attempts made".to_string(),
        };

        for attempt in 1..=self.retry.max_attempts {
            match self
                .send_attempt(service, fwd, attempt, request_id)
                .await
            {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(service, attempt, "backend answered after retry");
                    }
                    return Ok(response);
                }
                Err(err) if err.is_transport() => {
                    tracing::warn!(
                        service,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "transport failure, backend may be cold-starting"
                    );
                    last_err = err;
                    if attempt < self.retry.max_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    /// Per-attempt timeout, growing with the attempt number
    fn attempt_timeout(&self, attempt: u32) -> Duration {
        let secs = self.retry.attempt_timeout_secs
            + u64::from(attempt - 1) * self.retry.timeout_increment_secs;
        Duration::from_secs(secs.min(self.retry.max_timeout_secs))
    }

    /// Exponential backoff between attempts: base, 2x base, 4x base, ...
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.retry.base_delay_ms.saturating_mul(factor))
    }

    async fn send_attempt(
        &self,
        service: &str,
        fwd: &ForwardRequest,
        attempt: u32,
        request_id: u64,
    ) -> Result<Response<Bytes>, GatewayError> {
        let request = build_attempt_request(fwd, attempt, request_id)?;
        let per_attempt = self.attempt_timeout(attempt);

        // The timeout covers connection establishment, response headers, and
        // collecting the complete body. Not suitable for streaming responses.
        let attempt_future = async {
            let response = self.client.request(request).await.map_err(|e| {
                GatewayError::BackendUnreachable {
                    service: service.to_string(),
                    detail: e.to_string(),
                }
            })?;

            let (mut parts, body) = response.into_parts();
            let response_version = parts.version;
            filter_hop_by_hop(&mut parts.headers, response_version);
            add_via_header(&mut parts.headers, response_version);

            let bytes = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| GatewayError::ResponseBodyError {
                    service: service.to_string(),
                    detail: e.to_string(),
                })?;

            Ok(Response::from_parts(parts, bytes))
        };

        timeout(per_attempt, attempt_future)
            .await
            .map_err(|_| GatewayError::BackendTimeout {
                service: service.to_string(),
            })?
    }
}

fn build_attempt_request(
    fwd: &ForwardRequest,
    attempt: u32,
    request_id: u64,
) -> Result<Request<Full<Bytes>>, GatewayError> {
    let mut headers = fwd.headers.clone();
    filter_hop_by_hop(&mut headers, fwd.version);

    // Never honored, and some backends mishandle it
    headers.remove(EXPECT);
    // The client derives Host from the target URL
    headers.remove(HOST);

    headers.insert(CONTENT_TYPE, application_json());
    headers.insert(ACCEPT, application_json());

    if let Some(host) = &fwd.original_host
        && let Ok(value) = HeaderValue::from_str(host)
    {
        headers.insert("x-forwarded-host", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(addr) = fwd.client_addr {
        let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {}", addr.ip()),
            None => addr.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&attempt.to_string()) {
        headers.insert("x-attempt", value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }
    add_via_header(&mut headers, fwd.version);

    // Body attached only for methods that carry one
    let body = if matches!(fwd.method, Method::POST | Method::PUT | Method::PATCH) {
        Full::new(fwd.body.clone())
    } else {
        Full::new(Bytes::new())
    };

    let mut request = Request::builder()
        .method(fwd.method.clone())
        .uri(fwd.target.as_str())
        .body(body)
        .map_err(|e| GatewayError::InternalError(format!("Failed to build request: {e}")))?;
    *request.headers_mut() = headers;

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;

    fn test_retry(max_attempts: u32, attempt_timeout_secs: u64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            attempt_timeout_secs,
            timeout_increment_secs: 0,
            max_timeout_secs: attempt_timeout_secs,
        }
    }

    fn forward_request(method: Method, target: Url, body: &'static [u8]) -> ForwardRequest {
        ForwardRequest {
            method,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
            target,
            client_addr: Some("10.1.2.3:55555".parse().unwrap()),
            original_host: Some("gateway.example.com".to_string()),
        }
    }

    // Echoes method, path, query, selected headers, and body as JSON
    async fn echo_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_else(|_| Bytes::new());

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let payload = serde_json::json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "content_type": header("content-type"),
            "expect": header("expect"),
            "x_forwarded_for": header("x-forwarded-for"),
            "x_forwarded_host": header("x-forwarded-host"),
            "x_attempt": header("x-attempt"),
            "body": String::from_utf8_lossy(&body_bytes),
        });

        let response = Response::builder()
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
            .unwrap();
        Ok(response)
    }

    async fn start_echo_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(echo_handler))
                        .await;
                });
            }
        });

        Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()
    }

    /// Accepts and immediately drops the first `failures` connections, then
    /// serves normally. Simulates a backend waking up from a cold start.
    async fn start_flaky_server(failures: u32) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                if seen.fetch_add(1, Ordering::SeqCst) < failures {
                    drop(stream);
                    continue;
                }
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(
                            io,
                            service_fn(|_req| async {
                                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                                    b"{\"warm\":true}",
                                ))))
                            }),
                        )
                        .await;
                });
            }
        });

        Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()
    }

    #[tokio::test]
    async fn test_forward_success_rewrites_headers() {
        let base = start_echo_server().await;
        let mut target = base.clone();
        target.set_path("/users/credentials/user%40example.com");
        target.set_query(Some("limit=5"));

        let forwarder = Forwarder::new(test_retry(3, 5));
        let mut fwd = forward_request(Method::POST, target, b"{\"k\":1}");
        fwd.headers
            .insert(EXPECT, HeaderValue::from_static("100-continue"));
        fwd.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let response = forwarder.forward("users", &fwd).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let echoed: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/users/credentials/user%40example.com");
        assert_eq!(echoed["query"], "limit=5");
        assert_eq!(echoed["body"], "{\"k\":1}");
        // forced to JSON, expect stripped, forwarded headers set
        assert_eq!(echoed["content_type"], "application/json");
        assert_eq!(echoed["expect"], "");
        assert_eq!(echoed["x_forwarded_for"], "10.1.2.3");
        assert_eq!(echoed["x_forwarded_host"], "gateway.example.com");
        assert_eq!(echoed["x_attempt"], "1");
    }

    #[tokio::test]
    async fn test_get_sends_no_body() {
        let base = start_echo_server().await;
        let forwarder = Forwarder::new(test_retry(1, 5));
        let fwd = forward_request(Method::GET, base, b"ignored");

        let response = forwarder.forward("users", &fwd).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(echoed["body"], "");
    }

    #[tokio::test]
    async fn test_refused_connection_is_terminal_after_retries() {
        // Bind and drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Url::parse(&format!("http://127.0.0.1:{port}/auth/login")).unwrap();
        let forwarder = Forwarder::new(test_retry(3, 5));
        let fwd = forward_request(Method::POST, target, b"{}");

        let err = forwarder.forward("auth", &fwd).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_cold_backend_succeeds_on_third_attempt() {
        let base = start_flaky_server(2).await;
        let forwarder = Forwarder::new(test_retry(5, 5));
        let fwd = forward_request(Method::GET, base, b"");

        let response = forwarder.forward("users", &fwd).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"{\"warm\":true}");
    }

    #[tokio::test]
    async fn test_failures_beyond_budget_stay_terminal() {
        let base = start_flaky_server(5).await;
        let forwarder = Forwarder::new(test_retry(2, 5));
        let fwd = forward_request(Method::GET, base, b"");

        let err = forwarder.forward("users", &fwd).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unresponsive_backend_times_out() {
        // Accepts connections but never responds
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });

        let target = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let forwarder = Forwarder::new(test_retry(2, 1));
        let fwd = forward_request(Method::GET, target, b"");

        let err = forwarder.forward("notifications", &fwd).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendTimeout { .. }));
    }

    #[tokio::test]
    async fn test_application_errors_are_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_server = hits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let hits = hits_server.clone();
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(
                            io,
                            service_fn(move |_req| {
                                hits.fetch_add(1, Ordering::SeqCst);
                                async {
                                    Ok::<_, Infallible>(
                                        Response::builder()
                                            .status(StatusCode::NOT_FOUND)
                                            .body(Full::new(Bytes::from_static(
                                                b"{\"error\":\"missing\"}",
                                            )))
                                            .unwrap(),
                                    )
                                }
                            }),
                        )
                        .await;
                });
            }
        });

        let target = Url::parse(&format!("http://127.0.0.1:{port}/users/admins/9")).unwrap();
        let forwarder = Forwarder::new(test_retry(5, 5));
        let fwd = forward_request(Method::GET, target, b"");

        let response = forwarder.forward("users", &fwd).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_ref(), b"{\"error\":\"missing\"}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_growth_is_capped() {
        let forwarder = Forwarder::new(RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            attempt_timeout_secs: 10,
            timeout_increment_secs: 10,
            max_timeout_secs: 30,
        });

        assert_eq!(forwarder.attempt_timeout(1), Duration::from_secs(10));
        assert_eq!(forwarder.attempt_timeout(2), Duration::from_secs(20));
        assert_eq!(forwarder.attempt_timeout(3), Duration::from_secs(30));
        assert_eq!(forwarder.attempt_timeout(5), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_doubles() {
        let forwarder = Forwarder::new(RetryConfig::default());
        assert_eq!(forwarder.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(forwarder.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(forwarder.backoff_delay(3), Duration::from_millis(4000));
    }
}
