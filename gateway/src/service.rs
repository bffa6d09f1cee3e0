//! The inbound request handler: dispatches the static endpoints, resolves
//! routes, and drives the forwarder. Every inbound request produces exactly
//! one response; the handler is a single async function returning one value,
//! so there is no sent-flag to guard.

use crate::config::{Config, Listener, RetryConfig};
use crate::errors::GatewayError;
use crate::forwarder::{ForwardRequest, Forwarder};
use crate::relay::relay_response;
use crate::rewrite::{build_target_url, rewrite_path};
use crate::routing::{BackendRegistry, RouteTable};
use http::header::HOST;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{ClientAddr, json_error_response, json_response};
use std::pin::Pin;
use std::sync::Arc;

/// Suggested client-side wait before retrying a cold backend
const COLD_START_RETRY_AFTER_SECS: u64 = 10;

type ServiceBody = BoxBody<Bytes, GatewayError>;

/// Immutable per-process state shared by all request tasks
pub struct GatewayState {
    pub registry: BackendRegistry,
    pub table: RouteTable,
    pub forwarder: Forwarder,
    pub listener: Listener,
    pub retry: RetryConfig,
}

impl GatewayState {
    pub fn new(config: &Config) -> Self {
        let registry = BackendRegistry::new(config.backends.clone());
        let table = RouteTable::from_config(config, &registry);
        let forwarder = Forwarder::new(config.retry.clone());
        Self {
            registry,
            table,
            forwarder,
            listener: config.listener.clone(),
            retry: config.retry.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayService {
    state: Arc<GatewayState>,
}

impl GatewayService {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<ServiceBody>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let state = self.state.clone();
        // Failures become JSON responses; the connection itself never errors
        Box::pin(async move { Ok(handle(state, req).await) })
    }
}

async fn handle<B>(state: Arc<GatewayState>, req: Request<B>) -> Response<ServiceBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET {
        match path.as_str() {
            "/" => return index_response(&state),
            "/health" => return health_response(&state),
            _ => {}
        }
    }

    let Some(rule) = state.table.resolve(&path).cloned() else {
        tracing::warn!(%method, %path, "no route matched");
        return not_found_response(&state);
    };

    let Some(base) = state.registry.get(&rule.backend).cloned() else {
        // Config validation rules this out; keep a real response anyway
        return json_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("route references unknown backend '{}'", rule.backend),
        );
    };

    let query = req.uri().query().map(str::to_string);
    let client_addr = req.extensions().get::<ClientAddr>().map(|c| c.0);
    let original_host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(
                StatusCode::BAD_REQUEST,
                "request_body_error",
                &format!("failed to read request body: {e}"),
            );
        }
    };

    let outbound_path = rewrite_path(&rule, &path);
    let target = build_target_url(&base, &outbound_path, query.as_deref());

    tracing::debug!(
        %method,
        inbound = %path,
        outbound = %outbound_path,
        backend = %rule.backend,
        "forwarding"
    );

    let fwd = ForwardRequest {
        method,
        version: parts.version,
        headers: parts.headers,
        body,
        target,
        client_addr,
        original_host,
    };

    match state.forwarder.forward(&rule.backend, &fwd).await {
        Ok(upstream) => relay_response(&rule.backend, upstream),
        Err(err) => terminal_failure_response(&state, &rule.backend, err),
    }
}

/// Renders the terminal failure after the retry budget is exhausted: 504 for
/// timeouts, 502 for connection-level failures.
fn terminal_failure_response(
    state: &GatewayState,
    service: &str,
    err: GatewayError,
) -> Response<ServiceBody> {
    let attempts = state.retry.max_attempts;
    match err {
        GatewayError::BackendTimeout { .. } => json_response(
            StatusCode::GATEWAY_TIMEOUT,
            &serde_json::json!({
                "error": "backend_timeout",
                "message": format!(
                    "backend '{service}' did not respond within {attempts} attempts; \
                     it is likely cold-starting"
                ),
                "service": service,
                "retry_after_secs": COLD_START_RETRY_AFTER_SECS,
            }),
        ),
        GatewayError::BackendUnreachable { detail, .. }
        | GatewayError::ResponseBodyError { detail, .. } => json_response(
            StatusCode::BAD_GATEWAY,
            &serde_json::json!({
                "error": "backend_unreachable",
                "message": format!(
                    "backend '{service}' did not accept a connection within {attempts} \
                     attempts; it is likely cold-starting"
                ),
                "service": service,
                "detail": detail,
                "retry_after_secs": COLD_START_RETRY_AFTER_SECS,
            }),
        ),
        other => {
            tracing::error!(service, error = %other, "forwarding failed");
            json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                &other.to_string(),
            )
        }
    }
}

/// Process status plus the configured backend base URLs. Makes no network
/// call to any backend.
fn health_response(state: &GatewayState) -> Response<ServiceBody> {
    let backends: serde_json::Map<String, serde_json::Value> = state
        .registry
        .iter()
        .map(|(name, url)| (name.clone(), serde_json::Value::from(url.as_str())))
        .collect();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "READY",
            "listener": {
                "host": state.listener.host,
                "port": state.listener.port,
            },
            "backends": backends,
        }),
    )
}

/// Static description of the routing surface
fn index_response(state: &GatewayState) -> Response<ServiceBody> {
    let routes: serde_json::Map<String, serde_json::Value> = state
        .table
        .rules()
        .iter()
        .map(|rule| {
            (
                rule.prefix.clone(),
                serde_json::Value::from(rule.backend.as_str()),
            )
        })
        .collect();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "message": "API gateway",
            "description": "requests under the listed prefixes are forwarded \
                            to their backends; cold backends are retried with backoff",
            "routes": routes,
            "health": "GET /health",
        }),
    )
}

fn not_found_response(state: &GatewayState) -> Response<ServiceBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "route_not_found",
            "message": "no configured route matches the request path",
            "available_routes": state.table.prefixes(),
        }),
    )
}
