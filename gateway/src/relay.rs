//! Response relay semantics.
//!
//! Backend responses are relayed with their status intact. Success bodies
//! are parsed and re-serialized as JSON; a success response whose body is
//! not JSON is turned into a 502 that preserves the raw text, because the
//! clients of this gateway only speak JSON. Application errors (4xx/5xx)
//! pass through verbatim and are never treated as proxy faults.

use crate::errors::GatewayError;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use shared::http::{full_body, json_response};

type RelayBody = BoxBody<Bytes, GatewayError>;

pub fn relay_response(service: &str, upstream: Response<Bytes>) -> Response<RelayBody> {
    let (mut parts, body) = upstream.into_parts();
    let status = parts.status;

    // The body is re-framed below; a stale length would conflict
    parts.headers.remove(CONTENT_LENGTH);

    if status == StatusCode::NO_CONTENT {
        let mut res = Response::new(full_body(Bytes::new()));
        *res.status_mut() = status;
        *res.headers_mut() = parts.headers;
        return res;
    }

    if status.is_client_error() || status.is_server_error() {
        // Legitimate application responses, relayed as-is
        let mut res = Response::new(full_body(body));
        *res.status_mut() = status;
        *res.headers_mut() = parts.headers;
        return res;
    }

    if body.is_empty() {
        let mut res = json_response(status, &serde_json::json!({}));
        merge_headers(res.headers_mut(), parts.headers);
        return res;
    }

    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => {
            let mut res = json_response(status, &value);
            merge_headers(res.headers_mut(), parts.headers);
            res
        }
        Err(_) => {
            tracing::warn!(service, %status, "backend returned a non-JSON success body");
            json_response(
                StatusCode::BAD_GATEWAY,
                &serde_json::json!({
                    "error": "invalid_json",
                    "message": format!(
                        "backend '{service}' responded but with a non-JSON body"
                    ),
                    "service": service,
                    "raw_response": String::from_utf8_lossy(&body),
                }),
            )
        }
    }
}

/// Carries upstream headers over onto a rebuilt response without clobbering
/// the content-type set for the re-serialized body.
fn merge_headers(dst: &mut http::HeaderMap, src: http::HeaderMap) {
    let json = dst
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("application/json"));
    for (name, value) in src.iter() {
        if name != CONTENT_TYPE {
            dst.insert(name, value.clone());
        }
    }
    dst.insert(CONTENT_TYPE, json);
}
