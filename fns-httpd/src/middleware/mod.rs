//! The invocation middleware chain: CORS (assembled with the router) →
//! request cache (ETag) → rate limit → idempotency → handler. Every
//! middleware passes verified-internal traffic straight through.

mod cache;
mod idempotent;
mod ratelimit;

pub use cache::request_cache;
pub use idempotent::idempotent;
pub use ratelimit::rate_limit;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use fns::CodeError;

use crate::error::code_error_response;

/// Largest request body the invocation path buffers.
pub(crate) const BODY_LIMIT: usize = 8 * 1024 * 1024;

/// What the chain knows about an invocation before the handler parses it.
#[derive(Debug, Clone)]
pub(crate) struct InvokeMeta {
    pub internal: bool,
    pub device_id: String,
    /// Absent when the path or body does not shape a fingerprint; the
    /// handler reports the precise error.
    pub fingerprint: Option<String>,
}

/// Fetch the invocation metadata, buffering the body once; later
/// middlewares reuse the recorded extension.
pub(crate) async fn prepared(req: Request) -> Result<(Request, InvokeMeta), Response> {
    if let Some(meta) = req.extensions().get::<InvokeMeta>() {
        let meta = meta.clone();
        return Ok((req, meta));
    }
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(code_error_response(CodeError::bad_request(
                "request body is too large",
            )))
        }
    };
    let meta = build_meta(&parts, &bytes);
    parts.extensions.insert(meta.clone());
    Ok((Request::from_parts(parts, Body::from(bytes)), meta))
}

fn build_meta(parts: &Parts, body: &Bytes) -> InvokeMeta {
    let internal = header_str(&parts.headers, fns::header::REQUEST_INTERNAL)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    let device_id = header_str(&parts.headers, fns::header::DEVICE_ID)
        .unwrap_or_default()
        .to_string();

    let fingerprint = (|| {
        let (service, fn_name) = parts.uri.path().strip_prefix("/services/")?.split_once('/')?;
        if service.is_empty() || fn_name.is_empty() || fn_name.contains('/') {
            return None;
        }
        let argument = fns::Argument::from_raw(body.to_vec()).ok()?;
        let accepted = header_str(&parts.headers, fns::header::REQUEST_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Some(
            fns::Request::new(service, fn_name, argument)
                .with_device(device_id.clone(), String::new())
                .with_accepted_versions(accepted)
                .fingerprint()
                .to_string(),
        )
    })();

    InvokeMeta {
        internal,
        device_id,
        fingerprint,
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The CORS layer answers preflights with 200; the wire contract wants
/// 204.
pub async fn preflight_status(req: Request, next: Next) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
