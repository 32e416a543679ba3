use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha1::{Digest, Sha1};

use fns::Scope;

use crate::gateway::Context;

use super::{header_str, prepared, BODY_LIMIT};

/// ETag revalidation backed by the shared cache. Keys are request
/// fingerprints; entries are stored only when the handler marks the
/// response cacheable via `Cache-Control: max-age`.
pub async fn request_cache(State(ctx): State<Context>, req: Request, next: Next) -> Response {
    if !ctx.config.transport.middlewares.cache.enabled {
        return next.run(req).await;
    }
    let (req, meta) = match prepared(req).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    let Some(fingerprint) = meta.fingerprint.clone() else {
        return next.run(req).await;
    };
    if meta.internal {
        return next.run(req).await;
    }
    let key = format!("etag/{fingerprint}");
    let base = ctx.base();

    if let Some(tag) = header_str(req.headers(), IF_NONE_MATCH.as_str()) {
        let stored = ctx
            .shared
            .caches()
            .get(&base, Scope::System, key.as_bytes())
            .await
            .ok()
            .flatten();
        if stored.as_deref() == Some(tag.as_bytes()) {
            return (
                StatusCode::NOT_MODIFIED,
                [(ETAG, tag.to_string())],
                Body::empty(),
            )
                .into_response();
        }
    }

    let response = next.run(req).await;
    if !response.status().is_success() {
        return response;
    }
    let Some(max_age) =
        header_str(response.headers(), CACHE_CONTROL.as_str()).and_then(parse_max_age)
    else {
        return response;
    };
    if max_age == 0 {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let tag = format!("W/\"L-{}\"", hex::encode(Sha1::digest(&bytes)));
    ctx.shared
        .caches()
        .set(
            &base,
            Scope::System,
            key.as_bytes(),
            tag.clone().into_bytes(),
            Duration::from_secs(max_age),
        )
        .await
        .ok();
    if let Ok(value) = HeaderValue::from_str(&tag) {
        parts.headers.insert(ETAG, value);
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// `max-age=N` seconds, unless `no-cache`/`no-store` forbid storing.
fn parse_max_age(value: &str) -> Option<u64> {
    let mut max_age = None;
    for directive in value.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if directive == "no-cache" || directive == "no-store" {
            return None;
        }
        if let Some(seconds) = directive.strip_prefix("max-age=") {
            max_age = seconds.parse().ok();
        }
    }
    max_age
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("public, max-age=10"), Some(10));
        assert_eq!(parse_max_age("no-cache, max-age=10"), None);
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("public"), None);
        assert_eq!(parse_max_age("max-age=nope"), None);
    }
}
