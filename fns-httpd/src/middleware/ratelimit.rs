use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

use fns::{CodeError, Scope};

use crate::error::code_error_response;
use crate::gateway::Context;

use super::prepared;

/// Per-device window counter in the shared store: over budget replies 429
/// with `Retry-After`. A shared-substrate outage fails open rather than
/// refusing traffic.
pub async fn rate_limit(State(ctx): State<Context>, req: Request, next: Next) -> Response {
    let config = &ctx.config.transport.middlewares.rate_limit;
    if !config.enabled {
        return next.run(req).await;
    }
    let (req, meta) = match prepared(req).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    if meta.internal || meta.device_id.is_empty() {
        return next.run(req).await;
    }

    let key = format!("rateLimit/{}", meta.device_id);
    let base = ctx.base();
    let count = match ctx
        .shared
        .store()
        .incr(&base, Scope::System, key.as_bytes(), 1)
        .await
    {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!("rate limit store unavailable: {err}");
            return next.run(req).await;
        }
    };
    if count == 1 {
        ctx.shared
            .store()
            .expire_key(
                &base,
                Scope::System,
                key.as_bytes(),
                Duration::from_secs(config.window_seconds.max(1)),
            )
            .await
            .ok();
    }
    if count > config.max {
        // Undo the over-increment so the window keeps counting accepted
        // requests only.
        ctx.shared
            .store()
            .incr(&base, Scope::System, key.as_bytes(), -1)
            .await
            .ok();
        let mut response = code_error_response(CodeError::too_many_requests(format!(
            "device '{}' is over its request budget",
            meta.device_id
        )));
        response.headers_mut().insert(
            RETRY_AFTER,
            HeaderValue::from_str(&config.retry_after_seconds.to_string())
                .unwrap_or(HeaderValue::from_static("10")),
        );
        return response;
    }
    next.run(req).await
}
