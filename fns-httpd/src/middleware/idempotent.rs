use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use fns::{CodeError, Scope};

use crate::error::code_error_response;
use crate::gateway::Context;

use super::prepared;

/// One in-flight ticket per fingerprint: a second identical non-internal
/// request within the ticket TTL replies `Locked`. Tickets release with
/// the response, error or not.
pub async fn idempotent(State(ctx): State<Context>, req: Request, next: Next) -> Response {
    let config = &ctx.config.transport.middlewares.idempotent;
    if !config.enabled {
        return next.run(req).await;
    }
    let (req, meta) = match prepared(req).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    if meta.internal {
        return next.run(req).await;
    }
    let Some(fingerprint) = meta.fingerprint.clone() else {
        return next.run(req).await;
    };

    let key = format!("idempotent/{fingerprint}");
    let base = ctx.base();
    let count = match ctx
        .shared
        .store()
        .incr(&base, Scope::System, key.as_bytes(), 1)
        .await
    {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!("idempotency store unavailable: {err}");
            return next.run(req).await;
        }
    };
    if count > 1 {
        ctx.shared
            .store()
            .incr(&base, Scope::System, key.as_bytes(), -1)
            .await
            .ok();
        return code_error_response(CodeError::locked(
            "an identical request is already in flight",
        ));
    }
    ctx.shared
        .store()
        .expire_key(
            &base,
            Scope::System,
            key.as_bytes(),
            Duration::from_secs(config.ticket_ttl_seconds.max(1)),
        )
        .await
        .ok();

    let response = next.run(req).await;
    ctx.shared
        .store()
        .remove(&base, Scope::System, key.as_bytes())
        .await
        .ok();
    response
}
