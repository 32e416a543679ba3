use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use fns::shared::{SharedCommand, SharedReply};
use fns::{header, CodeError, Scope};

use crate::error::code_error_response;
use crate::middleware::header_str;

use super::Context;

/// Bound on how long a remote lock lease may outlive its holder.
const MAX_LEASE_TTL: Duration = Duration::from_secs(30);

fn verify_signed_post(ctx: &Context, headers: &HeaderMap, body: &[u8]) -> Result<(), CodeError> {
    let signature = header_str(headers, header::REQUEST_SIGNATURE)
        .ok_or_else(|| CodeError::not_acceptable("X-Fns-Request-Signature is required"))?;
    let signed: &[u8] = if body.is_empty() {
        header_str(headers, header::DEVICE_ID)
            .map(str::as_bytes)
            .unwrap_or_default()
    } else {
        body
    };
    if !ctx.signer.verify(signed, signature) {
        return Err(CodeError::not_acceptable("request signature mismatch"));
    }
    Ok(())
}

/// Membership snapshot: this node plus every registered peer.
/// `POST /cluster/nodes` (signed)
pub async fn nodes_handler(
    State(ctx): State<Context>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = verify_signed_post(&ctx, &headers, &body) {
        return code_error_response(err);
    }
    let mut nodes = ctx.registrations().nodes();
    nodes.push(ctx.node().clone());
    nodes.sort();
    Json(nodes).into_response()
}

/// Server side of the shared tunnel: peers POST store/lockers/caches
/// operations here.
/// `POST /cluster/shared` (signed)
pub async fn shared_handler(
    State(ctx): State<Context>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = verify_signed_post(&ctx, &headers, &body) {
        return code_error_response(err);
    }
    let command: SharedCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(e) => {
            return code_error_response(CodeError::not_acceptable(format!(
                "shared command does not decode: {e}"
            )))
        }
    };
    match apply(&ctx, command).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => code_error_response(err),
    }
}

async fn apply(ctx: &Context, command: SharedCommand) -> Result<SharedReply, CodeError> {
    let base = ctx.base();
    let key = command.key_bytes()?;
    let scope = command.scope;
    let ttl = Duration::from_millis(command.ttl_ms.unwrap_or(0));

    match (command.capability.as_str(), command.op.as_str()) {
        ("store", "get") => {
            let value = ctx.shared.store().get(&base, scope, &key).await?;
            Ok(match value {
                Some(bytes) => SharedReply::with_value(&bytes),
                None => SharedReply::default(),
            })
        }
        ("store", "set") => {
            let value = command
                .value_bytes()?
                .ok_or_else(|| CodeError::bad_request("store set misses the value"))?;
            if ttl.is_zero() {
                ctx.shared.store().set(&base, scope, &key, value).await?;
            } else {
                ctx.shared
                    .store()
                    .set_with_ttl(&base, scope, &key, value, ttl)
                    .await?;
            }
            Ok(SharedReply::default())
        }
        ("store", "incr") => {
            let delta = command
                .delta
                .ok_or_else(|| CodeError::bad_request("store incr misses the delta"))?;
            let counter = ctx.shared.store().incr(&base, scope, &key, delta).await?;
            Ok(SharedReply {
                counter: Some(counter),
                ..SharedReply::default()
            })
        }
        ("store", "expire") => {
            ctx.shared.store().expire_key(&base, scope, &key, ttl).await?;
            Ok(SharedReply::default())
        }
        ("store", "remove") => {
            ctx.shared.store().remove(&base, scope, &key).await?;
            Ok(SharedReply::default())
        }
        ("caches", "get") => {
            let value = ctx.shared.caches().get(&base, scope, &key).await?;
            Ok(match value {
                Some(bytes) => SharedReply::with_value(&bytes),
                None => SharedReply::default(),
            })
        }
        ("caches", "exist") => {
            let exists = ctx.shared.caches().exist(&base, scope, &key).await?;
            Ok(SharedReply {
                ok: Some(exists),
                ..SharedReply::default()
            })
        }
        ("caches", "set") => {
            let value = command
                .value_bytes()?
                .ok_or_else(|| CodeError::bad_request("cache set misses the value"))?;
            let admitted = ctx
                .shared
                .caches()
                .set(&base, scope, &key, value, ttl)
                .await?;
            Ok(SharedReply {
                ok: Some(admitted),
                ..SharedReply::default()
            })
        }
        ("caches", "remove") => {
            ctx.shared.caches().remove(&base, scope, &key).await?;
            Ok(SharedReply::default())
        }
        ("lockers", "lock") => lock(ctx, scope, &key, ttl, command.wait_ms).await,
        ("lockers", "unlock") => {
            let lease = command
                .lease
                .ok_or_else(|| CodeError::bad_request("unlock misses the lease"))?;
            unlock(ctx, &lease).await;
            Ok(SharedReply::default())
        }
        (capability, op) => Err(CodeError::bad_request(format!(
            "unknown shared operation '{capability}/{op}'"
        ))),
    }
}

async fn lock(
    ctx: &Context,
    scope: Scope,
    key: &[u8],
    ttl: Duration,
    wait_ms: Option<u64>,
) -> Result<SharedReply, CodeError> {
    let ttl = if ttl.is_zero() {
        MAX_LEASE_TTL
    } else {
        ttl.min(MAX_LEASE_TTL)
    };
    let wait = Duration::from_millis(wait_ms.unwrap_or(10_000).max(1));
    let base = ctx.base().with_timeout(wait);

    let mut locker = ctx
        .shared
        .lockers()
        .acquire(&base, scope, key, ttl)
        .await?;
    locker.lock(&base).await?;

    let lease = uuid::Uuid::new_v4().to_string();
    ctx.leases.lock().await.insert(lease.clone(), locker);

    // Reap the lease at the TTL in case the holder dies without unlocking.
    let reaper_ctx = ctx.clone();
    let reaper_lease = lease.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        unlock(&reaper_ctx, &reaper_lease).await;
    });

    Ok(SharedReply {
        lease: Some(lease),
        ..SharedReply::default()
    })
}

async fn unlock(ctx: &Context, lease: &str) {
    let locker = ctx.leases.lock().await.remove(lease);
    if let Some(mut locker) = locker {
        locker.unlock(&ctx.base()).await.ok();
    }
}
