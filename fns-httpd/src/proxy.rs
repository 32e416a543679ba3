//! Proxy-mode forwarding: the same HTTP surface without local services,
//! routed through the registry by accepted versions, plus the merged peer
//! document cache both modes use.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fns::cluster::signed_get_headers;
use fns::{Argument, CodeError, Document};

use crate::gateway::Context;

/// Merged peer documents with their fetch time.
pub struct DocumentsSnapshot {
    at: Instant,
    documents: BTreeMap<String, Document>,
}

/// Forward an invocation to a peer. Dev proxies honour an explicit target
/// node, which requires dev mode and a signed (internal) request.
pub async fn forward(
    ctx: &Context,
    call_ctx: &fns::Context,
    proxy_node: Option<String>,
    request: fns::Request,
) -> Result<Argument, CodeError> {
    let registrations = ctx.registrations();
    let endpoint = match proxy_node.filter(|id| !id.is_empty()) {
        Some(node_id) => {
            if !ctx.config.proxy.enable_dev_mode {
                return Err(CodeError::not_acceptable(
                    "X-Fns-Proxy-Node requires dev mode",
                ));
            }
            if !request.internal {
                return Err(CodeError::not_acceptable(
                    "X-Fns-Proxy-Node requires a signed request",
                ));
            }
            registrations
                .get_exact(&request.service, &node_id)
                .ok_or_else(|| {
                    CodeError::not_found(format!(
                        "service '{}' not found at node '{node_id}'",
                        request.service
                    ))
                })?
        }
        None => registrations
            .get(&request.service, &request.accepted_versions)
            .ok_or_else(|| {
                CodeError::not_found(format!("service '{}' not found", request.service))
            })?,
    };
    if endpoint.internal() && !request.internal {
        return Err(CodeError::not_found(format!(
            "service '{}' not found",
            request.service
        )));
    }

    let call_ctx = call_ctx.clone();
    endpoint.request_sync(&call_ctx, Arc::new(request)).await
}

/// Fetch and merge `/services/documents` of every registered peer, cached
/// for the configured TTL; `refresh` bypasses the cache.
pub async fn merged_documents(ctx: &Context, refresh: bool) -> BTreeMap<String, Document> {
    let ttl = Duration::from_secs(ctx.config.transport.middlewares.cache.ttl_seconds.max(1));
    let mut snapshot = ctx.peer_documents.lock().await;
    if !refresh {
        if let Some(cached) = snapshot.as_ref() {
            if cached.at.elapsed() < ttl {
                return cached.documents.clone();
            }
        }
    }

    let mut merged: BTreeMap<String, Document> = BTreeMap::new();
    let client = reqwest::Client::new();
    for node in ctx.registrations().nodes() {
        match fetch_documents(ctx, &client, &node.address).await {
            Ok(documents) => {
                for (name, document) in documents {
                    match merged.get(&name) {
                        Some(existing) if existing.version >= document.version => {}
                        _ => {
                            merged.insert(name, document);
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!("documents of '{}' unavailable: {err}", node.id);
            }
        }
    }

    *snapshot = Some(DocumentsSnapshot {
        at: Instant::now(),
        documents: merged.clone(),
    });
    merged
}

async fn fetch_documents(
    ctx: &Context,
    client: &reqwest::Client,
    address: &str,
) -> Result<BTreeMap<String, Document>, CodeError> {
    let url = format!("http://{address}/services/documents");
    let mut request = client.get(url).timeout(Duration::from_secs(2));
    for (name, value) in signed_get_headers(&ctx.signer, &ctx.node().id) {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| CodeError::unavailable(format!("'{address}': {e}")))?;
    if !response.status().is_success() {
        return Err(CodeError::unavailable(format!(
            "'{address}' replied with status {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| CodeError::unavailable(format!("'{address}': {e}")))
}
