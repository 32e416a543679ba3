use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use fns::services::{
    InternalRequestEnvelope, InternalResponseEnvelope, NamesEntry, Trunk,
};
use fns::{header, Argument, CodeError, Document, Tracer, User};

use crate::middleware::header_str;
use crate::proxy;

use super::Context;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsQuery {
    pub refresh: Option<bool>,
    pub version: Option<String>,
}

/// Invoke a service fn.
/// `POST /services/:service/:fn`
pub async fn invoke_handler(
    State(ctx): State<Context>,
    Path((service, fn_name)): Path<(String, String)>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = header_str(&headers, header::REQUEST_ID)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match invoke(
        &ctx,
        &service,
        &fn_name,
        &request_id,
        connect.map(|ConnectInfo(addr)| addr),
        &headers,
        body,
    )
    .await
    {
        Ok(reply) => reply,
        Err(err) => error_reply(&ctx, &request_id, err),
    }
}

async fn invoke(
    ctx: &Context,
    service: &str,
    fn_name: &str,
    request_id: &str,
    remote: Option<SocketAddr>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, CodeError> {
    ctx.gate()?;

    let device_id = header_str(headers, header::DEVICE_ID)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CodeError::bad_request("X-Fns-Device-Id is required"))?
        .to_string();

    let accepted: fns::AcceptedVersions = match header_str(headers, header::REQUEST_VERSION) {
        Some(value) => value
            .parse()
            .map_err(|_| CodeError::not_acceptable("X-Fns-Request-Version does not parse"))?,
        None => Default::default(),
    };
    if !ctx.proxy && !accepted.allows(service, &ctx.node().version) {
        return Err(CodeError::not_acceptable(format!(
            "process version {} is out of the accepted range",
            ctx.node().version
        )));
    }

    let timeout = header_str(headers, header::REQUEST_TIMEOUT)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    let device_ip = device_ip(headers, remote);

    let internal = header_str(headers, header::REQUEST_INTERNAL)
        .map(|value| !value.is_empty())
        .unwrap_or(false);
    let (argument, trunk, user) = if internal {
        let signature = header_str(headers, header::REQUEST_SIGNATURE)
            .ok_or_else(|| CodeError::not_acceptable("X-Fns-Request-Signature is required"))?;
        if !ctx.signer.verify(&body, signature) {
            return Err(CodeError::not_acceptable("request signature mismatch"));
        }
        let envelope: InternalRequestEnvelope = serde_json::from_slice(&body)
            .map_err(|e| CodeError::not_acceptable(format!("internal envelope: {e}")))?;
        (envelope.body, Trunk::from(envelope.trunk), envelope.user)
    } else {
        (
            Argument::from_raw(body.to_vec())?,
            Trunk::default(),
            User::default(),
        )
    };

    let request = fns::Request::new(service, fn_name, argument)
        .with_id(request_id)
        .with_device(device_id, device_ip)
        .with_accepted_versions(accepted)
        .with_internal(internal)
        .with_trunk(trunk.clone())
        .with_user(user.clone());

    let tracer = Tracer::new(request_id);
    let mut call_ctx = ctx.base().with_tracer(tracer.clone());
    if let Some(timeout) = timeout {
        call_ctx = call_ctx.with_timeout(timeout);
    }

    let started = Instant::now();
    let result = if ctx.proxy {
        let proxy_node = header_str(headers, header::PROXY_NODE).map(str::to_string);
        proxy::forward(ctx, &call_ctx, proxy_node, request).await
    } else {
        ctx.endpoints.handle(&call_ctx, request).await
    };
    let latency = started.elapsed();

    let value = result?;
    let mut response = if internal {
        let envelope = InternalResponseEnvelope {
            user,
            trunk: trunk.snapshot(),
            span: tracer.root(),
            body: value,
        };
        Json(envelope).into_response()
    } else {
        let mut response = Response::new(Body::from(value.bytes().to_vec()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(max_age) = cache_max_age(ctx, service, fn_name) {
            if let Ok(value) = HeaderValue::from_str(&format!("max-age={max_age}")) {
                response.headers_mut().insert(CACHE_CONTROL, value);
            }
        }
        response
    };
    standard_headers(ctx, response.headers_mut(), request_id, Some(latency));
    Ok(response)
}

/// `Cache-Control` is emitted only for fns documented as readonly, which
/// keeps the response cache off mutating endpoints.
fn cache_max_age(ctx: &Context, service: &str, fn_name: &str) -> Option<u64> {
    let document = ctx.documents.get(service)?;
    let fn_document = document.fn_document(fn_name)?;
    if !fn_document.readonly {
        return None;
    }
    fn_document.cache_max_age_seconds
}

fn device_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(ip) = header_str(headers, header::DEVICE_IP).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }
    if let Some(forwarded) = header_str(headers, header::FORWARDED_FOR) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn standard_headers(
    ctx: &Context,
    headers: &mut HeaderMap,
    request_id: &str,
    latency: Option<Duration>,
) {
    let node = ctx.node();
    let mut put = |name: &str, value: String| {
        if let (Ok(name), Ok(value)) = (
            axum::http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    };
    put(header::ID, node.id.clone());
    put(header::NAME, node.name.clone());
    put(header::VERSION, node.version.to_string());
    put(header::REQUEST_ID, request_id.to_string());
    if let Some(latency) = latency {
        put(header::HANDLE_LATENCY, latency.as_millis().to_string());
    }
}

fn error_reply(ctx: &Context, request_id: &str, err: CodeError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("invoke failed: {err}");
    }
    let mut response = (status, Json(err)).into_response();
    standard_headers(ctx, response.headers_mut(), request_id, None);
    response
}

/// List hosted service names; a valid internal signature over the device
/// id reveals internal services too.
/// `GET /services/names`
pub async fn names_handler(State(ctx): State<Context>, headers: HeaderMap) -> Response {
    let trusted = verified_get(&ctx, &headers);
    let mut entries: BTreeMap<String, NamesEntry> = ctx
        .documents
        .values()
        .filter(|document| trusted || !document.internal)
        .map(|document| {
            (
                document.name.clone(),
                NamesEntry {
                    name: document.name.clone(),
                    internal: document.internal,
                    version: document.version,
                },
            )
        })
        .collect();
    if ctx.proxy {
        for entry in ctx.registrations().entries() {
            if !trusted && entry.internal {
                continue;
            }
            entries.entry(entry.name.clone()).or_insert(entry);
        }
    }
    Json(entries.into_values().collect::<Vec<_>>()).into_response()
}

/// Whether a body-less GET carries a valid internal signature; the signed
/// content is the device id.
fn verified_get(ctx: &Context, headers: &HeaderMap) -> bool {
    let internal = header_str(headers, header::REQUEST_INTERNAL)
        .map(|value| !value.is_empty())
        .unwrap_or(false);
    if !internal {
        return false;
    }
    let (Some(device_id), Some(signature)) = (
        header_str(headers, header::DEVICE_ID),
        header_str(headers, header::REQUEST_SIGNATURE),
    ) else {
        return false;
    };
    ctx.signer.verify(device_id.as_bytes(), signature)
}

/// Aggregated service documents, merged with peer documents in proxy or
/// cluster mode.
/// `GET /services/documents [?refresh=true]`
pub async fn documents_handler(
    State(ctx): State<Context>,
    Query(query): Query<DocsQuery>,
    headers: HeaderMap,
) -> Response {
    let trusted = verified_get(&ctx, &headers);
    let documents = aggregate_documents(&ctx, trusted, query.refresh.unwrap_or(false)).await;
    Json(documents).into_response()
}

async fn aggregate_documents(
    ctx: &Context,
    trusted: bool,
    refresh: bool,
) -> BTreeMap<String, Document> {
    let mut documents: BTreeMap<String, Document> = ctx
        .documents
        .iter()
        .filter(|(_, document)| trusted || !document.internal)
        .map(|(name, document)| (name.clone(), document.clone()))
        .collect();
    if ctx.proxy || !ctx.config.cluster.kind.is_empty() {
        for (name, document) in proxy::merged_documents(ctx, refresh).await {
            if document.internal && !trusted {
                continue;
            }
            documents.entry(name).or_insert(document);
        }
    }
    documents
}

/// OpenAPI rendering of the aggregated documents.
/// `GET /services/openapi [?version=X.Y.Z&refresh=true]`
pub async fn openapi_handler(
    State(ctx): State<Context>,
    Query(query): Query<DocsQuery>,
) -> Response {
    let documents = aggregate_documents(&ctx, false, query.refresh.unwrap_or(false)).await;
    let info_version = query
        .version
        .unwrap_or_else(|| ctx.node().version.to_string());

    let mut paths = serde_json::Map::new();
    for document in documents.values() {
        for fn_document in &document.fns {
            let mut operation = json!({
                "operationId": format!("{}_{}", document.name, fn_document.name),
                "summary": fn_document.description,
                "tags": [document.name],
                "responses": {
                    "200": {
                        "description": "succeed",
                        "content": { "application/json": {} }
                    }
                }
            });
            if let Some(schema) = &fn_document.argument {
                operation["requestBody"] = json!({
                    "content": { "application/json": { "schema": schema } }
                });
            }
            if let Some(schema) = &fn_document.result {
                operation["responses"]["200"]["content"]["application/json"] =
                    json!({ "schema": schema });
            }
            paths.insert(
                format!("/services/{}/{}", document.name, fn_document.name),
                json!({ "post": operation }),
            );
        }
    }

    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": ctx.config.name,
            "version": info_version,
        },
        "paths": paths,
    }))
    .into_response()
}

