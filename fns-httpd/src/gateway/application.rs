use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use localtime::LocalTime;
use serde_json::json;
use sysinfo::System;

use super::Context;

/// Liveness.
/// `GET /application/health`
pub async fn health_handler(State(ctx): State<Context>) -> impl IntoResponse {
    let node = ctx.node();
    Json(json!({
        "name": node.name,
        "id": node.id,
        "version": node.version,
        "launch": ctx.launch,
        "now": LocalTime::now(),
        "deviceIp": node.address,
    }))
}

/// Readiness plus a memory/CPU snapshot.
/// `GET /application/status`
pub async fn status_handler(State(ctx): State<Context>) -> Response {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let body = json!({
        "status": ctx.phase_name(),
        "uptimeMilliseconds": LocalTime::now().as_millis().saturating_sub(ctx.launch.as_millis()),
        "memory": {
            "totalBytes": sys.total_memory(),
            "usedBytes": sys.used_memory(),
        },
        "cpu": {
            "cores": sys.cpus().len(),
            "usagePercent": sys.global_cpu_info().cpu_usage(),
        },
        "workers": ctx.endpoints.workers().len(),
    });
    let status = match ctx.phase_name() {
        "serving" => StatusCode::OK,
        "draining" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
    };
    (status, Json(body)).into_response()
}
