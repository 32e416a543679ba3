use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use fns::CodeError;

/// Gateway error reply: the status comes from the error code, the body is
/// the JSON-encoded error object.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(#[from] pub CodeError);

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        code_error_response(self.0)
    }
}

pub fn code_error_response(err: CodeError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("{err}");
    }
    (status, Json(err)).into_response()
}
