pub mod health;
pub mod jobs;

use axum::{http::StatusCode, Json};
use cadence_scheduler::SchedulerError;
use serde_json::{json, Value};
use tracing::warn;

pub type ApiError = (StatusCode, Json<Value>);

/// `{"error": {"code", "message"}}` with a status derived from the error kind.
pub fn api_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::JobDisabled { .. } => StatusCode::CONFLICT,
        e if e.is_config() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    (
        status,
        Json(json!({
            "error": {
                "code": e.code(),
                "message": e.to_string(),
            }
        })),
    )
}
