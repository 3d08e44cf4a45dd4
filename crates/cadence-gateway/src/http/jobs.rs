//! Job admin endpoints under `/api/v1`.
//!
//! Every handler is a thin wrapper over [`JobCache`]; scheduling semantics
//! live in `cadence-scheduler`.
//!
//! [`JobCache`]: cadence_scheduler::JobCache

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use cadence_scheduler::{JobRecord, JobStat, NewJob, SchedulerError, SchedulerStats};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{api_error, ApiError};
use crate::app::AppState;

/// GET /api/v1/job/
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobRecord>> {
    let mut jobs: Vec<JobRecord> = state
        .cache
        .get_all()
        .iter()
        .map(|job| job.to_record())
        .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Json(jobs)
}

/// POST /api/v1/job/: returns 201 with the stored job.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewJob>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    let job = state.cache.add_job(new).map_err(api_error)?;
    info!(job_id = %job.id(), "job created via API");
    Ok((StatusCode::CREATED, Json(job.to_record())))
}

/// GET /api/v1/job/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state.cache.get(&id).map_err(api_error)?;
    Ok(Json(job.to_record()))
}

/// DELETE /api/v1/job/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.cache.delete(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/job/stats/{id}: retained run history, oldest first.
pub async fn job_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobStat>>, ApiError> {
    let job = state.cache.get(&id).map_err(api_error)?;
    Ok(Json(job.stats()))
}

/// POST /api/v1/job/start/{id}: run now in the background.
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = state.cache.get(&id).map_err(api_error)?;
    if job.is_disabled() {
        return Err(api_error(SchedulerError::JobDisabled { id }));
    }
    state.cache.start_job(&id).map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "started": true }))))
}

/// POST /api/v1/job/enable/{id}
pub async fn enable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state.cache.enable(&id).map_err(api_error)?;
    Ok(Json(job.to_record()))
}

/// POST /api/v1/job/disable/{id}
pub async fn disable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state.cache.disable(&id).map_err(api_error)?;
    Ok(Json(job.to_record()))
}

/// GET /api/v1/stats
pub async fn scheduler_stats(State(state): State<Arc<AppState>>) -> Json<SchedulerStats> {
    Json(state.cache.stats())
}
