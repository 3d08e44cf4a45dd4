use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::config::CadenceConfig;
use cadence_scheduler::JobCache;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::http::{health, jobs};

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub cache: Arc<JobCache>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: CadenceConfig, cache: Arc<JobCache>) -> Self {
        Self {
            config,
            cache,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/stats", get(jobs::scheduler_stats))
        .route("/api/v1/job/", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/api/v1/job/{id}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/v1/job/stats/{id}", get(jobs::job_stats))
        .route("/api/v1/job/start/{id}", post(jobs::start_job))
        .route("/api/v1/job/enable/{id}", post(jobs::enable_job))
        .route("/api/v1/job/disable/{id}", post(jobs::disable_job))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
