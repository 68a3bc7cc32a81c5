use super::auth_middleware::authenticate_request;
use super::error::ApiError;
use crate::gate::AccessGate;
use crate::jobs::{Job, JobExecutor};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct JobsAppState {
    pub gate: Arc<AccessGate>,
    pub executor: Arc<JobExecutor>,
}

pub fn create_jobs_router(state: JobsAppState) -> Router {
    Router::new()
        .route("/api/jobs/:id", get(get_job))
        .with_state(Arc::new(state))
}

/// GET /api/jobs/:id (any valid key)
async fn get_job(
    State(state): State<Arc<JobsAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    authenticate_request(&headers, &state.gate)?;

    state
        .executor
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job '{}' not found", id)))
}
