//! Bulk mail operations, run as background jobs.

use super::auth_middleware::require_permission;
use super::error::ApiError;
use crate::gate::permissions::Permission;
use crate::gate::AccessGate;
use crate::jobs::{ItemOperation, JobExecutor};
use crate::upstream::GraphClient;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct MailAppState {
    pub gate: Arc<AccessGate>,
    pub executor: Arc<JobExecutor>,
    pub client: Arc<GraphClient>,
    pub max_batch_items: usize,
}

#[derive(Deserialize)]
pub struct BatchMoveRequest {
    pub message_ids: Vec<String>,
    pub destination_folder_id: String,
}

#[derive(Deserialize)]
pub struct BatchDeleteRequest {
    pub message_ids: Vec<String>,
}

#[derive(Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub message: String,
}

pub fn create_mail_router(state: MailAppState) -> Router {
    Router::new()
        .route("/api/mail/batch/move", post(batch_move))
        .route("/api/mail/batch/delete", post(batch_delete))
        .with_state(Arc::new(state))
}

/// POST /api/mail/batch/move
async fn batch_move(
    State(state): State<Arc<MailAppState>>,
    headers: HeaderMap,
    Json(req): Json<BatchMoveRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    require_permission(&headers, &state.gate, Permission::WriteMail)?;
    validate_batch(&req.message_ids, state.max_batch_items)?;
    if req.destination_folder_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "destination_folder_id must not be empty".to_string(),
        ));
    }

    let client = Arc::clone(&state.client);
    let destination = req.destination_folder_id;
    let operation: ItemOperation = Arc::new(move |message_id: String| {
        let client = Arc::clone(&client);
        let body = json!({ "destinationId": destination });
        async move {
            let path = format!("/me/messages/{}/move", urlencoding::encode(&message_id));
            client.post(&path, &body).await?;
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    });

    let count = req.message_ids.len();
    let job_id = start_job(&state, "batch_move", req.message_ids, operation)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id,
            message: format!("Moving {} messages", count),
        }),
    ))
}

/// POST /api/mail/batch/delete
async fn batch_delete(
    State(state): State<Arc<MailAppState>>,
    headers: HeaderMap,
    Json(req): Json<BatchDeleteRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    require_permission(&headers, &state.gate, Permission::WriteMail)?;
    validate_batch(&req.message_ids, state.max_batch_items)?;

    let client = Arc::clone(&state.client);
    let operation: ItemOperation = Arc::new(move |message_id: String| {
        let client = Arc::clone(&client);
        async move {
            let path = format!("/me/messages/{}", urlencoding::encode(&message_id));
            client.delete(&path).await?;
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    });

    let count = req.message_ids.len();
    let job_id = start_job(&state, "batch_delete", req.message_ids, operation)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id,
            message: format!("Deleting {} messages", count),
        }),
    ))
}

fn validate_batch(ids: &[String], max: usize) -> Result<(), ApiError> {
    if ids.is_empty() {
        return Err(ApiError::BadRequest(
            "message_ids must not be empty".to_string(),
        ));
    }
    if ids.len() > max {
        return Err(ApiError::BadRequest(format!(
            "Too many items: {} (maximum {})",
            ids.len(),
            max
        )));
    }
    Ok(())
}

/// Enqueues and detaches the job. The handler does not wait for it.
fn start_job(
    state: &MailAppState,
    job_type: &str,
    items: Vec<String>,
    operation: ItemOperation,
) -> Result<String, ApiError> {
    let job = state.executor.enqueue(job_type, items.len())?;
    // Handle intentionally dropped: the job outlives this request
    let _ = state.executor.spawn(job.id.clone(), items, operation);
    Ok(job.id)
}
