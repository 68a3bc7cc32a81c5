//! API key management endpoints. All of them require `admin`.

use super::auth_middleware::require_permission;
use super::error::ApiError;
use crate::gate::permissions::Permission;
use crate::gate::{AccessGate, ApiKey, Caller, KeyUpdate, NewKey};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, patch},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct KeysAppState {
    pub gate: Arc<AccessGate>,
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub tier: Option<String>,
    pub permissions: Option<Vec<String>>,
}

/// Partial update body. Only fields present are changed.
#[derive(Deserialize)]
pub struct UpdateKeyRequest {
    pub name: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[derive(Serialize)]
struct CreatedKeyResponse {
    #[serde(flatten)]
    key: ApiKey,
    /// Shown once; only its hash is stored
    raw_key: String,
}

pub fn create_keys_router(state: KeysAppState) -> Router {
    Router::new()
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/:id", patch(update_key).delete(revoke_key))
        .with_state(Arc::new(state))
}

/// GET /api/keys
async fn list_keys(
    State(state): State<Arc<KeysAppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    let caller = require_permission(&headers, &state.gate, Permission::Admin)?;
    let keys = state.gate.list_keys(Caller::Key(&caller))?;
    Ok(Json(keys))
}

/// POST /api/keys
async fn create_key(
    State(state): State<Arc<KeysAppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), ApiError> {
    let caller = require_permission(&headers, &state.gate, Permission::Admin)?;

    let created = state.gate.create_key(
        Caller::Key(&caller),
        NewKey {
            name: req.name,
            tier: req.tier,
            permissions: req.permissions,
        },
    )?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedKeyResponse {
            key: created.key,
            raw_key: created.raw_key,
        }),
    ))
}

/// PATCH /api/keys/:id
async fn update_key(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateKeyRequest>,
) -> Result<Json<ApiKey>, ApiError> {
    let caller = require_permission(&headers, &state.gate, Permission::Admin)?;

    let updated = state.gate.update_key(
        Caller::Key(&caller),
        id,
        KeyUpdate {
            name: req.name,
            permissions: req.permissions,
            is_active: req.is_active,
        },
    )?;

    Ok(Json(updated))
}

/// DELETE /api/keys/:id (soft revoke)
async fn revoke_key(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let caller = require_permission(&headers, &state.gate, Permission::Admin)?;
    let key = state.gate.revoke_key(Caller::Key(&caller), id)?;

    Ok(Json(json!({
        "message": format!("API key '{}' revoked", key.name),
        "id": key.id,
    })))
}
