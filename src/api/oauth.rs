//! Upstream account linking (OAuth 2.0 authorization code flow).
//!
//! 1. Operator opens GET /auth/login → redirected to the identity provider
//! 2. Provider redirects back to GET /auth/callback?code=…&state=…
//! 3. Code is exchanged and the credential stored encrypted
//! 4. Every upstream call now goes through the vault

use super::auth_middleware::{authenticate_request, require_permission};
use super::error::ApiError;
use crate::gate::permissions::Permission;
use crate::gate::AccessGate;
use crate::vault::{StateManager, TokenVault, VaultStatus};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct OAuthAppState {
    pub vault: Arc<TokenVault>,
    pub gate: Arc<AccessGate>,
    pub state_manager: StateManager,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct LinkedResponse {
    message: String,
    identity: String,
}

pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/status", get(status))
        .route("/auth/logout", post(logout))
        .with_state(Arc::new(state))
}

/// GET /auth/login
///
/// Redirects to the provider's consent page with a fresh single-use state.
async fn login(State(state): State<Arc<OAuthAppState>>) -> Redirect {
    let csrf_state = state.state_manager.issue();
    debug!("Redirecting to identity provider");
    Redirect::temporary(&state.vault.authorization_url(&csrf_state))
}

/// GET /auth/callback
async fn callback(
    State(state): State<Arc<OAuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<LinkedResponse>, ApiError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "Authorization declined");
        return Err(ApiError::BadRequest(format!(
            "Authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| ApiError::BadRequest("Missing 'state' parameter".to_string()))?;

    if !state.state_manager.consume(&csrf_state) {
        warn!("Invalid or expired login state");
        return Err(ApiError::BadRequest(
            "Invalid or expired state (possible CSRF attack)".to_string(),
        ));
    }

    let identity = state.vault.complete_authorization(&code).await?;

    info!(identity = %identity, "Authorization flow completed");
    Ok(Json(LinkedResponse {
        message: "Authentication successful".to_string(),
        identity,
    }))
}

/// GET /auth/status (any valid key)
async fn status(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<VaultStatus>, ApiError> {
    authenticate_request(&headers, &state.gate)?;
    Ok(Json(state.vault.status()?))
}

/// POST /auth/logout (admin)
async fn logout(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_permission(&headers, &state.gate, Permission::Admin)?;
    state.vault.sign_out()?;
    Ok(Json(json!({ "message": "Logged out successfully" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("csrf_state_456".to_string()));
        assert_eq!(callback.error, None);

        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }
}
