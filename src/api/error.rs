//! HTTP error mapping.
//!
//! Every handler returns `Result<_, ApiError>`. Component errors convert with
//! `?`, which fixes the status code in one place.

use crate::auth::TokenError;
use crate::gate::GateError;
use crate::upstream::UpstreamError;
use crate::vault::VaultError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    /// Token exchange with the identity provider failed
    BadGateway(String),
    /// No upstream account linked yet
    ServiceUnavailable(String),
    /// Upstream timed out; the caller may retry
    GatewayTimeout(String),
    /// Upstream error passed through with its own status and body
    Upstream { status: StatusCode, body: Value },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "error": msg })),
            )
                .into_response(),
            ApiError::Forbidden(msg) => error_body(StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => error_body(StatusCode::CONFLICT, msg),
            ApiError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => error_body(StatusCode::BAD_GATEWAY, msg),
            ApiError::ServiceUnavailable(msg) => error_body(StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::GatewayTimeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": msg, "retryable": true })),
            )
                .into_response(),
            ApiError::Upstream { status, body } => (
                status,
                Json(json!({ "error": "Upstream request failed", "detail": body })),
            )
                .into_response(),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        }
    }
}

fn error_body(status: StatusCode, msg: String) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Unauthorized => ApiError::Unauthorized(e.to_string()),
            GateError::Forbidden(_) => ApiError::Forbidden(e.to_string()),
            GateError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            GateError::Conflict(msg) => ApiError::Conflict(msg),
            GateError::NotFound(msg) => ApiError::NotFound(format!("{} not found", msg)),
            GateError::Storage(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotAuthenticated => ApiError::ServiceUnavailable(e.to_string()),
            VaultError::UpstreamAuth(_) => ApiError::BadGateway(e.to_string()),
            VaultError::Crypto(_) | VaultError::Storage(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Vault(e) => e.into(),
            UpstreamError::Status { status, body } => ApiError::Upstream {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                body,
            },
            UpstreamError::Timeout => ApiError::GatewayTimeout(e.to_string()),
            UpstreamError::Transport(msg) => ApiError::BadGateway(msg),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}
