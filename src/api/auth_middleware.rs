use super::error::ApiError;
use crate::auth::extract_bearer_token;
use crate::gate::permissions::Permission;
use crate::gate::{AccessGate, ApiKey};
use axum::http::HeaderMap;

#[cfg(test)]
mod tests;

/// Resolves the request's bearer key to an active API key.
///
/// # Errors
/// - Unauthorized: missing or malformed header, unknown or inactive key
pub fn authenticate_request(headers: &HeaderMap, gate: &AccessGate) -> Result<ApiKey, ApiError> {
    let secret = extract_bearer_token(headers)?;
    Ok(gate.authenticate(&secret)?)
}

/// Authenticates the request and checks it holds `permission`.
///
/// # Errors
/// - Unauthorized: as [`authenticate_request`]
/// - Forbidden: key lacks `permission` (and `admin`)
pub fn require_permission(
    headers: &HeaderMap,
    gate: &AccessGate,
    permission: Permission,
) -> Result<ApiKey, ApiError> {
    let key = authenticate_request(headers, gate)?;
    gate.authorize(&key, permission)?;
    Ok(key)
}
