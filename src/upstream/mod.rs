//! HTTP client for the upstream Graph API.
//!
//! Every call first asks the [`TokenVault`] for a valid access token, so a
//! token nearing expiry is refreshed transparently before the request goes out.

use crate::config::UpstreamConfig;
use crate::vault::{TokenVault, VaultError};
use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;

/// Upstream call errors
#[derive(Debug)]
pub enum UpstreamError {
    /// No usable access token
    Vault(VaultError),
    /// Upstream answered with a non-success status
    Status { status: u16, body: Value },
    /// Request exceeded the configured timeout; safe to retry
    Timeout,
    Transport(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Vault(e) => write!(f, "{}", e),
            UpstreamError::Status { status, body } => {
                write!(f, "Upstream returned {}: {}", status, body)
            }
            UpstreamError::Timeout => write!(f, "Upstream request timed out"),
            UpstreamError::Transport(msg) => write!(f, "Upstream request failed: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<VaultError> for UpstreamError {
    fn from(e: VaultError) -> Self {
        UpstreamError::Vault(e)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

pub struct GraphClient {
    http_client: Client,
    base_url: String,
    vault: Arc<TokenVault>,
}

impl GraphClient {
    pub fn new(config: &UpstreamConfig, vault: Arc<TokenVault>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("m365-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vault,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value, UpstreamError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, UpstreamError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, UpstreamError> {
        self.request(Method::DELETE, path, None).await
    }

    /// Sends one request. Empty and 204 responses yield `Value::Null`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let token = self.vault.access_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(method = %method, path = %path, error = %e, "Upstream request failed");
            UpstreamError::from(e)
        })?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::debug!(method = %method, path = %path, status = status.as_u16(), "Upstream error response");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: parse_error_body(&text),
            });
        }

        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Transport(format!("Invalid JSON from upstream: {}", e)))
    }
}

fn parse_error_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "message": text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::config::OAuthConfig;
    use crate::credentials::{Credential, CredentialStore};
    use crate::crypto::{self, VaultKey};
    use crate::vault::HttpTokenExchange;
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;

    fn linked_vault(linked: bool) -> Arc<TokenVault> {
        let store = Arc::new(CredentialStore::new(":memory:").unwrap());
        let key = VaultKey::from_bytes([3u8; 32]);
        if linked {
            store
                .replace(&Credential {
                    identity: "alice@contoso.com".to_string(),
                    access_secret: crypto::encrypt("graph-token", &key).unwrap(),
                    refresh_secret: crypto::encrypt("rt", &key).unwrap(),
                    expires_at: Utc::now() + Duration::hours(1),
                })
                .unwrap();
        }
        // Token is fresh, so the exchange is never contacted
        let exchange =
            HttpTokenExchange::new(&OAuthConfig::default(), StdDuration::from_secs(1)).unwrap();
        Arc::new(TokenVault::new(
            store,
            key,
            Arc::new(exchange),
            &[],
            Arc::new(TracingAuditSink),
        ))
    }

    fn client(base_url: &str, timeout_seconds: u64, linked: bool) -> GraphClient {
        let config = UpstreamConfig {
            base_url: base_url.to_string(),
            timeout_seconds,
        };
        GraphClient::new(&config, linked_vault(linked)).unwrap()
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me")
            .match_header("authorization", "Bearer graph-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"displayName": "Alice"}"#)
            .create_async()
            .await;

        let body = client(&server.url(), 5, true).get("/me").await.unwrap();

        mock.assert_async().await;
        assert_eq!(body["displayName"], "Alice");
    }

    #[tokio::test]
    async fn test_no_content_is_null() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/me/messages/m1")
            .with_status(204)
            .create_async()
            .await;

        let body = client(&server.url(), 5, true)
            .delete("/me/messages/m1")
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_error_status_passed_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/me/messages/m1/move")
            .with_status(404)
            .with_body(r#"{"error": {"code": "ErrorItemNotFound"}}"#)
            .create_async()
            .await;

        let err = client(&server.url(), 5, true)
            .post("/me/messages/m1/move", &json!({ "destinationId": "archive" }))
            .await
            .unwrap_err();

        match err {
            UpstreamError::Status { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body["error"]["code"], "ErrorItemNotFound");
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_body_wrapped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/me")
            .with_status(503)
            .with_body("Service Unavailable")
            .create_async()
            .await;

        match client(&server.url(), 5, true).get("/me").await {
            Err(UpstreamError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, json!({ "message": "Service Unavailable" }));
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unlinked_account_fails_before_sending() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/me").expect(0).create_async().await;

        let result = client(&server.url(), 5, false).get("/me").await;

        assert!(matches!(
            result,
            Err(UpstreamError::Vault(VaultError::NotAuthenticated))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_transport_error() {
        // Port 9 (discard) is closed on test hosts
        let result = client("http://127.0.0.1:9", 5, true).get("/me").await;
        assert!(matches!(
            result,
            Err(UpstreamError::Transport(_)) | Err(UpstreamError::Timeout)
        ));
    }
}
