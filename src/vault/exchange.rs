//! OAuth 2.0 token exchange against the identity provider.
//!
//! Handles the authorization-code and refresh-token grants. The vault talks to
//! the provider only through [`TokenExchange`], so tests can substitute an
//! in-process fake.

use crate::config::OAuthConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Scopes the provider grants implicitly. Sending them explicitly can make
/// the exchange fail, so they are stripped from every request.
pub const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];

/// Removes reserved scopes (case-insensitive) from the configured list.
pub fn request_scopes(configured: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter(|s| {
            !RESERVED_SCOPES
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(s))
        })
        .cloned()
        .collect()
}

/// Token endpoint response.
///
/// Successful grants carry `access_token`; failed ones usually carry `error`
/// and `error_description` instead.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenGrant {
    /// Best available explanation of a failed grant.
    pub fn failure_reason(&self) -> String {
        self.error_description
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Claims of the ID token.
    ///
    /// The token came straight from the provider's token endpoint over TLS, so
    /// the signature is not checked; the claims are only used as a label.
    pub fn id_claims(&self) -> Option<Value> {
        let payload = self.id_token.as_deref()?.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Account identity from the ID token: `preferred_username`, then `email`.
    pub fn identity(&self) -> Option<String> {
        let claims = self.id_claims()?;
        ["preferred_username", "email"]
            .iter()
            .find_map(|claim| claims.get(*claim).and_then(Value::as_str))
            .map(str::to_string)
    }
}

/// Authorization-code and refresh-token grants.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// URL the user is sent to for consent.
    fn authorization_url(&self, state: &str, scopes: &[String]) -> String;

    /// Exchanges an authorization code. Transport failures are `Err`;
    /// provider rejections come back as a grant without `access_token`.
    async fn exchange_code(&self, code: &str, scopes: &[String]) -> Result<TokenGrant>;

    /// Redeems a refresh token, with the same error split as `exchange_code`.
    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenGrant>;
}

/// [`TokenExchange`] over HTTP against the configured authority.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_url: String,
    token_url: String,
}

impl HttpTokenExchange {
    pub fn new(config: &OAuthConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            authorize_url: config.authorize_url(),
            token_url: config.token_url(),
        })
    }

    async fn post_form(&self, form: &HashMap<&str, &str>) -> Result<TokenGrant> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .context("Failed to send token request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read token response")?;

        match serde_json::from_str::<TokenGrant>(&body) {
            Ok(grant) => {
                tracing::debug!(
                    status = %status,
                    has_access_token = grant.access_token.is_some(),
                    has_refresh_token = grant.refresh_token.is_some(),
                    expires_in = ?grant.expires_in,
                    "Token endpoint responded"
                );
                Ok(grant)
            }
            // Non-JSON failure body: keep it as the error description
            Err(_) if !status.is_success() => Ok(TokenGrant {
                error: Some(status.to_string()),
                error_description: Some(body),
                ..Default::default()
            }),
            Err(e) => Err(e).context("Failed to parse token response"),
        }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    fn authorization_url(&self, state: &str, scopes: &[String]) -> String {
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}&state={}",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&with_reserved(scopes).join(" ")),
            urlencoding::encode(state)
        )
    }

    async fn exchange_code(&self, code: &str, scopes: &[String]) -> Result<TokenGrant> {
        let scope = with_reserved(scopes).join(" ");
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.redirect_uri.as_str());
        form.insert("client_id", self.client_id.as_str());
        form.insert("client_secret", self.client_secret.as_str());
        form.insert("scope", scope.as_str());

        tracing::debug!(token_url = %self.token_url, "Exchanging authorization code");
        self.post_form(&form).await
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenGrant> {
        let scope = scopes.join(" ");
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.client_id.as_str());
        form.insert("client_secret", self.client_secret.as_str());
        form.insert("scope", scope.as_str());

        tracing::debug!(token_url = %self.token_url, "Redeeming refresh token");
        self.post_form(&form).await
    }
}

/// Adds the scopes needed to receive an ID token and a refresh token on the
/// interactive leg. Only used for authorization, never for refresh.
fn with_reserved(scopes: &[String]) -> Vec<String> {
    let mut all = request_scopes(scopes);
    all.extend(RESERVED_SCOPES.iter().map(|s| s.to_string()));
    all
}
