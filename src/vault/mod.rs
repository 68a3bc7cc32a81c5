//! Token vault: the single upstream credential and its silent refresh.
//!
//! The vault is the only component that sees plaintext upstream tokens. It
//! encrypts them with the [`VaultKey`] before they reach the
//! [`CredentialStore`], and decrypts on the way out.
//!
//! Refresh is not serialized. Two calls racing past the same expiring token
//! may both redeem the refresh token; each gets a usable access token and the
//! last write wins in storage.

pub mod exchange;
mod state;


pub use exchange::{request_scopes, HttpTokenExchange, TokenExchange, TokenGrant, RESERVED_SCOPES};
pub use state::{run_state_cleanup, StateManager};

use crate::audit::{AuditEvent, AuditSink};
use crate::credentials::{Credential, CredentialStore};
use crate::crypto::{self, CryptoError, VaultKey};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Refresh this long before the stored expiry
const REFRESH_MARGIN_SECONDS: i64 = 300;

/// Token lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Largest `expires_in` accepted from the provider
const MAX_EXPIRES_IN: i64 = i32::MAX as i64;

/// Vault errors
#[derive(Debug)]
pub enum VaultError {
    /// No upstream account is linked yet
    NotAuthenticated,
    /// Token exchange failed; carries the provider's description
    UpstreamAuth(String),
    /// Stored secret could not be decrypted (operator secret changed?)
    Crypto(CryptoError),
    Storage(anyhow::Error),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::NotAuthenticated => {
                write!(f, "No upstream account linked. Visit /auth/login first")
            }
            VaultError::UpstreamAuth(msg) => write!(f, "Upstream authentication failed: {}", msg),
            VaultError::Crypto(e) => write!(f, "Credential decryption failed: {}", e),
            VaultError::Storage(e) => write!(f, "Credential storage error: {:#}", e),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        VaultError::Crypto(e)
    }
}

impl From<anyhow::Error> for VaultError {
    fn from(e: anyhow::Error) -> Self {
        VaultError::Storage(e)
    }
}

/// What `/auth/status` reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VaultStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct TokenVault {
    store: Arc<CredentialStore>,
    key: VaultKey,
    exchange: Arc<dyn TokenExchange>,
    /// Delegated scopes with reserved ones already removed
    scopes: Vec<String>,
    audit: Arc<dyn AuditSink>,
}

impl TokenVault {
    pub fn new(
        store: Arc<CredentialStore>,
        key: VaultKey,
        exchange: Arc<dyn TokenExchange>,
        scopes: &[String],
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            key,
            exchange,
            scopes: request_scopes(scopes),
            audit,
        }
    }

    /// Consent URL for a login carrying `state`.
    pub fn authorization_url(&self, state: &str) -> String {
        self.exchange.authorization_url(state, &self.scopes)
    }

    /// Redeems an authorization code and stores the resulting credential,
    /// replacing any previous one. Returns the linked identity.
    pub async fn complete_authorization(&self, code: &str) -> Result<String, VaultError> {
        let grant = match self.exchange.exchange_code(code, &self.scopes).await {
            Ok(grant) => grant,
            Err(e) => {
                let reason = format!("{:#}", e);
                self.audit
                    .record(AuditEvent::new("auth", "login").failed(reason.clone()));
                return Err(VaultError::UpstreamAuth(reason));
            }
        };

        let Some(access_token) = grant.access_token.as_deref() else {
            let reason = grant.failure_reason();
            warn!(error = %reason, "Authorization code exchange rejected");
            self.audit
                .record(AuditEvent::new("auth", "login").failed(reason.clone()));
            return Err(VaultError::UpstreamAuth(reason));
        };

        let Some(expires_at) = expiry_from(&grant) else {
            let reason = invalid_expiry_reason(&grant);
            warn!(error = %reason, "Authorization code exchange returned an unusable grant");
            self.audit
                .record(AuditEvent::new("auth", "login").failed(reason.clone()));
            return Err(VaultError::UpstreamAuth(reason));
        };

        let identity = grant.identity().unwrap_or_else(|| "unknown".to_string());
        let refresh_token = grant.refresh_token.as_deref().unwrap_or("");

        let credential = Credential {
            identity: identity.clone(),
            access_secret: crypto::encrypt(access_token, &self.key)?,
            refresh_secret: crypto::encrypt(refresh_token, &self.key)?,
            expires_at,
        };
        self.store.replace(&credential)?;

        info!(identity = %identity, expires_at = %credential.expires_at, "Upstream account linked");
        self.audit
            .record(AuditEvent::new("auth", "login").identity(identity.clone()));

        Ok(identity)
    }

    /// A valid access token for the linked account, refreshing if needed.
    pub async fn access_token(&self) -> Result<String, VaultError> {
        let credential = self.store.get()?.ok_or(VaultError::NotAuthenticated)?;
        self.get_valid_access_token(&credential).await
    }

    /// Returns the decrypted access token of `credential`, first refreshing it
    /// if it expires within the refresh margin.
    ///
    /// A failed refresh leaves the stored credential untouched.
    pub async fn get_valid_access_token(
        &self,
        credential: &Credential,
    ) -> Result<String, VaultError> {
        let refresh_at = credential.expires_at - Duration::seconds(REFRESH_MARGIN_SECONDS);
        if Utc::now() < refresh_at {
            return Ok(crypto::decrypt(&credential.access_secret, &self.key)?);
        }

        self.refresh(credential).await
    }

    async fn refresh(&self, credential: &Credential) -> Result<String, VaultError> {
        let identity = credential.identity.as_str();
        let refresh_token = crypto::decrypt(&credential.refresh_secret, &self.key)?;
        if refresh_token.is_empty() {
            return Err(self.refresh_failed(identity, "No refresh token stored; sign in again"));
        }

        info!(identity = %identity, expires_at = %credential.expires_at, "Refreshing upstream token");

        let grant = match self.exchange.refresh(&refresh_token, &self.scopes).await {
            Ok(grant) => grant,
            Err(e) => return Err(self.refresh_failed(identity, &format!("{:#}", e))),
        };

        let Some(access_token) = grant.access_token.as_deref() else {
            return Err(self.refresh_failed(identity, &grant.failure_reason()));
        };

        let Some(expires_at) = expiry_from(&grant) else {
            return Err(self.refresh_failed(identity, &invalid_expiry_reason(&grant)));
        };

        let access_secret = crypto::encrypt(access_token, &self.key)?;
        // Providers may not rotate the refresh token; keep the old one then
        let refresh_secret = grant
            .refresh_token
            .as_deref()
            .map(|t| crypto::encrypt(t, &self.key))
            .transpose()?;

        let updated = self.store.update_tokens(
            identity,
            &access_secret,
            refresh_secret.as_deref(),
            expires_at,
        )?;
        if !updated {
            warn!(identity = %identity, "Credential removed during refresh");
            return Err(VaultError::NotAuthenticated);
        }

        info!(
            identity = %identity,
            expires_at = %expires_at,
            rotated = refresh_secret.is_some(),
            "Upstream token refreshed"
        );
        self.audit
            .record(AuditEvent::new("auth", "token_refresh").identity(identity));

        Ok(access_token.to_string())
    }

    fn refresh_failed(&self, identity: &str, reason: &str) -> VaultError {
        warn!(identity = %identity, error = %reason, "Upstream token refresh failed");
        self.audit.record(
            AuditEvent::new("auth", "token_refresh")
                .identity(identity)
                .failed(reason),
        );
        VaultError::UpstreamAuth(reason.to_string())
    }

    pub fn status(&self) -> Result<VaultStatus, VaultError> {
        Ok(match self.store.get()? {
            Some(credential) => VaultStatus {
                authenticated: true,
                identity: Some(credential.identity),
                expires_at: Some(credential.expires_at),
            },
            None => VaultStatus {
                authenticated: false,
                identity: None,
                expires_at: None,
            },
        })
    }

    /// Forgets the linked account. Returns how many credentials were removed.
    pub fn sign_out(&self) -> Result<usize, VaultError> {
        let identity = self.store.get()?.map(|c| c.identity);
        let removed = self.store.delete_all()?;

        info!(removed, "Upstream account signed out");
        let mut event = AuditEvent::new("auth", "logout");
        if let Some(identity) = identity {
            event = event.identity(identity);
        }
        self.audit.record(event);

        Ok(removed)
    }
}

/// Expiry of a grant, or `None` if `expires_in` is negative or out of range.
fn expiry_from(grant: &TokenGrant) -> Option<DateTime<Utc>> {
    let expires_in = grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
    if !(0..=MAX_EXPIRES_IN).contains(&expires_in) {
        return None;
    }
    Utc::now().checked_add_signed(Duration::try_seconds(expires_in)?)
}

fn invalid_expiry_reason(grant: &TokenGrant) -> String {
    format!(
        "Token endpoint returned an invalid expires_in: {}",
        grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)
    )
}
