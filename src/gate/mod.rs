//! Access gate: API-key authentication and permission checks.
//!
//! Callers present a raw API key as a bearer token. The gate hashes it,
//! resolves the stored [`ApiKey`], and checks the permission an operation
//! needs. Key lifecycle operations (create, update, revoke, list) require
//! `admin`, except when invoked by the local [`Caller::Operator`].

pub mod permissions;
pub mod store;


use crate::audit::{AuditEvent, AuditSink};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use permissions::{parse_permissions, Permission, TierTable};
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use store::{ApiKeyStore, KeyChanges, KeyWriteError, NewKeyRow};
use tracing::{info, warn};

/// Bytes of randomness in a raw API key
const RAW_KEY_BYTES: usize = 48;

/// An authorized caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKey {
    pub id: i64,
    #[serde(skip)]
    pub secret_hash: String,
    pub name: String,
    /// Tier the permissions were resolved from, if any
    pub tier: Option<String>,
    /// Effective permissions (tier-derived or explicit)
    pub permissions: BTreeSet<Permission>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl ApiKey {
    /// True if the key holds `permission`, directly or through `admin`.
    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }
}

/// Who is asking for a key lifecycle operation.
#[derive(Debug, Clone, Copy)]
pub enum Caller<'a> {
    /// An authenticated API key; must hold `admin`
    Key(&'a ApiKey),
    /// The local operator with direct database access (CLI)
    Operator,
}

/// Request to create a key. Exactly one of `tier` / `permissions` must be given.
#[derive(Debug, Clone, Default)]
pub struct NewKey {
    pub name: String,
    pub tier: Option<String>,
    pub permissions: Option<Vec<String>>,
}

/// Partial update of a key. Absent fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

/// A freshly created key. `raw_key` is never retrievable again.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub key: ApiKey,
    pub raw_key: String,
}

/// Gate errors
#[derive(Debug)]
pub enum GateError {
    /// Missing, unknown or inactive key
    Unauthorized,
    /// Valid key lacking a permission
    Forbidden(Permission),
    /// Malformed tier / permission input
    InvalidRequest(String),
    /// Name already used by another key
    Conflict(String),
    NotFound(String),
    Storage(anyhow::Error),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Unauthorized => write!(f, "Invalid or missing API key"),
            GateError::Forbidden(p) => write!(f, "Missing required permission: {}", p),
            GateError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            GateError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            GateError::NotFound(msg) => write!(f, "Not found: {}", msg),
            GateError::Storage(e) => write!(f, "Storage error: {:#}", e),
        }
    }
}

impl std::error::Error for GateError {}

impl From<anyhow::Error> for GateError {
    fn from(e: anyhow::Error) -> Self {
        GateError::Storage(e)
    }
}

/// One-way hash of a raw key (hex SHA-256).
pub fn hash_secret(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Generates a URL-safe raw key.
fn generate_raw_key() -> String {
    let mut buf = [0u8; RAW_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Authenticates and authorizes inbound callers.
pub struct AccessGate {
    store: Arc<ApiKeyStore>,
    tiers: TierTable,
    audit: Arc<dyn AuditSink>,
}

impl AccessGate {
    pub fn new(store: Arc<ApiKeyStore>, tiers: TierTable, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            tiers,
            audit,
        }
    }

    /// Resolves a raw bearer secret to its active key.
    ///
    /// Updates `last_used_at` on success; a failure to persist that is logged
    /// and otherwise ignored.
    pub fn authenticate(&self, bearer_secret: &str) -> Result<ApiKey, GateError> {
        let hash = hash_secret(bearer_secret);

        let mut key = match self.store.find_by_hash(&hash)? {
            Some(key) if key.is_active => key,
            _ => return Err(GateError::Unauthorized),
        };

        let now = Utc::now();
        match self.store.touch(key.id, now) {
            Ok(()) => key.last_used_at = Some(now),
            Err(e) => warn!(key_id = key.id, error = %e, "Failed to record API key use"),
        }

        Ok(key)
    }

    /// Checks that `key` holds `required`.
    pub fn authorize(&self, key: &ApiKey, required: Permission) -> Result<(), GateError> {
        if key.grants(required) {
            Ok(())
        } else {
            Err(GateError::Forbidden(required))
        }
    }

    fn authorize_admin(&self, caller: Caller<'_>) -> Result<(), GateError> {
        match caller {
            Caller::Key(key) => self.authorize(key, Permission::Admin),
            Caller::Operator => Ok(()),
        }
    }

    /// Resolves the permission set of a create request.
    fn resolve_new_permissions(
        &self,
        request: &NewKey,
    ) -> Result<BTreeSet<Permission>, GateError> {
        // An empty list sent alongside a tier counts as absent
        let permissions = request
            .permissions
            .as_ref()
            .filter(|tokens| !tokens.is_empty() || request.tier.is_none());

        match (&request.tier, permissions) {
            (Some(_), Some(_)) => Err(GateError::InvalidRequest(
                "Provide either 'tier' or 'permissions', not both".to_string(),
            )),
            (Some(tier), None) => self.tiers.resolve(tier).cloned().ok_or_else(|| {
                GateError::InvalidRequest(format!(
                    "Unknown tier '{}'. Valid tiers: {}",
                    tier,
                    self.tiers.names().join(", ")
                ))
            }),
            (None, Some(tokens)) => explicit_permissions(tokens),
            (None, None) => Err(GateError::InvalidRequest(
                "Provide either 'tier' or a non-empty 'permissions' list".to_string(),
            )),
        }
    }

    /// Creates a key and returns its raw secret (once).
    pub fn create_key(&self, caller: Caller<'_>, request: NewKey) -> Result<CreatedKey, GateError> {
        self.authorize_admin(caller)?;

        let name = validate_name(&request.name)?;
        let permissions = self.resolve_new_permissions(&request)?;

        if self.store.find_by_name(name)?.is_some() {
            return Err(duplicate_name(name));
        }

        let raw_key = generate_raw_key();
        let secret_hash = hash_secret(&raw_key);

        let key = self
            .store
            .insert(&NewKeyRow {
                secret_hash: &secret_hash,
                name,
                tier: request.tier.as_deref(),
                permissions: &permissions,
            })
            .map_err(|e| match e {
                KeyWriteError::Duplicate => duplicate_name(name),
                KeyWriteError::Storage(e) => GateError::Storage(e),
            })?;

        info!(key_id = key.id, name = %key.name, tier = ?key.tier, "API key created");
        self.audit.record(
            AuditEvent::new("api_keys", "create").details(json!({ "name": key.name })),
        );

        Ok(CreatedKey { key, raw_key })
    }

    /// Lists every key (active and revoked), newest first.
    pub fn list_keys(&self, caller: Caller<'_>) -> Result<Vec<ApiKey>, GateError> {
        self.authorize_admin(caller)?;
        Ok(self.store.list()?)
    }

    /// Finds a key by name (operator tooling).
    pub fn find_key(&self, caller: Caller<'_>, name: &str) -> Result<ApiKey, GateError> {
        self.authorize_admin(caller)?;
        self.store
            .find_by_name(name)?
            .ok_or_else(|| GateError::NotFound(format!("API key '{}'", name)))
    }

    /// Applies a partial update to a key.
    ///
    /// Updating permissions makes them explicit: any tier reference is cleared.
    pub fn update_key(
        &self,
        caller: Caller<'_>,
        id: i64,
        update: KeyUpdate,
    ) -> Result<ApiKey, GateError> {
        self.authorize_admin(caller)?;

        let existing = self
            .store
            .get(id)?
            .ok_or_else(|| GateError::NotFound(format!("API key {}", id)))?;

        // Validate everything before writing anything
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let permissions = update
            .permissions
            .as_ref()
            .map(|tokens| explicit_permissions(tokens))
            .transpose()?;

        self.store
            .update(
                id,
                &KeyChanges {
                    // Unchanged names skip the write
                    name: name.filter(|n| *n != existing.name),
                    permissions: permissions.as_ref(),
                    is_active: update.is_active,
                },
            )
            .map_err(|e| match e {
                KeyWriteError::Duplicate => duplicate_name(name.unwrap_or_default()),
                KeyWriteError::Storage(e) => GateError::Storage(e),
            })?;

        let updated = self
            .store
            .get(id)?
            .ok_or_else(|| GateError::NotFound(format!("API key {}", id)))?;

        info!(key_id = id, name = %updated.name, "API key updated");
        self.audit
            .record(AuditEvent::new("api_keys", "update").details(json!({ "key_id": id })));

        Ok(updated)
    }

    /// Soft-deletes a key. The row is kept for the audit trail.
    pub fn revoke_key(&self, caller: Caller<'_>, id: i64) -> Result<ApiKey, GateError> {
        self.authorize_admin(caller)?;

        let mut key = self
            .store
            .get(id)?
            .ok_or_else(|| GateError::NotFound(format!("API key {}", id)))?;

        self.store.set_active(id, false)?;
        key.is_active = false;

        info!(key_id = id, name = %key.name, "API key revoked");
        self.audit.record(
            AuditEvent::new("api_keys", "revoke").details(json!({ "key_id": id, "name": key.name })),
        );

        Ok(key)
    }
}

fn validate_name(name: &str) -> Result<&str, GateError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GateError::InvalidRequest(
            "Key name must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

fn explicit_permissions(tokens: &[String]) -> Result<BTreeSet<Permission>, GateError> {
    if tokens.is_empty() {
        return Err(GateError::InvalidRequest(
            "Provide either 'tier' or a non-empty 'permissions' list".to_string(),
        ));
    }
    parse_permissions(tokens).map_err(|invalid| {
        GateError::InvalidRequest(format!("Invalid permissions: {}", invalid.join(", ")))
    })
}

fn duplicate_name(name: &str) -> GateError {
    GateError::Conflict(format!("An API key with name '{}' already exists", name))
}
