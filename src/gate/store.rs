//! API key persistence using SQLite.
//!
//! Only the SHA-256 hash of a key's secret is stored. Rows are never deleted;
//! revocation flips `is_active`.

use super::permissions::Permission;
use super::ApiKey;
use crate::db;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

const SELECT_COLUMNS: &str = "SELECT id, secret_hash, name, tier, permissions, created_at, \
                              last_used_at, is_active FROM api_keys";

/// Write failures the gate distinguishes from plain storage errors.
#[derive(Debug)]
pub enum KeyWriteError {
    /// `name` (or, astronomically unlikely, the secret hash) is already taken
    Duplicate,
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for KeyWriteError {
    fn from(e: anyhow::Error) -> Self {
        KeyWriteError::Storage(e)
    }
}

fn map_write_error(e: rusqlite::Error, what: &str) -> KeyWriteError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            KeyWriteError::Duplicate
        }
        _ => KeyWriteError::Storage(anyhow::Error::new(e).context(what.to_string())),
    }
}

/// Fields of a key about to be inserted.
pub struct NewKeyRow<'a> {
    pub secret_hash: &'a str,
    pub name: &'a str,
    pub tier: Option<&'a str>,
    pub permissions: &'a BTreeSet<Permission>,
}

/// Changes to an existing key. `None` leaves a field as it is.
#[derive(Default)]
pub struct KeyChanges<'a> {
    pub name: Option<&'a str>,
    /// New explicit permissions; the tier reference is cleared
    pub permissions: Option<&'a BTreeSet<Permission>>,
    pub is_active: Option<bool>,
}

/// Persists API keys in SQLite.
pub struct ApiKeyStore {
    conn: Mutex<Connection>,
}

impl ApiKeyStore {
    /// Opens (or creates) the store at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("API key store lock poisoned"))
    }

    /// Inserts a new active key and returns the stored row.
    pub fn insert(&self, row: &NewKeyRow<'_>) -> Result<ApiKey, KeyWriteError> {
        let permissions = encode_permissions(row.permissions)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO api_keys (secret_hash, name, tier, permissions, created_at, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            "#,
            params![
                row.secret_hash,
                row.name,
                row.tier,
                permissions,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| map_write_error(e, "Failed to insert API key"))?;

        let id = conn.last_insert_rowid();
        drop(conn);

        self.get(id)?
            .ok_or_else(|| KeyWriteError::Storage(anyhow!("Inserted API key {} not found", id)))
    }

    /// Looks up a key by id.
    pub fn get(&self, id: i64) -> Result<Option<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .context("Failed to prepare query")?;
        let raw = stmt
            .query_row(params![id], RawKey::from_row)
            .optional()
            .context("Failed to read API key")?;
        raw.map(RawKey::into_key).transpose()
    }

    /// Looks up a key by the hash of its secret.
    pub fn find_by_hash(&self, secret_hash: &str) -> Result<Option<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE secret_hash = ?1", SELECT_COLUMNS))
            .context("Failed to prepare query")?;
        let raw = stmt
            .query_row(params![secret_hash], RawKey::from_row)
            .optional()
            .context("Failed to read API key")?;
        raw.map(RawKey::into_key).transpose()
    }

    /// Looks up a key by its unique name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE name = ?1", SELECT_COLUMNS))
            .context("Failed to prepare query")?;
        let raw = stmt
            .query_row(params![name], RawKey::from_row)
            .optional()
            .context("Failed to read API key")?;
        raw.map(RawKey::into_key).transpose()
    }

    /// Returns every key, newest first.
    pub fn list(&self) -> Result<Vec<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY created_at DESC, id DESC", SELECT_COLUMNS))
            .context("Failed to prepare list query")?;
        let rows = stmt
            .query_map([], RawKey::from_row)
            .context("Failed to query API keys")?
            .collect::<Result<Vec<RawKey>, _>>()
            .context("Failed to read API key rows")?;
        rows.into_iter().map(RawKey::into_key).collect()
    }

    /// Applies `changes` to a key in one transaction. Nothing is written if
    /// any statement fails.
    pub fn update(&self, id: i64, changes: &KeyChanges<'_>) -> Result<(), KeyWriteError> {
        let permissions = changes.permissions.map(encode_permissions).transpose()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        if let Some(name) = changes.name {
            tx.execute(
                "UPDATE api_keys SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .map_err(|e| map_write_error(e, "Failed to rename API key"))?;
        }
        if let Some(permissions) = &permissions {
            tx.execute(
                "UPDATE api_keys SET tier = NULL, permissions = ?1 WHERE id = ?2",
                params![permissions, id],
            )
            .context("Failed to update API key permissions")?;
        }
        if let Some(active) = changes.is_active {
            tx.execute(
                "UPDATE api_keys SET is_active = ?1 WHERE id = ?2",
                params![active, id],
            )
            .context("Failed to update API key status")?;
        }

        tx.commit().context("Failed to commit API key update")?;
        Ok(())
    }

    /// Activates or deactivates a key.
    pub fn set_active(&self, id: i64, active: bool) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE api_keys SET is_active = ?1 WHERE id = ?2",
                params![active, id],
            )
            .context("Failed to update API key status")?;
        Ok(())
    }

    /// Records a successful authentication.
    pub fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .context("Failed to update last_used_at")?;
        Ok(())
    }
}

fn encode_permissions(permissions: &BTreeSet<Permission>) -> Result<String> {
    // BTreeSet iteration keeps the stored list sorted
    serde_json::to_string(permissions).context("Failed to encode permissions")
}

/// Row as read from SQLite, before text columns are parsed.
struct RawKey {
    id: i64,
    secret_hash: String,
    name: String,
    tier: Option<String>,
    permissions: String,
    created_at: String,
    last_used_at: Option<String>,
    is_active: bool,
}

impl RawKey {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret_hash: row.get(1)?,
            name: row.get(2)?,
            tier: row.get(3)?,
            permissions: row.get(4)?,
            created_at: row.get(5)?,
            last_used_at: row.get(6)?,
            is_active: row.get(7)?,
        })
    }

    fn into_key(self) -> Result<ApiKey> {
        let permissions: BTreeSet<Permission> = serde_json::from_str(&self.permissions)
            .with_context(|| format!("Invalid permissions stored for API key {}", self.id))?;
        let created_at = parse_timestamp(&self.created_at)
            .with_context(|| format!("Failed to parse created_at for API key {}", self.id))?;
        let last_used_at = self
            .last_used_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .with_context(|| format!("Failed to parse last_used_at for API key {}", self.id))?;

        Ok(ApiKey {
            id: self.id,
            secret_hash: self.secret_hash,
            name: self.name,
            tier: self.tier,
            permissions,
            created_at,
            last_used_at,
            is_active: self.is_active,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
