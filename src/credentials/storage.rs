//! SQLite storage for the single credential row.

use super::Credential;
use crate::db;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

/// Credential storage backed by SQLite.
///
/// # Invariant
/// At most one row exists. [`CredentialStore::replace`] clears the table and
/// inserts inside one transaction, so readers never observe zero-then-one or
/// two rows.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Opens (or creates) the store at `db_path`. `":memory:"` works for tests.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }

    /// Creates the credential, atomically replacing any prior one.
    pub fn replace(&self, credential: &Credential) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        tx.execute("DELETE FROM credentials", [])
            .context("Failed to clear credentials")?;
        tx.execute(
            r#"
            INSERT INTO credentials (
                identity, access_secret, refresh_secret,
                expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                credential.identity,
                credential.access_secret,
                credential.refresh_secret,
                credential.expires_at.to_rfc3339(),
                now,
                now,
            ],
        )
        .context("Failed to insert credential")?;

        tx.commit().context("Failed to commit credential")?;
        Ok(())
    }

    /// Returns the stored credential, if any.
    pub fn get(&self) -> Result<Option<Credential>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT identity, access_secret, refresh_secret, expires_at
                FROM credentials
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read credential")?;

        let Some((identity, access_secret, refresh_secret, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse expires_at timestamp")?;

        Ok(Some(Credential {
            identity,
            access_secret,
            refresh_secret,
            expires_at,
        }))
    }

    /// Updates the token pair of `identity` in place.
    ///
    /// `refresh_secret` of `None` keeps the stored refresh secret.
    /// Returns `false` if no credential with that identity exists (e.g. a
    /// sign-out raced the refresh).
    pub fn update_tokens(
        &self,
        identity: &str,
        access_secret: &str,
        refresh_secret: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    access_secret = ?1,
                    refresh_secret = COALESCE(?2, refresh_secret),
                    expires_at = ?3,
                    updated_at = ?4
                WHERE identity = ?5
                "#,
                params![
                    access_secret,
                    refresh_secret,
                    expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    identity,
                ],
            )
            .context("Failed to update credential")?;

        Ok(rows > 0)
    }

    /// Deletes every stored credential. Returns the number of rows removed.
    pub fn delete_all(&self) -> Result<usize> {
        let rows = self
            .conn()?
            .execute("DELETE FROM credentials", [])
            .context("Failed to delete credentials")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        CredentialStore::new(":memory:").expect("Failed to create test store")
    }

    fn sample(identity: &str) -> Credential {
        Credential {
            identity: identity.to_string(),
            access_secret: "enc-access".to_string(),
            refresh_secret: "enc-refresh".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn row_count(store: &CredentialStore) -> i64 {
        store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM credentials", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_replace_and_get() {
        let store = create_test_store();
        let cred = sample("alice@example.com");

        store.replace(&cred).unwrap();

        let loaded = store.get().unwrap().expect("credential missing");
        assert_eq!(loaded.identity, "alice@example.com");
        assert_eq!(loaded.access_secret, "enc-access");
        assert_eq!(loaded.refresh_secret, "enc-refresh");
        assert_eq!(loaded.expires_at.timestamp(), cred.expires_at.timestamp());
    }

    #[test]
    fn test_get_empty() {
        let store = create_test_store();
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn test_replace_keeps_single_row() {
        let store = create_test_store();

        store.replace(&sample("alice@example.com")).unwrap();
        store.replace(&sample("bob@example.com")).unwrap();
        store.replace(&sample("bob@example.com")).unwrap();

        assert_eq!(row_count(&store), 1);
        assert_eq!(store.get().unwrap().unwrap().identity, "bob@example.com");
    }

    #[test]
    fn test_update_tokens_keeps_refresh_when_absent() {
        let store = create_test_store();
        store.replace(&sample("alice@example.com")).unwrap();

        let new_expiry = Utc::now() + Duration::hours(2);
        let updated = store
            .update_tokens("alice@example.com", "enc-access-2", None, new_expiry)
            .unwrap();
        assert!(updated);

        let loaded = store.get().unwrap().unwrap();
        assert_eq!(loaded.access_secret, "enc-access-2");
        assert_eq!(loaded.refresh_secret, "enc-refresh");
        assert_eq!(loaded.expires_at.timestamp(), new_expiry.timestamp());
    }

    #[test]
    fn test_update_tokens_rotates_refresh() {
        let store = create_test_store();
        store.replace(&sample("alice@example.com")).unwrap();

        store
            .update_tokens(
                "alice@example.com",
                "enc-access-2",
                Some("enc-refresh-2"),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(store.get().unwrap().unwrap().refresh_secret, "enc-refresh-2");
    }

    #[test]
    fn test_update_tokens_unknown_identity() {
        let store = create_test_store();
        store.replace(&sample("alice@example.com")).unwrap();

        let updated = store
            .update_tokens("mallory@example.com", "x", None, Utc::now())
            .unwrap();
        assert!(!updated);
        assert_eq!(store.get().unwrap().unwrap().access_secret, "enc-access");
    }

    #[test]
    fn test_delete_all() {
        let store = create_test_store();
        store.replace(&sample("alice@example.com")).unwrap();

        assert_eq!(store.delete_all().unwrap(), 1);
        assert!(store.get().unwrap().is_none());
        assert_eq!(store.delete_all().unwrap(), 0);
    }
}
