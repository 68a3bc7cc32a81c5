//! SQLite schema and migrations.
//!
//! All three tables live in one database file. Stores open their own
//! connections and call [`migrate`] on open, so any store can be the first to
//! touch a fresh file. Migrations are additive: tables use `IF NOT EXISTS`, and
//! columns added after the first release go through [`ensure_column`].

use anyhow::{Context, Result};
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id             INTEGER PRIMARY KEY,
    identity       TEXT UNIQUE NOT NULL,
    access_secret  TEXT NOT NULL,        -- encrypted
    refresh_secret TEXT NOT NULL,        -- encrypted
    expires_at     TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    secret_hash TEXT UNIQUE NOT NULL,
    name        TEXT UNIQUE NOT NULL,
    permissions TEXT NOT NULL,           -- JSON array
    created_at  TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS jobs (
    id         TEXT PRIMARY KEY,
    job_type   TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'pending',
    progress   INTEGER NOT NULL DEFAULT 0,
    total      INTEGER NOT NULL DEFAULT 0,
    result     TEXT,                     -- JSON
    error      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Columns added after the initial schema: (table, column, declaration).
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("api_keys", "tier", "TEXT"),
    ("api_keys", "last_used_at", "TEXT"),
];

/// Opens a connection and brings the schema up to date.
pub fn open(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    // Job runners and request handlers write through separate connections
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;

    migrate(&conn)?;
    Ok(conn)
}

/// Creates missing tables and columns. Safe to run any number of times.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to create schema")?;

    for (table, column, decl) in ADDED_COLUMNS {
        ensure_column(conn, table, column, decl)?;
    }

    Ok(())
}

/// Adds `column` to `table` unless it already exists.
pub fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .with_context(|| format!("Failed to inspect table {}", table))?;

    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .with_context(|| format!("Failed to read columns of {}", table))?
        .collect::<Result<Vec<String>, _>>()
        .with_context(|| format!("Failed to read columns of {}", table))?
        .iter()
        .any(|name| name == column);

    if exists {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )
    .with_context(|| format!("Failed to add column {}.{}", table, column))?;

    tracing::info!(table = %table, column = %column, "Added column");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        assert!(columns(&conn, "credentials").contains(&"refresh_secret".to_string()));
        assert!(columns(&conn, "jobs").contains(&"progress".to_string()));

        let key_columns = columns(&conn, "api_keys");
        assert!(key_columns.contains(&"tier".to_string()));
        assert!(key_columns.contains(&"last_used_at".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let key_columns = columns(&conn, "api_keys");
        let tier_count = key_columns.iter().filter(|c| *c == "tier").count();
        assert_eq!(tier_count, 1);
    }

    #[test]
    fn test_ensure_column_upgrades_old_table() {
        let conn = Connection::open_in_memory().unwrap();
        // Table as it looked before tier / last_used_at existed
        conn.execute_batch(
            "CREATE TABLE api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret_hash TEXT UNIQUE NOT NULL,
                name TEXT UNIQUE NOT NULL,
                permissions TEXT NOT NULL,
                created_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            INSERT INTO api_keys (secret_hash, name, permissions, created_at)
            VALUES ('h', 'legacy', '[\"admin\"]', '2024-01-01T00:00:00Z');",
        )
        .unwrap();

        migrate(&conn).unwrap();

        let tier: Option<String> = conn
            .query_row("SELECT tier FROM api_keys WHERE name = 'legacy'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(tier.is_none());
    }
}
