//! Job persistence using SQLite.

use super::{Job, JobStatus};
use crate::db;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Persists job records in SQLite.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Job store lock poisoned"))
    }

    /// Inserts a new `pending` job.
    pub fn create(&self, job_type: &str, total: usize) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            total,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.conn()?
            .execute(
                r#"
                INSERT INTO jobs (id, job_type, status, progress, total, created_at, updated_at)
                VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)
                "#,
                params![
                    job.id,
                    job.job_type,
                    job.status.as_str(),
                    job.total as i64,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert job")?;

        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, job_type, status, progress, total, result, error, created_at, updated_at
                FROM jobs WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read job")?;

        let Some((id, job_type, status, progress, total, result, error, created_at, updated_at)) =
            row
        else {
            return Ok(None);
        };

        let result = result
            .map(|r| serde_json::from_str::<Value>(&r))
            .transpose()
            .with_context(|| format!("Invalid result stored for job {}", id))?;

        Ok(Some(Job {
            status: status
                .parse()
                .map_err(|e: String| anyhow!(e))
                .with_context(|| format!("Invalid status stored for job {}", id))?,
            progress: progress.max(0) as usize,
            total: total.max(0) as usize,
            result,
            error,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            id,
            job_type,
        }))
    }

    /// Moves a job to `running` with zero progress.
    pub fn set_running(&self, id: &str, total: usize) -> Result<()> {
        self.update(
            id,
            "UPDATE jobs SET status = ?1, progress = 0, total = ?2, updated_at = ?3 WHERE id = ?4",
            params![JobStatus::Running.as_str(), total as i64, now(), id],
        )
    }

    pub fn set_progress(&self, id: &str, progress: usize) -> Result<()> {
        self.update(
            id,
            "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3",
            params![progress as i64, now(), id],
        )
    }

    /// Marks a job `complete` with its result ledger.
    pub fn complete(&self, id: &str, result: &Value) -> Result<()> {
        let encoded = serde_json::to_string(result).context("Failed to encode job result")?;
        self.update(
            id,
            "UPDATE jobs SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
            params![JobStatus::Complete.as_str(), encoded, now(), id],
        )
    }

    /// Marks a job `error`.
    pub fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.update(
            id,
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![JobStatus::Error.as_str(), error, now(), id],
        )
    }

    fn update(&self, id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let rows = self
            .conn()?
            .execute(sql, params)
            .with_context(|| format!("Failed to update job {}", id))?;
        if rows == 0 {
            bail!("Job {} not found", id);
        }
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("Failed to parse job timestamp")?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_store() -> JobStore {
        JobStore::new(":memory:").expect("Failed to create test store")
    }

    #[test]
    fn test_create_pending() {
        let store = create_test_store();
        let job = store.create("batch_delete", 3).unwrap();

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.job_type, "batch_delete");
        assert_eq!(loaded.progress, 0);
        assert_eq!(loaded.total, 3);
        assert!(loaded.result.is_none());
    }

    #[test]
    fn test_lifecycle() {
        let store = create_test_store();
        let job = store.create("batch_move", 2).unwrap();

        store.set_running(&job.id, 2).unwrap();
        assert_eq!(store.get(&job.id).unwrap().unwrap().status, JobStatus::Running);

        store.set_progress(&job.id, 2).unwrap();
        store
            .complete(&job.id, &json!({ "success": ["a", "b"], "failed": [] }))
            .unwrap();

        let done = store.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.progress, 2);
        assert_eq!(done.result.unwrap()["success"], json!(["a", "b"]));
    }

    #[test]
    fn test_fail_records_error() {
        let store = create_test_store();
        let job = store.create("batch_move", 1).unwrap();

        store.fail(&job.id, "disk full").unwrap();

        let failed = store.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_unknown_job() {
        let store = create_test_store();
        assert!(store.get("nope").unwrap().is_none());
        assert!(store.set_progress("nope", 1).is_err());
    }
}
