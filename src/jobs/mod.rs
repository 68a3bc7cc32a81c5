//! Detached batch jobs with progress and a per-item failure ledger.
//!
//! A request handler [`enqueue`](JobExecutor::enqueue)s a job and hands the
//! item list to [`spawn`](JobExecutor::spawn); it never awaits completion.
//! The spawned task opens its own database connection and owns the job row
//! from then on.
//!
//! ```text
//! pending ──▶ running ──▶ complete   (every item attempted, some may have failed)
//!                    └──▶ error      (the runner itself broke: storage, etc.)
//! ```

mod store;

pub use store::JobStore;

use crate::audit::{AuditEvent, AuditSink};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("Unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One failed item in a job's result ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub item: String,
    pub error: String,
}

/// Result ledger of a completed job, each list in input order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub success: Vec<String>,
    pub failed: Vec<FailedItem>,
}

/// Per-item work. Must own everything it touches: it runs after the request
/// that created it has returned.
pub type ItemOperation = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct JobExecutor {
    db_path: String,
    store: JobStore,
    audit: Arc<dyn AuditSink>,
}

impl JobExecutor {
    pub fn new(db_path: &str, audit: Arc<dyn AuditSink>) -> Result<Self> {
        Ok(Self {
            db_path: db_path.to_string(),
            store: JobStore::new(db_path)?,
            audit,
        })
    }

    /// Records a new `pending` job for `total` items.
    pub fn enqueue(&self, job_type: &str, total: usize) -> Result<Job> {
        let job = self.store.create(job_type, total)?;
        info!(job_id = %job.id, job_type = %job_type, total, "Job enqueued");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id)
    }

    /// Runs `items` through `operation` on a detached task.
    ///
    /// Dropping the returned handle does not cancel the job.
    pub fn spawn(&self, job_id: String, items: Vec<String>, operation: ItemOperation) -> JoinHandle<()> {
        let db_path = self.db_path.clone();
        let audit = Arc::clone(&self.audit);

        tokio::spawn(async move {
            run(&db_path, audit.as_ref(), &job_id, items, operation).await;
        })
    }
}

async fn run(
    db_path: &str,
    audit: &dyn AuditSink,
    job_id: &str,
    items: Vec<String>,
    operation: ItemOperation,
) {
    let store = match JobStore::new(db_path) {
        Ok(store) => store,
        Err(e) => {
            // Nowhere to persist the failure; log and audit only
            error!(job_id = %job_id, error = %format!("{:#}", e), "Job runner could not open storage");
            audit.record(
                AuditEvent::new("jobs", "error")
                    .failed(format!("{:#}", e))
                    .details(json!({ "job_id": job_id, "error": format!("{:#}", e) })),
            );
            return;
        }
    };

    match drive(&store, job_id, items, operation).await {
        Ok(outcome) => {
            info!(
                job_id = %job_id,
                succeeded = outcome.success.len(),
                failed = outcome.failed.len(),
                "Job complete"
            );
            audit.record(AuditEvent::new("jobs", "complete").details(json!({
                "job_id": job_id,
                "succeeded": outcome.success.len(),
                "failed": outcome.failed.len(),
            })));
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!(job_id = %job_id, error = %message, "Job failed");
            if let Err(e) = store.fail(job_id, &message) {
                error!(job_id = %job_id, error = %format!("{:#}", e), "Failed to record job error");
            }
            audit.record(
                AuditEvent::new("jobs", "error")
                    .failed(message.clone())
                    .details(json!({ "job_id": job_id, "error": message })),
            );
        }
    }
}

/// Attempts every item in order. Only storage failures abort the loop.
async fn drive(
    store: &JobStore,
    job_id: &str,
    items: Vec<String>,
    operation: ItemOperation,
) -> Result<JobOutcome> {
    store.set_running(job_id, items.len())?;

    let mut outcome = JobOutcome::default();

    for (index, item) in items.into_iter().enumerate() {
        let attempt = AssertUnwindSafe(operation(item.clone())).catch_unwind().await;

        match attempt {
            Ok(Ok(())) => outcome.success.push(item),
            Ok(Err(e)) => {
                let error = format!("{:#}", e);
                warn!(job_id = %job_id, item = %item, error = %error, "Job item failed");
                outcome.failed.push(FailedItem { item, error });
            }
            Err(_) => {
                warn!(job_id = %job_id, item = %item, "Job item panicked");
                outcome.failed.push(FailedItem {
                    item,
                    error: "Operation panicked".to_string(),
                });
            }
        }

        store.set_progress(job_id, index + 1)?;
    }

    let result = serde_json::to_value(&outcome).context("Failed to encode job result")?;
    store.complete(job_id, &result)?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::RecordingSink;
    use anyhow::anyhow;
    use tempfile::TempDir;

    fn create_test_executor() -> (JobExecutor, Arc<RecordingSink>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        let sink = Arc::new(RecordingSink::default());
        let executor = JobExecutor::new(path.to_str().unwrap(), sink.clone()).unwrap();
        (executor, sink, dir)
    }

    fn items(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn failing_on(bad: &'static str) -> ItemOperation {
        Arc::new(move |item: String| {
            async move {
                if item == bad {
                    Err(anyhow!("upstream said no to {}", item))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_partial_failure_completes_job() {
        let (executor, sink, _dir) = create_test_executor();
        let job = executor.enqueue("batch_delete", 5).unwrap();

        executor
            .spawn(
                job.id.clone(),
                items(&["m1", "m2", "m3", "m4", "m5"]),
                failing_on("m3"),
            )
            .await
            .unwrap();

        let done = executor.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.progress, 5);
        assert_eq!(done.total, 5);
        assert!(done.error.is_none());

        let outcome: JobOutcome = serde_json::from_value(done.result.unwrap()).unwrap();
        assert_eq!(outcome.success, items(&["m1", "m2", "m4", "m5"]));
        assert_eq!(
            outcome.failed,
            vec![FailedItem {
                item: "m3".to_string(),
                error: "upstream said no to m3".to_string(),
            }]
        );

        assert_eq!(sink.actions(), vec![("jobs/complete".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_all_items_failing_still_completes() {
        let (executor, _sink, _dir) = create_test_executor();
        let job = executor.enqueue("batch_move", 2).unwrap();

        let always_fail: ItemOperation =
            Arc::new(|_item: String| async { Err::<(), _>(anyhow!("timeout")) }.boxed());
        executor
            .spawn(job.id.clone(), items(&["a", "b"]), always_fail)
            .await
            .unwrap();

        let done = executor.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.result.unwrap()["failed"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_item_recorded_as_failure() {
        let (executor, _sink, _dir) = create_test_executor();
        let job = executor.enqueue("batch_move", 2).unwrap();

        let panics_on_a: ItemOperation = Arc::new(|item: String| {
            async move {
                if item == "a" {
                    panic!("boom");
                }
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        executor
            .spawn(job.id.clone(), items(&["a", "b"]), panics_on_a)
            .await
            .unwrap();

        let done = executor.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        let outcome: JobOutcome = serde_json::from_value(done.result.unwrap()).unwrap();
        assert_eq!(outcome.success, items(&["b"]));
        assert_eq!(outcome.failed[0].item, "a");
    }

    #[tokio::test]
    async fn test_job_survives_dropped_handle() {
        let (executor, _sink, _dir) = create_test_executor();
        let job = executor.enqueue("batch_delete", 1).unwrap();

        let slow: ItemOperation = Arc::new(|_item: String| {
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        drop(executor.spawn(job.id.clone(), items(&["m1"]), slow));

        for _ in 0..100 {
            if executor.get(&job.id).unwrap().unwrap().status == JobStatus::Complete {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job did not complete after its handle was dropped");
    }

    #[tokio::test]
    async fn test_runner_failure_is_audited() {
        let (executor, sink, _dir) = create_test_executor();

        executor
            .spawn("missing-job".to_string(), items(&["m1"]), failing_on("never"))
            .await
            .unwrap();

        assert_eq!(sink.actions(), vec![("jobs/error".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_storage_failure_mid_run_marks_job_error() {
        let (executor, sink, dir) = create_test_executor();
        let job = executor.enqueue("batch_delete", 3).unwrap();

        // Progress writes after the first item fail; status writes still work
        rusqlite::Connection::open(dir.path().join("jobs.db"))
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_progress BEFORE UPDATE OF progress ON jobs
                 WHEN NEW.progress > 0
                 BEGIN SELECT RAISE(ABORT, 'disk gone'); END;",
            )
            .unwrap();

        executor
            .spawn(job.id.clone(), items(&["m1", "m2", "m3"]), failing_on("never"))
            .await
            .unwrap();

        let failed = executor.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.error.as_deref().unwrap().contains("disk gone"));
        assert!(failed.result.is_none());
        assert_eq!(failed.progress, 0);
        assert_eq!(sink.actions(), vec![("jobs/error".to_string(), false)]);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                Value::String(status.as_str().to_string())
            );
        }
    }
}
