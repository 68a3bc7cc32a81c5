//! Audit events for security-relevant operations.
//!
//! Components record events through the [`AuditSink`] trait. Where the events
//! end up (file, log shipper) is the sink's business; the default
//! [`TracingAuditSink`] emits them as JSON on the `audit` tracing target.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One append-only audit record.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    /// Event category (`auth`, `api_keys`, `jobs`)
    #[serde(rename = "type")]
    pub category: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditEvent {
    pub fn new(category: &str, action: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            category: category.to_string(),
            action: action.to_string(),
            identity: None,
            success: true,
            details: None,
        }
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Marks the event as failed, recording `error` in the details.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.details = Some(serde_json::json!({ "error": error.into() }));
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => tracing::info!(target: "audit", "{}", line),
            Err(e) => tracing::warn!(target: "audit", error = %e, "Failed to serialize audit event"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects events in memory for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingSink {
        pub fn actions(&self) -> Vec<(String, bool)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| (format!("{}/{}", e.category, e.action), e.success))
                .collect()
        }
    }

    impl AuditSink for RecordingSink {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
