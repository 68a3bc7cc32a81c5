//! Login `state` values for CSRF protection.
//!
//! Each `/auth/login` issues a random state; the callback must present it back
//! within the TTL. States are single-use.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Pending login states with expiry.
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    ttl: Duration,
}

impl StateManager {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        // The map holds no invariants a panicking writer could break
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issues a new state value.
    pub fn issue(&self) -> String {
        let state = Uuid::new_v4().simple().to_string();
        self.states().insert(state.clone(), Utc::now());
        state
    }

    /// Consumes `state`. True only if it was issued and has not expired.
    pub fn consume(&self, state: &str) -> bool {
        match self.states().remove(state) {
            Some(issued_at) => Utc::now() - issued_at <= self.ttl,
            None => false,
        }
    }

    /// Drops expired states.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.states().retain(|_, issued_at| now - *issued_at <= ttl);
    }

    pub fn count(&self) -> usize {
        self.states().len()
    }
}

/// Periodically purges expired states. Runs until the process exits.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(remaining = manager.count(), "Login state cleanup complete");
    }
}
