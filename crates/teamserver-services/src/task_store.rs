//! In-memory store of task results reported by agents.
//!
//! Results live as long as the session that reported them: the connection
//! engine and the expiry sweeper drop a session's results when they remove
//! the session.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use teamserver_core::wire::unix_millis;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub task_id: String,
    pub session_id: String,
    pub result: Value,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// Latest result per task id. A repeated task id overwrites.
#[derive(Clone, Default)]
pub struct TaskResultStore {
    results: Arc<DashMap<String, StoredResult>>,
}

impl TaskResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: &str, session_id: &str, result: Value) {
        self.results.insert(
            task_id.to_string(),
            StoredResult {
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                result,
                timestamp: unix_millis(),
            },
        );
    }

    pub fn get(&self, task_id: &str) -> Option<StoredResult> {
        self.results.get(task_id).map(|r| r.clone())
    }

    /// All results reported by one session, oldest first.
    pub fn for_session(&self, session_id: &str) -> Vec<StoredResult> {
        let mut results: Vec<StoredResult> = self
            .results
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.value().clone())
            .collect();
        results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.task_id.cmp(&b.task_id)));
        results
    }

    /// Drop everything a session reported. Returns how many results went.
    pub fn remove_session(&self, session_id: &str) -> usize {
        let before = self.results.len();
        self.results.retain(|_, r| r.session_id != session_id);
        before.saturating_sub(self.results.len())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
