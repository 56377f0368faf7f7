//! HTTP API handlers: exposes teamserver state as JSON.

pub mod sessions;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use teamserver_services::{SessionRegistry, TaskResultStore};

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionRegistry>,
    pub status: Arc<ServerStatus>,
    pub task_results: TaskResultStore,
}

/// Liveness and lifecycle counters, written by the orchestrator and read
/// here without blocking.
#[derive(Debug, Default)]
pub struct ServerStatus {
    healthy: AtomicBool,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }
}
