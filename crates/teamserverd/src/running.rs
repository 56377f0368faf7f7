//! Liveness flags read by the health check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marks a flag as running for as long as it is alive. Dropping it, on a
/// clean return, a panic or an aborted task, clears the flag.
pub(crate) struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    pub(crate) fn set(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(Arc::clone(flag))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
