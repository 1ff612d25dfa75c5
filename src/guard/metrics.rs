//! Allowed/blocked counters for one guard.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Algorithm tag reported alongside the counters.
pub const SLIDING_WINDOW: &str = "sliding_window";

/// Decision counters owned by a guard and shared by reference.
#[derive(Debug)]
pub struct GateMetrics {
    backend: String,
    algorithm: &'static str,
    allowed: AtomicU64,
    blocked: AtomicU64,
    store_errors: AtomicU64,
    unkeyed: AtomicU64,
}

/// Point-in-time copy of [`GateMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub backend: String,
    pub algorithm: &'static str,
    pub allowed: u64,
    pub blocked: u64,
    pub store_errors: u64,
    pub unkeyed: u64,
}

impl GateMetrics {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            algorithm: SLIDING_WINDOW,
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            unkeyed: AtomicU64::new(0),
        }
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A request passed through because no key could be resolved.
    pub fn record_unkeyed(&self) {
        self.unkeyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allowed_total(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn blocked_total(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backend: self.backend.clone(),
            algorithm: self.algorithm,
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            unkeyed: self.unkeyed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = GateMetrics::new("memory");
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_blocked();
        metrics.record_store_error();

        assert_eq!(metrics.allowed_total(), 2);
        assert_eq!(metrics.blocked_total(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backend, "memory");
        assert_eq!(snapshot.algorithm, "sliding_window");
        assert_eq!(snapshot.store_errors, 1);
        assert_eq!(snapshot.unkeyed, 0);
    }
}
