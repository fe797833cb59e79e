//! Client statistics
//!
//! Counters are bumped from producer threads and both workers, and are only
//! ever read through a [`StatsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the facade and the workers
#[derive(Debug, Default)]
pub struct ClientStats {
    client_errors: AtomicU64,
    retried_updates: AtomicU64,
    invalid_dimensions: AtomicU64,
    dropped_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A 4xx response was received
    pub fn record_client_error(&self) {
        self.client_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was re-sent from the retry queue
    pub fn record_retry(&self) {
        self.retried_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was rejected for an empty dimension name or value
    pub fn record_invalid_dimension(&self) {
        self.invalid_dimensions.fetch_add(1, Ordering::Relaxed);
    }

    /// A request could not be admitted to the submission queue
    pub fn record_dropped(&self) {
        self.dropped_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was discarded because the same work was already in flight
    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            client_errors: self.client_errors.load(Ordering::Relaxed),
            retried_updates: self.retried_updates.load(Ordering::Relaxed),
            invalid_dimensions: self.invalid_dimensions.load(Ordering::Relaxed),
            dropped_requests: self.dropped_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ClientStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Total 4xx responses
    pub client_errors: u64,

    /// Total requests re-sent after a transient failure
    pub retried_updates: u64,

    /// Total requests rejected for an empty dimension
    pub invalid_dimensions: u64,

    /// Total requests dropped at admission
    pub dropped_requests: u64,

    /// Total requests discarded as duplicates
    pub deduplicated_requests: u64,
}

impl StatsSnapshot {
    /// Render in Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let counters = [
            (
                "apm_correlate_client_errors_total",
                "Correlation requests rejected with a 4xx status",
                self.client_errors,
            ),
            (
                "apm_correlate_retried_updates_total",
                "Correlation requests re-sent after a transient failure",
                self.retried_updates,
            ),
            (
                "apm_correlate_invalid_dimensions_total",
                "Correlation requests with an empty dimension name or value",
                self.invalid_dimensions,
            ),
            (
                "apm_correlate_dropped_requests_total",
                "Correlation requests dropped because the client could not accept them",
                self.dropped_requests,
            ),
            (
                "apm_correlate_deduplicated_requests_total",
                "Correlation requests discarded while identical work was in flight",
                self.deduplicated_requests,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, value));
        }
        output
    }
}

/// Anything that can report client statistics
pub trait StatsProvider: Send + Sync {
    fn stats(&self) -> StatsSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_counts() {
        let stats = ClientStats::new();
        stats.record_client_error();
        stats.record_retry();
        stats.record_retry();
        stats.record_invalid_dimension();
        stats.record_dropped();
        stats.record_deduplicated();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.client_errors, 1);
        assert_eq!(snapshot.retried_updates, 2);
        assert_eq!(snapshot.invalid_dimensions, 1);
        assert_eq!(snapshot.dropped_requests, 1);
        assert_eq!(snapshot.deduplicated_requests, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(ClientStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_retry();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().retried_updates, 8000);
    }

    #[test]
    fn test_prometheus_format() {
        let snapshot = StatsSnapshot {
            retried_updates: 3,
            ..Default::default()
        };
        let text = snapshot.to_prometheus();
        assert!(text.contains("# TYPE apm_correlate_retried_updates_total counter"));
        assert!(text.contains("apm_correlate_retried_updates_total 3\n"));
        assert!(text.contains("apm_correlate_client_errors_total 0\n"));
    }
}
