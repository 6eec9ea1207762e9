//! Rate-limit observability for the gateway

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::gateway::classify::duration_millis;

#[derive(Debug, Default, Clone)]
struct MetricsState {
    rate_limit_count: u64,
    last_retry_after_ms: Option<u64>,
    last_error_at: Option<DateTime<Utc>>,
    errors_by_operation: HashMap<String, u64>,
}

/// Point-in-time view of gateway health
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GatewayMetrics {
    pub rate_limit_count: u64,
    pub last_retry_after_ms: Option<u64>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub errors_by_operation: HashMap<String, u64>,
    /// Jobs waiting for a slot
    pub queue_length: usize,
    /// Jobs currently executing
    pub in_flight: usize,
}

/// Counters written by the backoff executor on every rate-limit event
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a rate-limit incident for `operation`
    pub fn record_rate_limit(&self, operation: &str, retry_after: Option<Duration>) {
        let mut state = self.lock();
        state.rate_limit_count += 1;
        *state
            .errors_by_operation
            .entry(operation.to_string())
            .or_insert(0) += 1;
        state.last_error_at = Some(Utc::now());
        if let Some(hint) = retry_after {
            state.last_retry_after_ms = Some(duration_millis(hint));
        }
    }

    /// Snapshot the counters together with the caller-supplied queue occupancy
    pub fn snapshot(&self, queue_length: usize, in_flight: usize) -> GatewayMetrics {
        let state = self.lock().clone();
        GatewayMetrics {
            rate_limit_count: state.rate_limit_count,
            last_retry_after_ms: state.last_retry_after_ms,
            last_error_at: state.last_error_at,
            errors_by_operation: state.errors_by_operation,
            queue_length,
            in_flight,
        }
    }

    pub fn rate_limit_count(&self) -> u64 {
        self.lock().rate_limit_count
    }

    pub fn reset(&self) {
        *self.lock() = MetricsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let metrics = MetricsRecorder::new();
        metrics.record_rate_limit("synthesis", Some(Duration::from_secs(3)));
        metrics.record_rate_limit("synthesis", None);
        metrics.record_rate_limit("questions", None);

        let snap = metrics.snapshot(4, 2);
        assert_eq!(snap.rate_limit_count, 3);
        assert_eq!(snap.errors_by_operation.get("synthesis"), Some(&2));
        assert_eq!(snap.errors_by_operation.get("questions"), Some(&1));
        assert_eq!(snap.last_retry_after_ms, Some(3000));
        assert!(snap.last_error_at.is_some());
        assert_eq!((snap.queue_length, snap.in_flight), (4, 2));

        metrics.reset();
        let snap = metrics.snapshot(1, 1);
        assert_eq!(snap.rate_limit_count, 0);
        assert!(snap.errors_by_operation.is_empty());
        assert_eq!(snap.last_retry_after_ms, None);
        assert_eq!(snap.last_error_at, None);
        assert_eq!((snap.queue_length, snap.in_flight), (1, 1));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsRecorder::new();
        metrics.record_rate_limit("questions", None);
        let json = serde_json::to_value(metrics.snapshot(0, 0)).unwrap();
        assert_eq!(json["rate_limit_count"], 1);
        assert_eq!(json["errors_by_operation"]["questions"], 1);
        assert!(json["last_retry_after_ms"].is_null());
    }
}
