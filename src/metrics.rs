//! Metrics instrumentation for sentinel-failover.
//!
//! All metrics are prefixed with `sentinel_failover.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a master lookup against Sentinel.
pub fn record_resolution(success: bool, duration: std::time::Duration) {
    let result = if success { "success" } else { "error" };
    counter!("sentinel_failover.resolve.count", "result" => result).increment(1);
    histogram!("sentinel_failover.resolve.duration.seconds").record(duration.as_secs_f64());
}

/// Record an Endpoints write.
pub fn record_publish(success: bool, duration: std::time::Duration) {
    let result = if success { "success" } else { "error" };
    counter!("sentinel_failover.publish.count", "result" => result).increment(1);
    histogram!("sentinel_failover.publish.duration.seconds").record(duration.as_secs_f64());
}

/// Outcome of one reconcile tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new address was written.
    Published,
    /// Resolved address matched the last published one.
    Unchanged,
    /// Sentinel lookup failed, tick skipped.
    ResolveFailed,
    /// Endpoints write failed, will retry next tick.
    PublishFailed,
}

impl TickOutcome {
    fn as_str(self) -> &'static str {
        match self {
            TickOutcome::Published => "published",
            TickOutcome::Unchanged => "unchanged",
            TickOutcome::ResolveFailed => "resolve_failed",
            TickOutcome::PublishFailed => "publish_failed",
        }
    }
}

/// Record the outcome of a reconcile tick.
pub fn record_tick(outcome: TickOutcome) {
    counter!("sentinel_failover.tick.count", "outcome" => outcome.as_str()).increment(1);
}

/// Record a leadership transition and update the leader gauge.
pub fn record_leadership(leading: bool) {
    let transition = if leading { "acquired" } else { "lost" };
    counter!("sentinel_failover.leadership.transition.count", "transition" => transition)
        .increment(1);
    gauge!("sentinel_failover.leadership.is_leader").set(if leading { 1.0 } else { 0.0 });
}

/// Record a failed lease operation (acquire, renew or release).
pub fn record_lease_error(operation: &'static str) {
    counter!("sentinel_failover.lease.error.count", "operation" => operation).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
