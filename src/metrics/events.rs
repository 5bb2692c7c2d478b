//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the relay.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Where a candidate file was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    /// Present in the directory listing at startup.
    Backlog,
    /// Reported by the live watch handle.
    Live,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSource::Backlog => "backlog",
            FileSource::Live => "live",
        }
    }
}

/// Why a file was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Disappeared before it could be read.
    Gone,
    /// Could not be read.
    Read,
    /// Not a JSON object.
    Parse,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Gone => "gone",
            SkipReason::Read => "read",
            SkipReason::Parse => "parse",
        }
    }
}

/// Event emitted when a candidate event file is accepted.
pub struct FileObserved {
    pub source: FileSource,
}

impl InternalEvent for FileObserved {
    fn emit(self) {
        trace!(source = self.source.as_str(), "File observed");
        counter!("podrelay_files_observed_total", "source" => self.source.as_str()).increment(1);
    }
}

/// Event emitted when a file is dropped without being forwarded.
pub struct FileSkipped {
    pub reason: SkipReason,
}

impl InternalEvent for FileSkipped {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), "File skipped");
        counter!("podrelay_files_skipped_total", "reason" => self.reason.as_str()).increment(1);
    }
}

/// Event emitted when the stability gate gives up and reads the file anyway.
pub struct StabilityTimedOut;

impl InternalEvent for StabilityTimedOut {
    fn emit(self) {
        trace!("Stability check timed out");
        counter!("podrelay_stability_timeouts_total").increment(1);
    }
}

/// Event emitted when a delivery attempt sequence finishes.
pub struct EventForwarded {
    /// `delivered`, `network_only` or `producer_failure`.
    pub outcome: &'static str,
    pub duration: Duration,
}

impl InternalEvent for EventForwarded {
    fn emit(self) {
        trace!(
            outcome = self.outcome,
            duration_ms = self.duration.as_millis(),
            "Event forwarded"
        );
        counter!("podrelay_events_forwarded_total", "outcome" => self.outcome).increment(1);
        histogram!("podrelay_forward_duration_seconds", "outcome" => self.outcome)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a single HTTP attempt is retried.
pub struct ForwardRetried;

impl InternalEvent for ForwardRetried {
    fn emit(self) {
        trace!("Forward retried");
        counter!("podrelay_forward_retries_total").increment(1);
    }
}

// ============================================================================
// Gauge events for concurrency and health
// ============================================================================

/// Event emitted when the number of running dispatch tasks changes.
pub struct DispatchInFlight {
    pub count: usize,
}

impl InternalEvent for DispatchInFlight {
    fn emit(self) {
        trace!(count = self.count, "Dispatch in flight");
        gauge!("podrelay_dispatch_in_flight").set(self.count as f64);
    }
}

/// Event emitted when the number of callers waiting for a slot changes.
pub struct DispatchWaiting {
    pub count: usize,
}

impl InternalEvent for DispatchWaiting {
    fn emit(self) {
        trace!(count = self.count, "Dispatch waiting");
        gauge!("podrelay_dispatch_waiting").set(self.count as f64);
    }
}

/// Event emitted when the consecutive-failure counter changes.
pub struct ConsecutiveFailures {
    pub count: u32,
}

impl InternalEvent for ConsecutiveFailures {
    fn emit(self) {
        trace!(count = self.count, "Consecutive failures");
        gauge!("podrelay_consecutive_failures").set(f64::from(self.count));
    }
}

/// Event emitted on every staleness check.
pub struct SecondsSinceLastEvent {
    pub seconds: i64,
}

impl InternalEvent for SecondsSinceLastEvent {
    fn emit(self) {
        trace!(seconds = self.seconds, "Seconds since last event");
        gauge!("podrelay_seconds_since_last_event").set(self.seconds as f64);
    }
}

// ============================================================================
// Recovery and watcher lifecycle events
// ============================================================================

/// Event emitted after each recovery attempt.
pub struct RecoveryAttempted {
    /// `consecutive_failures` or `inactivity`.
    pub trigger: &'static str,
    pub success: bool,
}

impl InternalEvent for RecoveryAttempted {
    fn emit(self) {
        let result = if self.success { "success" } else { "error" };
        trace!(trigger = self.trigger, result, "Recovery attempted");
        counter!(
            "podrelay_recoveries_total",
            "trigger" => self.trigger,
            "result" => result
        )
        .increment(1);
    }
}

/// Event emitted when the watch handle is recreated.
pub struct WatcherRefreshed {
    pub success: bool,
}

impl InternalEvent for WatcherRefreshed {
    fn emit(self) {
        let result = if self.success { "success" } else { "error" };
        trace!(result, "Watcher refreshed");
        counter!("podrelay_watcher_refreshes_total", "result" => result).increment(1);
    }
}
