//! Producer health monitoring.
//!
//! A single actor owns [`HealthState`]. Watchers and delivery tasks talk to
//! it through a cloneable [`HealthHandle`]; nothing else touches the state,
//! so updates from concurrent deliveries are applied one at a time in the
//! order they were sent.
//!
//! Two things trigger producer recovery:
//! - `consecutive_failure_threshold` producer-related delivery failures in a
//!   row (connection-refused failures are ignored),
//! - no new file observed for `restart_after_inactivity_secs`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::emit;
use crate::error::FailureKind;
use crate::metrics::events::{ConsecutiveFailures, SecondsSinceLastEvent};

/// Result of forwarding a single event, as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The endpoint answered 2xx.
    Delivered,
    /// The endpoint refused the connection.
    NetworkOnly,
    /// Any other failure after retries were exhausted.
    ProducerFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::NetworkOnly => "network_only",
            Outcome::ProducerFailure => "producer_failure",
        }
    }
}

impl From<FailureKind> for Outcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::NetworkOnly => Outcome::NetworkOnly,
            FailureKind::ProducerRelated => Outcome::ProducerFailure,
        }
    }
}

/// Why recovery was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    ConsecutiveFailures { count: u32 },
    Inactivity { idle_secs: i64 },
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryTrigger::ConsecutiveFailures { .. } => "consecutive_failures",
            RecoveryTrigger::Inactivity { .. } => "inactivity",
        }
    }
}

/// Something that can bring the producer back.
///
/// Implementations must not fail: errors are logged and the next trigger
/// retries.
#[async_trait]
pub trait Recovery: Send + Sync + 'static {
    async fn recover(&self, trigger: RecoveryTrigger);
}

#[async_trait]
impl<R: Recovery + ?Sized> Recovery for Arc<R> {
    async fn recover(&self, trigger: RecoveryTrigger) {
        (**self).recover(trigger).await
    }
}

/// Process-wide health counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub last_event_at: DateTime<Utc>,
    pub last_staleness_log_at: Option<DateTime<Utc>>,
}

impl HealthState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: 0,
            last_event_at: now,
            last_staleness_log_at: None,
        }
    }
}

/// Thresholds the monitor acts on.
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub inactivity_threshold: TimeDelta,
    pub restart_after: TimeDelta,
    pub log_throttle: TimeDelta,
    pub check_interval: Duration,
}

impl From<&HealthConfig> for HealthSettings {
    fn from(config: &HealthConfig) -> Self {
        let secs = |s: u64| {
            i64::try_from(s)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX)
        };
        Self {
            failure_threshold: config.consecutive_failure_threshold.max(1),
            inactivity_threshold: secs(config.inactivity_threshold_secs),
            restart_after: secs(config.restart_after_inactivity_secs),
            log_throttle: secs(config.log_throttle_secs),
            check_interval: config.staleness_check(),
        }
    }
}

/// Messages accepted by the monitor.
#[derive(Debug)]
pub enum HealthMessage {
    /// A candidate event file was observed.
    FileObserved,
    /// A delivery finished.
    Outcome(Outcome),
    /// Reply with a copy of the current state.
    Snapshot(oneshot::Sender<HealthState>),
}

pub type HealthInbox = mpsc::UnboundedReceiver<HealthMessage>;

/// Cheap, cloneable sender side of the monitor.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    tx: mpsc::UnboundedSender<HealthMessage>,
}

impl HealthHandle {
    pub fn channel() -> (Self, HealthInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn file_observed(&self) {
        self.send(HealthMessage::FileObserved);
    }

    pub fn report(&self, outcome: Outcome) {
        self.send(HealthMessage::Outcome(outcome));
    }

    /// Current state, or `None` once the monitor has stopped.
    pub async fn snapshot(&self) -> Option<HealthState> {
        let (reply, rx) = oneshot::channel();
        self.send(HealthMessage::Snapshot(reply));
        rx.await.ok()
    }

    fn send(&self, message: HealthMessage) {
        // Only fails after shutdown, when the monitor is gone.
        if self.tx.send(message).is_err() {
            debug!("Health monitor stopped, dropping message");
        }
    }
}

/// Owns the health state and decides when to recover the producer.
pub struct HealthMonitor<R> {
    state: HealthState,
    settings: HealthSettings,
    clock: Arc<dyn Clock>,
    recovery: R,
}

impl<R: Recovery> HealthMonitor<R> {
    pub fn new(settings: HealthSettings, clock: Arc<dyn Clock>, recovery: R) -> Self {
        Self {
            state: HealthState::new(clock.now()),
            settings,
            clock,
            recovery,
        }
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn recovery(&self) -> &R {
        &self.recovery
    }

    /// Record that a file was seen; this alone counts as producer liveness.
    pub fn observe_file(&mut self) {
        self.state.last_event_at = self.clock.now();
    }

    /// Apply a delivery outcome. Returns whether recovery ran.
    pub async fn record_outcome(&mut self, outcome: Outcome) -> bool {
        let mut recovered = false;
        match outcome {
            Outcome::Delivered => self.state.consecutive_failures = 0,
            Outcome::NetworkOnly => {
                debug!(
                    consecutive_failures = self.state.consecutive_failures,
                    "Connection refused, not counted against the producer"
                );
            }
            Outcome::ProducerFailure => {
                let count = self.state.consecutive_failures.saturating_add(1);
                self.state.consecutive_failures = count;
                if count >= self.settings.failure_threshold {
                    warn!(
                        count,
                        threshold = self.settings.failure_threshold,
                        "Too many consecutive forwarding failures, recovering producer"
                    );
                    self.recovery
                        .recover(RecoveryTrigger::ConsecutiveFailures { count })
                        .await;
                    self.state.consecutive_failures = 0;
                    recovered = true;
                }
            }
        }
        emit!(ConsecutiveFailures {
            count: self.state.consecutive_failures
        });
        recovered
    }

    /// Periodic inactivity check. Returns whether recovery ran.
    pub async fn check_staleness(&mut self) -> bool {
        let now = self.clock.now();
        let idle = now - self.state.last_event_at;
        let idle_secs = idle.num_seconds();
        emit!(SecondsSinceLastEvent { seconds: idle_secs });

        if idle > self.settings.inactivity_threshold {
            let throttle = self.settings.log_throttle;
            if self
                .state
                .last_staleness_log_at
                .is_none_or(|logged| now - logged >= throttle)
            {
                warn!(
                    idle_secs,
                    last_event_at = %self.state.last_event_at,
                    "No new events observed, producer may be stalled"
                );
                self.state.last_staleness_log_at = Some(now);
            }
        }

        if idle > self.settings.restart_after {
            self.recovery
                .recover(RecoveryTrigger::Inactivity { idle_secs })
                .await;
            self.state.last_event_at = self.clock.now();
            return true;
        }
        false
    }

    async fn handle(&mut self, message: HealthMessage) {
        match message {
            HealthMessage::FileObserved => self.observe_file(),
            HealthMessage::Outcome(outcome) => {
                self.record_outcome(outcome).await;
            }
            HealthMessage::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    /// Process messages and run the staleness check until shutdown.
    ///
    /// Returns the final state.
    pub async fn run(mut self, mut inbox: HealthInbox, shutdown: CancellationToken) -> HealthState {
        let period = self.settings.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            failure_threshold = self.settings.failure_threshold,
            inactivity_secs = self.settings.inactivity_threshold.num_seconds(),
            restart_after_secs = self.settings.restart_after.num_seconds(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                message = inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },

                _ = ticker.tick() => {
                    self.check_staleness().await;
                }
            }
        }

        debug!("Health monitor stopped");
        self.state
    }
}
