//! Wiring: watcher -> stability gate -> forwarder -> health monitor -> recovery.

use async_trait::async_trait;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::DispatchQueue;
use crate::emit;
use crate::error::{ConfigSnafu, HttpClientSnafu, MonitorJoinSnafu, RelayError};
use crate::forward::{EventForwarder, HttpTransport, Transport};
use crate::health::{HealthHandle, HealthMonitor, HealthSettings, HealthState, Recovery};
use crate::metrics::events::{FileSkipped, SkipReason};
use crate::recovery::{CommandSupervisor, RecoveryController};
use crate::watcher::{DirectoryWatcher, Ingest, StabilityGate};

/// Waits for a file to stop changing, then forwards it.
pub struct GatedForwarder {
    gate: StabilityGate,
    forwarder: EventForwarder,
}

impl GatedForwarder {
    pub fn new(gate: StabilityGate, forwarder: EventForwarder) -> Self {
        Self { gate, forwarder }
    }
}

#[async_trait]
impl Ingest for GatedForwarder {
    async fn ingest(&self, path: PathBuf) {
        if !self.gate.wait(&path).await.is_readable() {
            debug!(path = %path.display(), "File gone before it stabilized");
            emit!(FileSkipped {
                reason: SkipReason::Gone
            });
            return;
        }
        // The delivery task reports its own outcome; nothing to wait for.
        let _ = self.forwarder.forward(&path).await;
    }
}

/// The assembled relay.
pub struct Relay<R> {
    config: Config,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    recovery: R,
}

impl Relay<RecoveryController> {
    /// Build a relay talking HTTP and a real process supervisor.
    pub fn from_config(config: Config) -> Result<Self, RelayError> {
        let endpoint = config.forward.endpoint_url().context(ConfigSnafu)?;
        let transport =
            HttpTransport::new(endpoint, &config.forward).context(HttpClientSnafu)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let supervisor = Arc::new(CommandSupervisor::from_config(&config.recovery));
        let recovery = RecoveryController::new(&config.recovery, supervisor, clock.clone());
        Ok(Self::new(config, clock, Arc::new(transport), recovery))
    }
}

impl<R: Recovery> Relay<R> {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        recovery: R,
    ) -> Self {
        Self {
            config,
            clock,
            transport,
            recovery,
        }
    }

    /// Run until `shutdown` is cancelled. Returns the final health state.
    ///
    /// Deliveries still in flight at shutdown are abandoned with the runtime.
    pub async fn run(self, shutdown: CancellationToken) -> Result<HealthState, RelayError> {
        let Self {
            config,
            clock,
            transport,
            recovery,
        } = self;

        let (health, inbox) = HealthHandle::channel();
        let monitor = HealthMonitor::new(HealthSettings::from(&config.health), clock, recovery);
        let monitor_task = tokio::spawn(monitor.run(inbox, shutdown.clone()));

        let queue = DispatchQueue::new(config.forward.max_concurrent_requests);
        let forwarder = EventForwarder::new(transport, queue, health.clone());
        let ingest = Arc::new(GatedForwarder::new(
            StabilityGate::from_config(&config.watch),
            forwarder,
        ));

        info!(
            dir = %config.watch.dir.display(),
            endpoint = %config.forward.endpoint,
            max_concurrent_requests = config.forward.max_concurrent_requests,
            "Relay started"
        );

        DirectoryWatcher::new(config.watch, ingest, health)
            .run(shutdown)
            .await;

        monitor_task.await.context(MonitorJoinSnafu)
    }
}
