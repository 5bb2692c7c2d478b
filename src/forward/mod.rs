//! Reading event files and forwarding them through the dispatch queue.

mod transport;

pub use transport::{HttpTransport, IRIS_HEADER, Transport, iris_header, is_connection_refused};

use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatch::DispatchQueue;
use crate::emit;
use crate::error::{ForwardError, InvalidIrisSnafu, ParseEventSnafu, ReadEventSnafu};
use crate::event::Event;
use crate::health::{HealthHandle, Outcome};
use crate::metrics::events::{EventForwarded, FileSkipped, SkipReason};

/// Turns event files into deliveries and reports each outcome.
#[derive(Clone)]
pub struct EventForwarder {
    transport: Arc<dyn Transport>,
    queue: DispatchQueue,
    health: HealthHandle,
}

impl EventForwarder {
    pub fn new(transport: Arc<dyn Transport>, queue: DispatchQueue, health: HealthHandle) -> Self {
        Self {
            transport,
            queue,
            health,
        }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Read and parse an event file.
    ///
    /// IRIs that cannot travel in a header make the file malformed.
    pub async fn load(path: &Path) -> Result<Event, ForwardError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context(ReadEventSnafu { path })?;
        let event = Event::parse(&content).with_context(|_| ParseEventSnafu {
            path,
            content: &content,
        })?;
        iris_header(&event.iris).context(InvalidIrisSnafu { path })?;
        Ok(event)
    }

    /// Load `path` and queue it for delivery.
    ///
    /// Unreadable or malformed files are logged and skipped; they never
    /// reach the health monitor. Returns the delivery task once it has been
    /// admitted to the queue.
    pub async fn forward(&self, path: &Path) -> Option<JoinHandle<Outcome>> {
        let event = match Self::load(path).await {
            Ok(event) => event,
            Err(ForwardError::ParseEvent {
                path,
                content,
                source,
            }) => {
                error!(
                    path = %path.display(),
                    content = %content,
                    error = %source,
                    "Malformed event file, skipping"
                );
                emit!(FileSkipped {
                    reason: SkipReason::Parse
                });
                return None;
            }
            Err(e @ ForwardError::InvalidIris { .. }) => {
                error!(error = %e, "Malformed event file, skipping");
                emit!(FileSkipped {
                    reason: SkipReason::Parse
                });
                return None;
            }
            Err(e) => {
                error!(error = %e, "Unreadable event file, skipping");
                emit!(FileSkipped {
                    reason: SkipReason::Read
                });
                return None;
            }
        };

        match self.dispatch(event).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to queue event");
                None
            }
        }
    }

    /// Queue an already parsed event.
    pub async fn dispatch(&self, event: Event) -> Result<JoinHandle<Outcome>, ForwardError> {
        let transport = self.transport.clone();
        let health = self.health.clone();
        self.queue.submit(deliver(transport, health, event)).await
    }
}

async fn deliver(transport: Arc<dyn Transport>, health: HealthHandle, event: Event) -> Outcome {
    let started = Instant::now();
    let outcome = match transport.deliver(&event).await {
        Ok(status) => {
            info!(reason = %event.reason, iris = %event.iris, status, "Event forwarded");
            Outcome::Delivered
        }
        Err(e) => {
            let outcome = Outcome::from(e.failure_kind());
            match outcome {
                Outcome::NetworkOnly => warn!(
                    reason = %event.reason,
                    error = %e,
                    "Endpoint unreachable, event dropped"
                ),
                _ => error!(
                    reason = %event.reason,
                    iris = %event.iris,
                    error = %e,
                    "Failed to forward event"
                ),
            }
            outcome
        }
    };

    emit!(EventForwarded {
        outcome: outcome.as_str(),
        duration: started.elapsed(),
    });
    health.report(outcome);
    outcome
}
