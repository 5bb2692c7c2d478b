//! Producer recovery: rewind the checkpoint, restart, report status.
//!
//! A recovery attempt runs three steps in order and stops at the first one
//! that fails:
//!
//! 1. set `start_datetime` in the producer config to now minus the lookback
//!    (a lookback reaching past the representable date range fails here),
//! 2. restart the producer through the supervisor,
//! 3. query and log the producer's status.
//!
//! Failures are logged and never propagated; the next trigger tries again.

mod checkpoint;
mod supervisor;

pub use checkpoint::{Rewrite, checkpoint_line, format_checkpoint, rewrite_checkpoint};
pub use supervisor::{CommandSupervisor, Supervisor};

use async_trait::async_trait;
use chrono::TimeDelta;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::RecoveryConfig;
use crate::emit;
use crate::error::{
    CheckpointOutOfRangeSnafu, ReadProducerConfigSnafu, RecoveryError, RestartSnafu,
    WriteProducerConfigSnafu,
};
use crate::health::{Recovery, RecoveryTrigger};
use crate::metrics::events::RecoveryAttempted;

/// What a successful recovery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checkpoint: String,
    pub replaced: bool,
    pub restart_output: String,
    /// `None` if the status query itself failed.
    pub status: Option<String>,
}

pub struct RecoveryController {
    producer_config: PathBuf,
    lookback: TimeDelta,
    supervisor: Arc<dyn Supervisor>,
    clock: Arc<dyn Clock>,
}

impl RecoveryController {
    pub fn new(
        config: &RecoveryConfig,
        supervisor: Arc<dyn Supervisor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lookback = i64::try_from(config.lookback_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX);
        Self {
            producer_config: config.producer_config.clone(),
            lookback,
            supervisor,
            clock,
        }
    }

    /// Timestamp the producer should resume from if recovered now.
    pub fn checkpoint(&self) -> Result<String, RecoveryError> {
        let resume_at = self
            .clock
            .now()
            .checked_sub_signed(self.lookback)
            .context(CheckpointOutOfRangeSnafu {
                lookback_minutes: self.lookback.num_minutes(),
            })?;
        Ok(format_checkpoint(resume_at))
    }

    /// Run one recovery attempt.
    pub async fn try_recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let checkpoint = self.checkpoint()?;
        let path = &self.producer_config;

        let content = tokio::fs::read_to_string(path)
            .await
            .context(ReadProducerConfigSnafu { path })?;
        let rewrite = rewrite_checkpoint(&content, &checkpoint);
        tokio::fs::write(path, &rewrite.content)
            .await
            .context(WriteProducerConfigSnafu { path })?;
        info!(
            path = %path.display(),
            checkpoint,
            replaced = rewrite.replaced,
            "Producer checkpoint rewound"
        );

        let restart_output = self.supervisor.restart().await.context(RestartSnafu)?;
        info!(output = %restart_output, "Producer restarted");

        let status = match self.supervisor.status().await {
            Ok(status) => {
                info!(status = %status, "Producer status");
                Some(status)
            }
            Err(e) => {
                warn!(error = %e, "Failed to query producer status");
                None
            }
        };

        Ok(RecoveryReport {
            checkpoint,
            replaced: rewrite.replaced,
            restart_output,
            status,
        })
    }
}

#[async_trait]
impl Recovery for RecoveryController {
    async fn recover(&self, trigger: RecoveryTrigger) {
        warn!(trigger = trigger.as_str(), ?trigger, "Recovering producer");
        let success = match self.try_recover().await {
            Ok(report) => {
                info!(checkpoint = %report.checkpoint, "Producer recovery complete");
                true
            }
            Err(e) => {
                error!(
                    error = %snafu::Report::from_error(e),
                    "Producer recovery failed, will retry on next trigger"
                );
                false
            }
        };
        emit!(RecoveryAttempted {
            trigger: trigger.as_str(),
            success,
        });
    }
}
