//! Watch-layer write-finish detection.
//!
//! A freshly created file is only handed on once its size has stayed the
//! same for `threshold`, polling every `poll_interval`. This runs before the
//! stability gate, which then independently double-checks size and mtime.

use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::WatchConfig;

#[derive(Debug, Clone, Copy)]
pub struct WriteSettle {
    threshold: Duration,
    poll_interval: Duration,
}

impl WriteSettle {
    pub fn new(threshold: Duration, poll_interval: Duration) -> Self {
        Self {
            threshold,
            poll_interval,
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.write_finish_threshold(), config.write_finish_poll())
    }

    /// Wait until the size of `path` has been quiet for the threshold.
    ///
    /// Returns the settled size, or `None` if the file went away. There is no
    /// upper bound: a file that never stops growing is never reported.
    pub async fn wait(&self, path: &Path) -> Option<u64> {
        let mut last_len = tokio::fs::metadata(path).await.ok()?.len();
        let mut quiet_since = Instant::now();

        loop {
            if quiet_since.elapsed() >= self.threshold {
                return Some(last_len);
            }
            tokio::time::sleep(self.poll_interval).await;

            let len = tokio::fs::metadata(path).await.ok()?.len();
            if len != last_len {
                last_len = len;
                quiet_since = Instant::now();
            }
        }
    }
}
