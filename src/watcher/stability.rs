//! Stability gate: is a file finished being written?
//!
//! Polls size and modification time until two consecutive observations
//! match. On timeout the file is treated as stable anyway, favouring
//! availability over perfect detection; under heavy load that can still let
//! a partially written file through, which surfaces later as a parse error.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::emit;
use crate::metrics::events::StabilityTimedOut;

/// A file under observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub stable: bool,
}

impl WatchedFile {
    /// Stat `path`. Any I/O error is reported as the file being gone.
    pub async fn observe(path: &Path) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
            stable: false,
        })
    }

    fn same_content_as(&self, other: &Self) -> bool {
        self.len == other.len && self.modified == other.modified
    }
}

/// Outcome of a stability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability {
    /// Two consecutive polls matched.
    Stable(WatchedFile),
    /// The timeout elapsed first; the file is read optimistically.
    TimedOut(WatchedFile),
    /// The file disappeared (or became unreadable) while being polled.
    Gone,
}

impl Stability {
    /// Whether the caller should go ahead and read the file.
    pub fn is_readable(&self) -> bool {
        !matches!(self, Stability::Gone)
    }
}

/// Polls a file until it stops changing.
#[derive(Debug, Clone, Copy)]
pub struct StabilityGate {
    poll_interval: Duration,
    timeout: Duration,
}

impl StabilityGate {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.stability_poll(), config.stability_timeout())
    }

    pub async fn wait(&self, path: &Path) -> Stability {
        let deadline = Instant::now() + self.timeout;

        let Some(mut previous) = WatchedFile::observe(path).await else {
            return Stability::Gone;
        };

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let Some(mut current) = WatchedFile::observe(path).await else {
                debug!(path = %path.display(), "File disappeared during stability check");
                return Stability::Gone;
            };

            if current.same_content_as(&previous) {
                current.stable = true;
                return Stability::Stable(current);
            }

            if Instant::now() >= deadline {
                warn!(
                    path = %path.display(),
                    timeout_ms = self.timeout.as_millis(),
                    "File still changing after stability timeout, reading anyway"
                );
                emit!(StabilityTimedOut);
                return Stability::TimedOut(current);
            }

            previous = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn gate(poll_ms: u64, timeout_ms: u64) -> StabilityGate {
        StabilityGate::new(
            Duration::from_millis(poll_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_unchanged_file_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("done.json");
        std::fs::write(&path, br#"{"reason":"update"}"#).unwrap();

        match gate(20, 1000).wait(&path).await {
            Stability::Stable(file) => {
                assert!(file.stable);
                assert_eq!(file.len, 19);
            }
            other => panic!("expected stable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let result = gate(20, 1000).wait(&dir.path().join("nope.json")).await;
        assert_eq!(result, Stability::Gone);
        assert!(!result.is_readable());
    }

    #[tokio::test]
    async fn test_deleted_mid_poll_is_gone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("moved.json");
        std::fs::write(&path, b"{}").unwrap();

        let victim = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::remove_file(victim).await.unwrap();
        });

        assert_eq!(gate(100, 1000).wait(&path).await, Stability::Gone);
    }

    #[tokio::test]
    async fn test_waits_for_writer_to_finish() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, b"{\"iris\":[").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            for i in 0..10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                file.write_all(format!("\"https://feed{i}.example\",").as_bytes())
                    .await
                    .unwrap();
                file.flush().await.unwrap();
            }
            file.write_all(b"\"end\"]}").await.unwrap();
            file.flush().await.unwrap();
        });

        let result = gate(100, 5000).wait(&path).await;
        writer.await.unwrap();

        let final_len = std::fs::metadata(&path).unwrap().len();
        match result {
            Stability::Stable(file) => assert_eq!(file.len, final_len),
            other => panic!("expected stable, got {other:?}"),
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(crate::event::Event::parse(&content).is_ok());
    }

    #[tokio::test]
    async fn test_timeout_reads_optimistically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busy.json");
        std::fs::write(&path, b"x").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer_stop = stop.clone();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            while !writer_stop.load(Ordering::SeqCst) {
                file.write_all(b"x").await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = gate(30, 150).wait(&path).await;
        stop.store(true, Ordering::SeqCst);
        writer.await.unwrap();

        assert!(matches!(result, Stability::TimedOut(ref file) if !file.stable));
        assert!(result.is_readable());
    }
}
