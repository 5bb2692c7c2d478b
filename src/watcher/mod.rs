//! Directory watching.
//!
//! Discovers event files two ways: a one-time listing of whatever is already
//! in the directory at startup (the backlog), and a live platform watch for
//! files created afterwards. Every accepted path is handed to an [`Ingest`]
//! implementation on its own task.
//!
//! Long-lived watch handles have been observed to silently stop delivering
//! notifications, so the handle is recreated every `refresh_interval`. The
//! replacement is opened before the old one is closed and both feed the same
//! channel; the short overlap is absorbed by duplicate suppression.

mod settle;
mod stability;

pub use settle::WriteSettle;
pub use stability::{Stability, StabilityGate, WatchedFile};

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::emit;
use crate::error::{CreateWatcherSnafu, ListDirectorySnafu, WatchDirectorySnafu, WatchError};
use crate::health::HealthHandle;
use crate::metrics::events::{FileObserved, FileSkipped, FileSource, SkipReason, WatcherRefreshed};

/// Extension of files the producer writes.
pub const EVENT_EXTENSION: &str = "json";

/// Receives every accepted event file path.
#[async_trait]
pub trait Ingest: Send + Sync + 'static {
    async fn ingest(&self, path: PathBuf);
}

type Notification = notify::Result<notify::Event>;

/// Whether `path` looks like an event file. The match is exact: `a.JSON`
/// and `a.json.tmp` are both ignored.
pub fn is_event_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == EVENT_EXTENSION)
}

/// Whether a notification means a new file appeared at its path.
pub fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any | CreateKind::Other)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

/// List event files already present in `dir`, in the order the filesystem
/// returns them.
pub async fn list_backlog(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, WatchError> {
    let mut pending = vec![dir.to_path_buf()];
    let mut files = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .context(ListDirectorySnafu { path: &current })?;
        let mut subdirs = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ListDirectorySnafu { path: &current })?
        {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if recursive {
                    subdirs.push(path);
                }
            } else if is_event_file(&path) {
                files.push(path);
            }
        }

        // Keep listing order when descending.
        pending.extend(subdirs.into_iter().rev());
    }

    Ok(files)
}

/// Watches a directory and feeds new event files to an [`Ingest`].
pub struct DirectoryWatcher {
    config: WatchConfig,
    ingest: Arc<dyn Ingest>,
    health: HealthHandle,
    settle: WriteSettle,
    recent: HashMap<PathBuf, Instant>,
    backlog_done: bool,
}

impl DirectoryWatcher {
    pub fn new(config: WatchConfig, ingest: Arc<dyn Ingest>, health: HealthHandle) -> Self {
        let settle = WriteSettle::from_config(&config);
        Self {
            config,
            ingest,
            health,
            settle,
            recent: HashMap::new(),
            backlog_done: false,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The live handle is opened before the backlog is listed so that a file
    /// created in between is seen by at least one of the two.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handle = match self.open(&tx).await {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(error = %e, "Failed to start watching, retrying on next refresh");
                None
            }
        };
        self.process_backlog().await;

        let period = self.config.refresh_interval();
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            dir = %self.config.dir.display(),
            recursive = self.config.recursive,
            refresh_secs = period.as_secs(),
            "Watching for event files"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(notification) = rx.recv() => self.handle_notification(notification),

                _ = refresh.tick() => self.refresh(&mut handle, &tx).await,
            }
        }

        if let Some(watcher) = handle.take() {
            close(watcher).await;
        }
        info!("Directory watcher stopped");
    }

    /// Hand every file already in the directory to the ingest.
    ///
    /// Backlog files skip the write-finish wait; the stability gate still
    /// applies downstream. Returns the accepted paths.
    pub async fn process_backlog(&mut self) -> Vec<PathBuf> {
        let files = match list_backlog(&self.config.dir, self.config.recursive).await {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "Failed to list backlog, retrying on next refresh");
                return Vec::new();
            }
        };
        self.backlog_done = true;

        if !files.is_empty() {
            info!(count = files.len(), "Processing backlog");
        }
        files
            .into_iter()
            .filter(|path| self.accept(path.clone(), FileSource::Backlog))
            .collect()
    }

    fn handle_notification(&mut self, notification: Notification) {
        let event = match notification {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Watch error");
                return;
            }
        };
        if !is_arrival(&event.kind) {
            return;
        }

        // A two-path rename is [from, to]; only the destination is new.
        let rename_pair = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both))
        );
        let mut paths = event.paths;
        if rename_pair && paths.len() > 1 {
            paths.drain(..paths.len() - 1);
        }
        for path in paths {
            self.accept(path, FileSource::Live);
        }
    }

    /// Start processing `path` unless it is filtered out or was accepted
    /// within the duplicate window. Returns whether it was accepted.
    pub fn accept(&mut self, path: PathBuf, source: FileSource) -> bool {
        if !is_event_file(&path) {
            return false;
        }

        let now = Instant::now();
        let window = self.config.duplicate_window();
        if self
            .recent
            .get(&path)
            .is_some_and(|seen| now.duration_since(*seen) < window)
        {
            debug!(path = %path.display(), "Duplicate notification ignored");
            return false;
        }
        self.recent.insert(path.clone(), now);

        self.health.file_observed();
        emit!(FileObserved { source });

        let ingest = self.ingest.clone();
        let settle = self.settle;
        tokio::spawn(async move {
            if source == FileSource::Live && settle.wait(&path).await.is_none() {
                debug!(path = %path.display(), "File vanished before write finished");
                emit!(FileSkipped {
                    reason: SkipReason::Gone
                });
                return;
            }
            ingest.ingest(path).await;
        });
        true
    }

    /// Replace the watch handle. On failure the previous handle is kept.
    async fn refresh(
        &mut self,
        handle: &mut Option<RecommendedWatcher>,
        tx: &mpsc::UnboundedSender<Notification>,
    ) {
        let window = self.config.duplicate_window();
        self.recent.retain(|_, seen| seen.elapsed() < window);

        match self.open(tx).await {
            Ok(watcher) => {
                if let Some(old) = handle.replace(watcher) {
                    close(old).await;
                }
                emit!(WatcherRefreshed { success: true });
                debug!("Watch handle refreshed");
            }
            Err(e) => {
                emit!(WatcherRefreshed { success: false });
                error!(error = %e, "Failed to refresh watch handle, keeping the previous one");
                return;
            }
        }

        if !self.backlog_done {
            self.process_backlog().await;
        }
    }

    /// Open a new platform watch handle on the directory, creating the
    /// directory first if needed.
    async fn open(
        &self,
        tx: &mpsc::UnboundedSender<Notification>,
    ) -> Result<RecommendedWatcher, WatchError> {
        let dir = &self.config.dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Could not create watch directory");
        }

        let tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |notification: Notification| {
            // Receiver is gone only during shutdown.
            let _ = tx.send(notification);
        })
        .context(CreateWatcherSnafu)?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(dir, mode)
            .context(WatchDirectorySnafu { path: dir })?;
        Ok(watcher)
    }
}

/// Dropping a handle joins its platform thread; keep that off the runtime.
async fn close(watcher: RecommendedWatcher) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(watcher)).await {
        warn!(error = %e, "Failed to close watch handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, RemoveKind};
    use tempfile::TempDir;

    #[test]
    fn test_event_file_extension_is_exact() {
        assert!(is_event_file(Path::new("/x/1714561234.json")));
        assert!(!is_event_file(Path::new("/x/1714561234.JSON")));
        assert!(!is_event_file(Path::new("/x/1714561234.json.tmp")));
        assert!(!is_event_file(Path::new("/x/json")));
        assert!(!is_event_file(Path::new("/x/notes.txt")));
    }

    #[test]
    fn test_arrival_kinds() {
        assert!(is_arrival(&EventKind::Create(CreateKind::File)));
        assert!(is_arrival(&EventKind::Create(CreateKind::Any)));
        assert!(is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))));

        assert!(!is_arrival(&EventKind::Create(CreateKind::Folder)));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(!is_arrival(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_arrival(&EventKind::Access(AccessKind::Any)));
    }

    #[tokio::test]
    async fn test_backlog_lists_only_event_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("c.txt"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/d.json"), "{}").unwrap();

        let mut flat = list_backlog(dir.path(), false).await.unwrap();
        flat.sort();
        assert_eq!(
            flat,
            vec![dir.path().join("a.json"), dir.path().join("b.json")]
        );

        let deep = list_backlog(dir.path(), true).await.unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("nested/d.json")));
    }

    #[tokio::test]
    async fn test_backlog_of_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = list_backlog(&dir.path().join("missing"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::ListDirectory { .. }));
    }
}
