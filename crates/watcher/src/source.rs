use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::WatchError;

/// Produces candidate file paths from a set of watched folders.
///
/// Implementations deliver paths that appeared or changed under one of the
/// roots. Duplicates and already-handled paths are fine; screening is the
/// watch service's job.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Run until `shutdown` flips or the receiving side goes away.
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<PathBuf>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError>;
}

// ── Native notifications ──────────────────────────────────────────────────────

/// OS-native change notifications (inotify, FSEvents, ReadDirectoryChangesW).
///
/// Only arrivals are forwarded: creations and the destination side of
/// renames. In-place data writes to an existing file are ignored.
pub struct NotifyBackend {
    roots: Vec<PathBuf>,
    recursive: bool,
}

impl NotifyBackend {
    pub fn new(roots: Vec<PathBuf>, recursive: bool) -> Self {
        Self { roots, recursive }
    }

    fn is_arrival(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        )
    }
}

#[async_trait]
impl EventSource for NotifyBackend {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        if self.roots.is_empty() {
            return Err(WatchError::NoRoots);
        }

        // The notify callback runs on the watcher's own thread, so events are
        // bridged into the async side through a bounded channel.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "filesystem notification error");
                    return;
                }
            };
            if !Self::is_arrival(&event.kind) {
                return;
            }
            for path in event.paths {
                match tx.try_send(path) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(path)) => {
                        warn!(path = %path.display(), "notification queue full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        })?;

        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for root in &self.roots {
            watcher.watch(root, mode)?;
            debug!(root = %root.display(), "watching folder");
        }

        // Hold the watcher alive until shutdown.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ── Polling sweep ─────────────────────────────────────────────────────────────

/// Periodic directory sweep for filesystems where native notifications are
/// unreliable, such as network shares.
///
/// The first sweep only primes the snapshot; afterwards every new path, and
/// every path whose size changed since the previous sweep, is forwarded.
pub struct PollBackend {
    roots: Vec<PathBuf>,
    recursive: bool,
    interval: Duration,
}

impl PollBackend {
    pub fn new(roots: Vec<PathBuf>, recursive: bool, interval: Duration) -> Self {
        Self {
            roots,
            recursive,
            interval,
        }
    }

    fn sweep(&self) -> HashMap<PathBuf, u64> {
        let mut snapshot = HashMap::new();
        for root in &self.roots {
            let mut walker = WalkDir::new(root).min_depth(1);
            if !self.recursive {
                walker = walker.max_depth(1);
            }
            for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    snapshot.insert(entry.into_path(), meta.len());
                }
            }
        }
        snapshot
    }
}

#[async_trait]
impl EventSource for PollBackend {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        if self.roots.is_empty() {
            return Err(WatchError::NoRoots);
        }

        let mut previous = self.sweep();
        while !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let current = self.sweep();
                    for (path, size) in &current {
                        if previous.get(path) != Some(size) {
                            if tx.send(path.clone()).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    previous = current;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
