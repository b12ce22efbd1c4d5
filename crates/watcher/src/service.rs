use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::WatchError;
use crate::admission::admissible_path;
use crate::cache::RecentPathCache;
use crate::source::EventSource;
use crate::stability::{Stability, StabilityPolicy, wait_for_stable};

/// Receives each admitted, stable path. Errors are logged per path and never
/// stop the service.
pub type IngestCallback = Arc<dyn Fn(PathBuf) -> anyhow::Result<()> + Send + Sync>;

/// Screens raw folder notifications and forwards settled `.txt` files.
///
/// Every notification is handled on its own task: directory and name
/// screening, duplicate suppression, then a write-stability wait before the
/// callback fires. A slow or growing file therefore never holds up other
/// arrivals.
pub struct WatchService {
    policy: StabilityPolicy,
    recent: Arc<RecentPathCache>,
    queue_cap: usize,
    on_file: IngestCallback,
}

impl WatchService {
    pub fn new(
        policy: StabilityPolicy,
        recent: RecentPathCache,
        queue_cap: usize,
        on_file: IngestCallback,
    ) -> Self {
        Self {
            policy,
            recent: Arc::new(recent),
            queue_cap: queue_cap.max(1),
            on_file,
        }
    }

    /// Run one path through the same screening, duplicate suppression, and
    /// stability wait as a live notification. Used to sweep folders for files
    /// that arrived while nothing was watching.
    pub async fn admit(&self, path: PathBuf, shutdown: watch::Receiver<bool>) {
        handle_path(
            path,
            self.policy,
            Arc::clone(&self.recent),
            Arc::clone(&self.on_file),
            shutdown,
        )
        .await;
    }

    /// Consume notifications from `source` until `shutdown` flips or the
    /// source finishes. In-flight per-path tasks are joined before returning;
    /// their stability waits observe the same shutdown flag, so the join is
    /// bounded by one poll interval.
    pub async fn run(
        &self,
        source: Box<dyn EventSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::channel(self.queue_cap);
        let source_task = tokio::spawn(source.run(tx, shutdown.clone()));
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut stop = shutdown.clone();

        loop {
            tokio::select! {
                notified = rx.recv() => match notified {
                    Some(path) => {
                        while handlers.try_join_next().is_some() {}
                        let policy = self.policy;
                        let recent = Arc::clone(&self.recent);
                        let on_file = Arc::clone(&self.on_file);
                        let cancel = shutdown.clone();
                        handlers.spawn(async move {
                            handle_path(path, policy, recent, on_file, cancel).await;
                        });
                    }
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        match source_task.await {
            Ok(result) => result,
            Err(err) => Err(WatchError::Join(err)),
        }
    }
}

async fn handle_path(
    path: PathBuf,
    policy: StabilityPolicy,
    recent: Arc<RecentPathCache>,
    on_file: IngestCallback,
    shutdown: watch::Receiver<bool>,
) {
    if !admissible_path(&path) {
        return;
    }
    // notify does not tag directory events reliably, so a folder named
    // like a text file is screened here.
    if tokio::fs::metadata(&path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
    {
        return;
    }
    if recent.seen(&path) {
        return;
    }

    match wait_for_stable(&path, &policy, shutdown).await {
        Stability::Stable => {
            recent.add(path.clone());
            info!(path = %path.display(), "file admitted");
            if let Err(err) = (on_file)(path.clone()) {
                error!(path = %path.display(), "error processing file: {err:#}");
            }
        }
        Stability::TimedOut => {
            warn!(path = %path.display(), "file never became stable");
        }
        Stability::Cancelled => {}
    }
}
