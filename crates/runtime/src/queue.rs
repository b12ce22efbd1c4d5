//! The hand-off channel between watcher tasks and the single intake worker.

use std::path::PathBuf;

use tokio::sync::mpsc;

/// Producer half of the ingestion queue. Cheap to clone; every watcher task
/// and the catch-up sweep hold one.
#[derive(Debug, Clone)]
pub struct IngestSender {
    inner: mpsc::UnboundedSender<PathBuf>,
}

/// Consumer half, owned by the worker loop.
#[derive(Debug)]
pub struct IngestReceiver {
    inner: mpsc::UnboundedReceiver<PathBuf>,
}

/// Build the admitted-file queue.
///
/// Unbounded on purpose: producers enqueue from synchronous admission
/// callbacks and must never block or drop an admitted file. Arrival rate is
/// one entry per real file drop, so depth stays tiny in practice.
pub fn ingestion_queue() -> (IngestSender, IngestReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (IngestSender { inner: tx }, IngestReceiver { inner: rx })
}

impl IngestSender {
    /// Returns false when the worker side has shut down.
    pub fn enqueue(&self, path: PathBuf) -> bool {
        self.inner.send(path).is_ok()
    }
}

impl IngestReceiver {
    /// Next path in drop order, or `None` once every sender is gone.
    pub async fn pop(&mut self) -> Option<PathBuf> {
        self.inner.recv().await
    }
}
