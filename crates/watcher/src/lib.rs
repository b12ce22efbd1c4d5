//! Folder-watch front end for the ingestion daemon.
//!
//! An [`EventSource`] backend reports candidate paths out of one or more
//! watched folders. [`WatchService`] screens every candidate on its own task:
//! name admission, duplicate suppression through [`RecentPathCache`], then a
//! write-stability wait before the ingest callback fires.

pub mod admission;
pub mod cache;
pub mod service;
pub mod source;
pub mod stability;

pub use admission::{admissible_name, admissible_path};
pub use cache::{DEFAULT_RECENT_MAX, DEFAULT_RECENT_TTL, RecentPathCache};
pub use service::{IngestCallback, WatchService};
pub use source::{EventSource, NotifyBackend, PollBackend};
pub use stability::{Stability, StabilityPolicy, wait_for_stable};

use thiserror::Error;

/// Errors surfaced by watch backends and the watch service.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("no watch roots configured")]
    NoRoots,
    #[error("filesystem notification error: {0}")]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("watch task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
