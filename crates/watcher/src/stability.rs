use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::sync::watch;

/// Poll parameters for deciding when a dropped file has finished writing.
#[derive(Debug, Clone, Copy)]
pub struct StabilityPolicy {
    /// Consecutive equal-size observations required when the exclusive-open
    /// probe cannot settle the question.
    pub checks: u32,
    pub poll_delay: Duration,
    pub timeout: Duration,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            checks: 3,
            poll_delay: Duration::from_millis(400),
            timeout: Duration::from_secs(10),
        }
    }
}

/// How a stability wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable,
    TimedOut,
    Cancelled,
}

/// Wait until `path` looks fully written.
///
/// Each poll first tries to open the file and take an exclusive lock; if that
/// succeeds no writer is holding it and the file is stable. Otherwise the
/// size is compared against the previous poll, and `policy.checks`
/// consecutive equal observations also count as stable. A path that is
/// missing on a poll is not a failure; copies staged through a rename make
/// files vanish and reappear, so polling continues until the timeout.
/// Flipping `shutdown` ends the wait between polls.
pub async fn wait_for_stable(
    path: &Path,
    policy: &StabilityPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Stability {
    if *shutdown.borrow() {
        return Stability::Cancelled;
    }

    let start = Instant::now();
    let mut last_size: Option<u64> = None;
    let mut stable_hits: u32 = 0;

    while start.elapsed() < policy.timeout {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if can_open_exclusive(path) {
                return Stability::Stable;
            }
            let size = meta.len();
            if last_size == Some(size) {
                stable_hits += 1;
                if stable_hits >= policy.checks {
                    return Stability::Stable;
                }
            } else {
                stable_hits = 0;
                last_size = Some(size);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.poll_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Stability::Cancelled;
                }
            }
        }
    }

    Stability::TimedOut
}

// On platforms with mandatory sharing rules the open itself fails while a
// writer holds the file. With advisory locks this usually succeeds at once
// and the size heuristic is the effective check.
fn can_open_exclusive(path: &Path) -> bool {
    match File::open(path) {
        Ok(file) => {
            if file.try_lock_exclusive().is_ok() {
                let _ = FileExt::unlock(&file);
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}
