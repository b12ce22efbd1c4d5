use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

pub const DEFAULT_RECENT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_RECENT_MAX: usize = 500;

/// Suppresses duplicate notifications for paths that were handled recently.
///
/// Entries expire `ttl` after they were last added. [`RecentPathCache::seen`]
/// is a plain membership check and does not refresh an entry, so a path
/// becomes eligible again once its entry ages out no matter how often it has
/// been asked about in between. Beyond `max_entries` the oldest entries are
/// evicted first. Safe to share across tasks.
pub struct RecentPathCache {
    ttl: Duration,
    entries: Mutex<LruCache<PathBuf, Instant>>,
}

impl RecentPathCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Whether `path` was added within the ttl window. Expired entries are
    /// dropped before the check.
    pub fn seen(&self, path: &Path) -> bool {
        let mut entries = self.lock();
        self.purge_expired(&mut entries);
        entries.contains(path)
    }

    /// Record a handled path. Re-adding refreshes both the timestamp and the
    /// eviction position.
    pub fn add(&self, path: PathBuf) {
        let mut entries = self.lock();
        self.purge_expired(&mut entries);
        entries.put(path, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Entries are ordered by add time, so expired ones always sit at the
    // cold end.
    fn purge_expired(&self, entries: &mut LruCache<PathBuf, Instant>) {
        while let Some((_, added)) = entries.peek_lru() {
            if added.elapsed() > self.ttl {
                entries.pop_lru();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<PathBuf, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RecentPathCache {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_TTL, DEFAULT_RECENT_MAX)
    }
}
