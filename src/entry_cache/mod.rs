// Process-local entry cache with version-coordinated invalidation.
//
// Each path gets one `CacheSlot`, created lazily and kept for the life of
// the participant. A slot bundles the cached entry (if any), a
// cache-version counter bumped on every invalidation, and the two local
// mutexes (`local_write_mutex`, `local_read_mutex`) the lock manager uses to
// serialize in-process lock handshakes for that path — matching the
// teacher's pattern of guarding a per-resource cache entry with its own
// `parking_lot` primitives (`cache::cache_invalidation::CacheInvalidator`),
// generalized here from table/row dependency sets to a single per-path slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::model::StoredEntry;
use crate::path::Path;

pub struct CacheSlot {
    pub path: Path,
    entry: SyncMutex<Option<StoredEntry>>,
    cache_version: AtomicU64,
    /// Serializes mutations to this path's cache slot and any in-process
    /// lock handshake that touches it (step 2 of the write-lock-acquire
    /// sequence in the lock manager).
    pub local_write_mutex: AsyncMutex<()>,
    /// Serializes read-lock acquisition (which mutates the stored entry).
    pub local_read_mutex: AsyncMutex<()>,
}

impl CacheSlot {
    fn new(path: Path) -> Self {
        Self {
            path,
            entry: SyncMutex::new(None),
            cache_version: AtomicU64::new(0),
            local_write_mutex: AsyncMutex::new(()),
            local_read_mutex: AsyncMutex::new(()),
        }
    }

    pub fn version(&self) -> u64 {
        self.cache_version.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> (Option<StoredEntry>, u64) {
        let guard = self.entry.lock();
        (guard.clone(), self.version())
    }

    /// Applies `entry` iff `observed_version` still matches the slot's
    /// current version and `entry`'s storage_version is not behind what's
    /// already cached (guards against a stale concurrent write winning over
    /// a fresher invalidation). Returns the slot's resulting (entry,
    /// version).
    pub fn update(
        &self,
        observed_version: u64,
        entry: Option<StoredEntry>,
    ) -> (Option<StoredEntry>, u64) {
        let mut guard = self.entry.lock();
        if self.version() != observed_version {
            return (guard.clone(), self.version());
        }
        let not_stale = match (&*guard, &entry) {
            (Some(current), Some(candidate)) => candidate.storage_version >= current.storage_version,
            _ => true,
        };
        if not_stale {
            *guard = entry;
        }
        (guard.clone(), self.version())
    }

    /// Bumps the cache version and drops the cached entry. Never touches a
    /// read-lock — invalidation and lock release are sequenced by the lock
    /// manager / exchange manager, not by the cache.
    pub fn invalidate(&self) -> u64 {
        let mut guard = self.entry.lock();
        *guard = None;
        self.cache_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
pub struct EntryCache {
    slots: DashMap<Path, Arc<CacheSlot>>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `path`, creating an invalid (empty) one on
    /// first access.
    pub fn slot(&self, path: &Path) -> Arc<CacheSlot> {
        self.slots
            .entry(path.clone())
            .or_insert_with(|| Arc::new(CacheSlot::new(path.clone())))
            .clone()
    }

    pub fn invalidate(&self, path: &Path) {
        if let Some(slot) = self.slots.get(path) {
            slot.invalidate();
        }
    }
}
