// Lock manager: read/write lock acquire and release on entries, following
// the local-then-global discipline from the concurrency model — an
// in-process mutex on the path's cache slot serializes same-process
// contenders before any of them touch storage, so the CAS loop against the
// backing store only ever contends with other participants, never with
// itself.
//
// Cross-process notification (telling other participants a lock was
// released) is deliberately not this module's job — that's wired up one
// layer out, in the engine façade, to keep this module's dependencies to
// just storage, cache and the wait manager.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entry_cache::EntryCache;
use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::model::StoredEntry;
use crate::path::Path;
use crate::storage::{CasOutcome, Storage};
use crate::wait::{PeerNotifier, SessionLiveness, WaitManager};

/// A capability the exchange manager uses to drop a local read-lock in
/// response to a peer's invalidation request, without holding a full
/// `LockManager` reference at construction time — see the design notes on
/// avoiding the lock/wait/exchange construction cycle.
#[async_trait]
pub trait ReadLockReleaser: Send + Sync {
    async fn release_local_read_lock(&self, path: &Path, session: &SessionId) -> Result<()>;
}

pub struct LockManager {
    storage: Arc<dyn Storage>,
    cache: Arc<EntryCache>,
    wait: Arc<WaitManager>,
}

impl LockManager {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<EntryCache>, wait: Arc<WaitManager>) -> Self {
        Self { storage, cache, wait }
    }

    fn now() -> SystemTime {
        SystemTime::now()
    }

    async fn cas_loop(
        &self,
        path: &Path,
        mut current: Option<StoredEntry>,
        transform: impl Fn(&StoredEntry) -> StoredEntry,
    ) -> Result<StoredEntry> {
        loop {
            let entry = current
                .as_ref()
                .ok_or_else(|| Error::EntryNotFound(path.clone()))?;
            let next = transform(entry);
            match self
                .storage
                .update_entry(Some(next.clone()), current.clone())
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    return Ok(next);
                }
                CasOutcome::Conflict(latest) => {
                    current = latest;
                }
            }
        }
    }

    /// Acquires `path`'s write-lock for `session`, per the write path's
    /// five-step algorithm: wait out any foreign write-lock holder, CAS the
    /// write-lock in, then wait out any foreign read-lock holders before
    /// returning. If step three or four fails (including cancellation), the
    /// just-acquired write-lock is released best-effort before the error
    /// propagates, so a cancelled acquire never leaves a residual lock.
    pub async fn acquire_write(
        &self,
        path: &Path,
        session: &SessionId,
        liveness: &dyn SessionLiveness,
        notifier: &dyn PeerNotifier,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        if !liveness.is_session_alive(session).await? {
            return Err(Error::SessionTerminated);
        }

        let slot = self.cache.slot(path);
        let _guard = tokio::select! {
            guard = slot.local_write_mutex.lock() => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        loop {
            let current = self
                .wait
                .wait_for_write_lock_release(path, Some(session), liveness, cancel)
                .await?;
            let current = match current {
                Some(e) => e,
                None => return Err(Error::EntryNotFound(path.clone())),
            };
            match self
                .storage
                .update_entry(
                    Some(current.acquire_write_lock(session, Self::now())),
                    Some(current.clone()),
                )
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    break;
                }
                CasOutcome::Conflict(_) => continue,
            }
        }

        if let Err(err) = self
            .wait
            .wait_for_read_locks_release(path, Some(session), notifier, cancel)
            .await
        {
            let _ = self.release_write(path, session).await;
            return Err(err);
        }

        self.storage
            .get_entry(path)
            .await?
            .ok_or_else(|| Error::EntryNotFound(path.clone()))
    }

    pub async fn release_write(&self, path: &Path, session: &SessionId) -> Result<()> {
        let slot = self.cache.slot(path);
        let _guard = slot.local_write_mutex.lock().await;

        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = match &current {
                Some(e) if e.write_lock.as_ref() == Some(session) => e,
                _ => return Ok(()), // already released; idempotent no-op
            };
            let next = entry.release_write_lock(session, Self::now());
            match self
                .storage
                .update_entry(Some(next), current.clone())
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    self.wait.directory().notify_write_lock_released(path);
                    self.wait.directory().notify_read_locks_released(path);
                    return Ok(());
                }
                CasOutcome::Conflict(latest) => {
                    current = latest;
                }
            }
        }
    }

    pub async fn acquire_read(
        &self,
        path: &Path,
        session: &SessionId,
        liveness: &dyn SessionLiveness,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        let slot = self.cache.slot(path);
        let _guard = tokio::select! {
            guard = slot.local_read_mutex.lock() => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        loop {
            let current = self
                .wait
                .wait_for_write_lock_release(path, Some(session), liveness, cancel)
                .await?;
            let current = match current {
                Some(e) => e,
                None => return Err(Error::EntryNotFound(path.clone())),
            };
            match self
                .storage
                .update_entry(
                    Some(current.acquire_read_lock(session, Self::now())),
                    Some(current.clone()),
                )
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    return self
                        .storage
                        .get_entry(path)
                        .await?
                        .ok_or_else(|| Error::EntryNotFound(path.clone()));
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    pub async fn release_read(&self, path: &Path, session: &SessionId) -> Result<()> {
        let slot = self.cache.slot(path);
        let _guard = slot.local_read_mutex.lock().await;

        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = match &current {
                Some(e) if e.read_locks.contains(session) => e,
                _ => return Ok(()),
            };
            let next = entry.release_read_lock(session, Self::now());
            match self
                .storage
                .update_entry(Some(next), current.clone())
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    self.wait.directory().notify_read_locks_released(path);
                    return Ok(());
                }
                CasOutcome::Conflict(latest) => {
                    current = latest;
                }
            }
        }
    }

    /// Tombstones `path`, requiring `session` to already exclusively hold
    /// it and its children list to be empty (enforced by
    /// `StoredEntry::remove`'s precondition).
    pub async fn remove_exclusive(&self, path: &Path, session: &SessionId) -> Result<()> {
        let slot = self.cache.slot(path);
        let _guard = slot.local_write_mutex.lock().await;
        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = current
                .as_ref()
                .ok_or_else(|| Error::EntryNotFound(path.clone()))?;
            let next = entry.remove(session);
            match self
                .storage
                .update_entry(next, current.clone())
                .await?
            {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    return Ok(());
                }
                CasOutcome::Conflict(latest) => current = latest,
            }
        }
    }

    /// Applies `transform` to the entry at `path` under its cached slot's
    /// local write mutex, retrying on CAS conflict. The caller is
    /// responsible for ensuring `session` already exclusively holds the
    /// entry (the transform itself enforces this via its precondition).
    pub async fn mutate_exclusive(
        &self,
        path: &Path,
        transform: impl Fn(&StoredEntry) -> StoredEntry,
    ) -> Result<StoredEntry> {
        let slot = self.cache.slot(path);
        let _guard = slot.local_write_mutex.lock().await;
        let current = self.storage.get_entry(path).await?;
        self.cas_loop(path, current, transform).await
    }
}

#[async_trait]
impl ReadLockReleaser for LockManager {
    async fn release_local_read_lock(&self, path: &Path, session: &SessionId) -> Result<()> {
        self.release_read(path, session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mem::MemStorage;

    fn sid(n: u8) -> SessionId {
        SessionId::generate(n as u64, vec![n])
    }

    struct AlwaysAlive;
    #[async_trait]
    impl SessionLiveness for AlwaysAlive {
        async fn is_session_alive(&self, _session: &SessionId) -> Result<bool> {
            Ok(true)
        }
    }

    struct NoopNotifier;
    #[async_trait]
    impl PeerNotifier for NoopNotifier {
        async fn request_read_lock_release(&self, _target: &SessionId, _path: &Path) {}
    }

    async fn manager() -> (LockManager, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let cache = Arc::new(EntryCache::new());
        let wait = Arc::new(WaitManager::new(storage.clone(), &EngineConfig::default()));
        (LockManager::new(storage.clone(), cache, wait), storage)
    }

    #[tokio::test]
    async fn second_writer_blocks_until_release() {
        let (lm, storage) = manager().await;
        let path = Path::root().child("a");
        let now = SystemTime::now();
        storage
            .update_entry(Some(StoredEntry::new(path.clone(), now)), None)
            .await
            .unwrap();

        let s1 = sid(1);
        let s2 = sid(2);
        lm.acquire_write(&path, &s1, &AlwaysAlive, &NoopNotifier, &CancellationToken::new())
            .await
            .unwrap();

        let lm = Arc::new(lm);
        let waiter = {
            let lm = lm.clone();
            let path = path.clone();
            tokio::spawn(async move {
                lm.acquire_write(&path, &s2, &AlwaysAlive, &NoopNotifier, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lm.release_write(&path, &s1).await.unwrap();
        let entry = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.write_lock, Some(s2));
    }

    #[tokio::test]
    async fn read_locks_are_exclusive_of_a_foreign_write_lock() {
        let (lm, storage) = manager().await;
        let path = Path::root().child("a");
        let now = SystemTime::now();
        storage
            .update_entry(Some(StoredEntry::new(path.clone(), now)), None)
            .await
            .unwrap();

        let writer = sid(1);
        let reader = sid(2);
        lm.acquire_write(&path, &writer, &AlwaysAlive, &NoopNotifier, &CancellationToken::new())
            .await
            .unwrap();

        let lm = Arc::new(lm);
        let waiter = {
            let lm = lm.clone();
            let path = path.clone();
            tokio::spawn(async move {
                lm.acquire_read(&path, &reader, &AlwaysAlive, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        lm.release_write(&path, &writer).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn write_lock_waits_for_foreign_reader_to_release() {
        let (lm, storage) = manager().await;
        let path = Path::root().child("a");
        let now = SystemTime::now();
        storage
            .update_entry(Some(StoredEntry::new(path.clone(), now)), None)
            .await
            .unwrap();

        let reader = sid(1);
        let writer = sid(2);
        lm.acquire_read(&path, &reader, &AlwaysAlive, &CancellationToken::new())
            .await
            .unwrap();

        let lm = Arc::new(lm);
        let waiter = {
            let lm = lm.clone();
            let path = path.clone();
            tokio::spawn(async move {
                lm.acquire_write(&path, &writer, &AlwaysAlive, &NoopNotifier, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(
            !waiter.is_finished(),
            "write-lock acquire must wait out a foreign read-lock holder"
        );

        lm.release_read(&path, &reader).await.unwrap();
        let entry = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.write_lock, Some(writer));
    }
}
