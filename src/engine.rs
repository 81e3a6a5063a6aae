// Participant: the public façade wiring the entry cache, lock manager,
// wait manager, exchange manager and session manager into one coordination
// engine endpoint. One `Participant` per process (or per logical client in
// tests), constructed over a shared `Storage` and a `Transport` endpoint
// dedicated to it.
//
// Breaks the lock <-> session dependency the design notes call out: the
// session manager's cleaner needs to release locks and reclaim ephemeral
// entries, but the lock manager must not depend on the session manager to
// avoid a construction cycle. `Participant` is the single place that holds
// every component and implements `SessionCleanupHandler` on their behalf.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::entry_cache::EntryCache;
use crate::error::{Error, Result};
use crate::exchange::{ExchangeManager, Message};
use crate::ids::SessionId;
use crate::lock::LockManager;
use crate::model::StoredEntry;
use crate::path::Path;
use crate::session_mgr::{tasks, SessionCleanupHandler, SessionManager};
use crate::storage::{CasOutcome, Storage};
use crate::transport::Transport;
use crate::wait::WaitManager;

pub struct Participant {
    storage: Arc<dyn Storage>,
    cache: Arc<EntryCache>,
    wait: Arc<WaitManager>,
    lock: Arc<LockManager>,
    exchange: Arc<ExchangeManager>,
    sessions: Arc<SessionManager>,
    session: SessionId,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Participant {
    /// Begins a session against `transport`'s local address, wires every
    /// component together, and spawns the exchange receive loop, lease
    /// renewer and session cleaner background tasks.
    pub async fn bootstrap(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(EntryCache::new());
        let wait = Arc::new(WaitManager::new(storage.clone(), &config));
        let lock = Arc::new(LockManager::new(storage.clone(), cache.clone(), wait.clone()));
        let sessions = Arc::new(SessionManager::new(storage.clone(), &config));

        let now_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let session = sessions.begin(now_millis, transport.local_address()).await?;
        transport.bind_session(&session);

        let exchange = Arc::new(ExchangeManager::new(
            transport,
            cache.clone(),
            wait.directory(),
            lock.clone(),
            session.clone(),
        ));

        let participant = Arc::new(Self {
            storage,
            cache,
            wait,
            lock,
            exchange,
            sessions,
            session,
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        handles.push(tokio::spawn(participant.exchange.clone().run_receive_loop()));
        handles.push(tokio::spawn(tasks::run_renewer(
            participant.sessions.clone(),
            participant.session.clone(),
            participant.shutdown.clone(),
        )));
        handles.push(tokio::spawn(tasks::run_cleaner(
            participant.sessions.clone(),
            participant.clone() as Arc<dyn SessionCleanupHandler>,
            config.termination_poll_interval,
            participant.shutdown.clone(),
        )));
        *participant.tasks.lock().unwrap() = handles;

        Ok(participant)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Cancels background tasks and ends this participant's own session.
    /// Does not wait for other participants' cleaners to reclaim whatever
    /// this session was holding — that happens asynchronously, same as any
    /// other session death.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.sessions.end(&self.session).await
    }

    async fn live_targets(&self) -> Result<Vec<SessionId>> {
        self.sessions.live_session_ids().await
    }

    async fn broadcast(&self, message: Message) {
        match self.live_targets().await {
            Ok(targets) => self.exchange.broadcast(message, &targets).await,
            Err(err) => tracing::warn!(%err, "could not list live sessions to broadcast to"),
        }
    }

    /// Reads `path`'s value through the entry cache. On a cache hit, returns
    /// immediately with no lock involved — a cache-coherent read doesn't
    /// need mutual exclusion, only the invalidation-backed consistency the
    /// entry cache already provides. On a miss, acquires the path's global
    /// read-lock (which blocks until any foreign write-lock is released)
    /// before populating the slot, and drops the just-acquired lock again
    /// if a concurrent invalidation wins the race to populate the slot
    /// first — the value just fetched is still returned either way.
    pub async fn get(&self, path: &Path, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let slot = self.cache.slot(path);
        let (cached, version) = slot.current();
        if let Some(entry) = cached {
            return Ok(entry.value);
        }

        let entry = self
            .lock
            .acquire_read(path, &self.session, self.sessions.as_ref(), cancel)
            .await?;
        let (resolved, _) = slot.update(version, Some(entry.clone()));
        if resolved.is_none() {
            self.lock.release_read(path, &self.session).await?;
            self.broadcast(Message::ReleasedReadLock(path.clone())).await;
        }
        Ok(entry.value)
    }

    pub async fn children(&self, path: &Path, cancel: &CancellationToken) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.storage
            .get_entry(path)
            .await?
            .map(|e| e.children)
            .ok_or_else(|| Error::EntryNotFound(path.clone()))
    }

    pub async fn create(
        &self,
        path: &Path,
        value: Vec<u8>,
        ephemeral: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal("cannot create the root path".into()))?;
        let name = path
            .name()
            .ok_or_else(|| Error::Internal("cannot create the root path".into()))?
            .to_string();

        self.lock
            .acquire_write(&parent, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
            .await?;
        let result = self.create_under_held_parent_lock(path, &parent, &name, value, ephemeral).await;
        self.lock.release_write(&parent, &self.session).await?;
        self.broadcast(Message::InvalidateCacheEntry(parent.clone())).await;
        result
    }

    async fn create_under_held_parent_lock(
        &self,
        path: &Path,
        parent: &Path,
        name: &str,
        value: Vec<u8>,
        ephemeral: bool,
    ) -> Result<()> {
        let now = SystemTime::now();
        let mut entry = StoredEntry::new(path.clone(), now);
        entry.value = value;
        if ephemeral {
            entry.ephemeral_owner = Some(self.session.clone());
        }

        match self.storage.update_entry(Some(entry), None).await? {
            CasOutcome::Success(_) => {}
            CasOutcome::Conflict(_) => return Err(Error::DuplicateEntry(path.clone())),
        }

        self.lock
            .mutate_exclusive(parent, |e| e.add_child(name, &self.session, now))
            .await?;

        if ephemeral {
            self.sessions.add_entry(&self.session, path.clone()).await?;
        }

        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }

    /// Deletes `path`. A non-empty `path` is rejected unless `recursive` is
    /// set, in which case every descendant is removed first, depth-first,
    /// in each entry's `children`-list order — deterministic across
    /// participants, so two participants racing to recursively delete
    /// overlapping subtrees never deadlock against each other's ordering.
    pub async fn delete(&self, path: &Path, recursive: bool, cancel: &CancellationToken) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal("cannot delete the root path".into()))?;
        let name = path
            .name()
            .ok_or_else(|| Error::Internal("cannot delete the root path".into()))?
            .to_string();

        self.lock
            .acquire_write(path, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
            .await?;

        if let Err(err) = self.delete_subtree_under_held_lock(path, recursive, cancel).await {
            self.lock.release_write(path, &self.session).await?;
            return Err(err);
        }

        if let Err(err) = self
            .lock
            .acquire_write(&parent, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
            .await
        {
            self.lock.release_write(path, &self.session).await?;
            return Err(err);
        }
        let result = self.lock.remove_exclusive(path, &self.session).await.and(
            self.lock
                .mutate_exclusive(&parent, |e| e.remove_child(&name, &self.session, SystemTime::now()))
                .await
                .map(|_| ()),
        );
        self.lock.release_write(&parent, &self.session).await?;
        result?;

        self.sessions.remove_entry(&self.session, path).await?;

        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        self.broadcast(Message::InvalidateCacheEntry(parent.clone())).await;
        Ok(())
    }

    /// Removes every child of `path` (already write-locked by this session,
    /// held across this whole call), in `children`-list order, without
    /// touching `path`'s own children bookkeeping or releasing `path`'s
    /// lock — `path` itself is removed by `delete`'s caller immediately
    /// after this returns. Rejects outright when `path` has children and
    /// `recursive` is false.
    async fn delete_subtree_under_held_lock(
        &self,
        path: &Path,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self
            .storage
            .get_entry(path)
            .await?
            .ok_or_else(|| Error::EntryNotFound(path.clone()))?;
        if current.children.is_empty() {
            return Ok(());
        }
        if !recursive {
            return Err(Error::Internal(format!(
                "cannot delete {path}: it still has children"
            )));
        }
        for child_name in &current.children {
            let child_path = path.child(child_name);
            self.lock
                .acquire_write(&child_path, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
                .await?;
            if let Err(err) = Box::pin(self.delete_subtree_under_held_lock(&child_path, true, cancel)).await {
                self.lock.release_write(&child_path, &self.session).await?;
                return Err(err);
            }
            self.lock.remove_exclusive(&child_path, &self.session).await?;
            self.lock.release_write(&child_path, &self.session).await?;
            self.sessions.remove_entry(&self.session, &child_path).await?;
            self.broadcast(Message::InvalidateCacheEntry(child_path)).await;
        }
        Ok(())
    }

    pub async fn set_value(&self, path: &Path, value: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        self.lock
            .acquire_write(path, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
            .await?;
        let result = self
            .lock
            .mutate_exclusive(path, |e| e.set_value(value.clone(), &self.session, SystemTime::now()))
            .await;
        self.lock.release_write(path, &self.session).await?;
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        result.map(|_| ())
    }

    pub async fn acquire_write_lock(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        self.lock
            .acquire_write(path, &self.session, self.sessions.as_ref(), self.exchange.as_ref(), cancel)
            .await?;
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }

    /// Releases this session's write-lock on `path`. Best-effort regardless
    /// of `cancel`'s state: a release in progress must run to completion so
    /// a cancelled caller (e.g. during shutdown) never leaks the lock.
    pub async fn release_write_lock(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            tracing::debug!(%path, "write-lock release requested under a cancelled token; completing anyway");
        }
        self.lock.release_write(path, &self.session).await?;
        self.broadcast(Message::ReleasedWriteLock(path.clone())).await;
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }

    pub async fn acquire_read_lock(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        self.lock
            .acquire_read(path, &self.session, self.sessions.as_ref(), cancel)
            .await?;
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }

    /// Releases this session's read-lock on `path`. Best-effort regardless
    /// of `cancel`'s state, same rationale as `release_write_lock`.
    pub async fn release_read_lock(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            tracing::debug!(%path, "read-lock release requested under a cancelled token; completing anyway");
        }
        self.lock.release_read(path, &self.session).await?;
        self.broadcast(Message::ReleasedReadLock(path.clone())).await;
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }

    async fn remove_child_unchecked(&self, parent: &Path, name: &str) -> Result<()> {
        let mut current = self.storage.get_entry(parent).await?;
        loop {
            let entry = match &current {
                Some(e) if e.children.iter().any(|c| c == name) => e,
                _ => return Ok(()),
            };
            let mut next = entry.clone();
            next.children.retain(|c| c != name);
            next.storage_version += 1;
            match self.storage.update_entry(Some(next), current.clone()).await? {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(parent);
                    self.broadcast(Message::InvalidateCacheEntry(parent.clone())).await;
                    return Ok(());
                }
                CasOutcome::Conflict(latest) => current = latest,
            }
        }
    }

    /// Releases whatever locks `dead` held on `path`, and if `dead` was the
    /// path's ephemeral owner, removes it entirely. Bypasses the
    /// exclusive-hold precondition `StoredEntry::remove` enforces for live
    /// callers: the owning session no longer exists to dispute the
    /// reclamation, so there is no actor left to serialize against other
    /// than concurrent storage writers, which CAS already handles.
    async fn reclaim_path_for_dead_session(&self, path: &Path, dead: &SessionId) -> Result<()> {
        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = match &current {
                Some(e) => e,
                None => return Ok(()),
            };
            let holds_write = entry.write_lock.as_ref() == Some(dead);
            let holds_read = entry.read_locks.contains(dead);
            if !holds_write && !holds_read {
                break;
            }
            let mut next = entry.clone();
            next.write_lock = if holds_write { None } else { next.write_lock };
            next.read_locks.remove(dead);
            next.storage_version += 1;
            match self.storage.update_entry(Some(next), current.clone()).await? {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    if holds_write {
                        self.wait.directory().notify_write_lock_released(path);
                        self.broadcast(Message::ReleasedWriteLock(path.clone())).await;
                    }
                    self.wait.directory().notify_read_locks_released(path);
                    self.broadcast(Message::ReleasedReadLock(path.clone())).await;
                    self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
                    break;
                }
                CasOutcome::Conflict(latest) => current = latest,
            }
        }

        let is_ephemeral_owner = self
            .storage
            .get_entry(path)
            .await?
            .map(|e| e.ephemeral_owner.as_ref() == Some(dead))
            .unwrap_or(false);
        if !is_ephemeral_owner {
            return Ok(());
        }

        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = match &current {
                Some(e) if e.ephemeral_owner.as_ref() == Some(dead) => e,
                _ => return Ok(()),
            };
            if !entry.children.is_empty() {
                tracing::warn!(%path, "ephemeral entry has children at owner death, leaving for manual cleanup");
                return Ok(());
            }
            match self.storage.update_entry(None, current.clone()).await? {
                CasOutcome::Success(_) => {
                    self.cache.invalidate(path);
                    break;
                }
                CasOutcome::Conflict(latest) => current = latest,
            }
        }

        if let (Some(parent), Some(name)) = (path.parent(), path.name()) {
            self.remove_child_unchecked(&parent, name).await?;
        }
        self.broadcast(Message::InvalidateCacheEntry(path.clone())).await;
        Ok(())
    }
}

#[async_trait]
impl SessionCleanupHandler for Participant {
    async fn clean_up_session(&self, session: &SessionId, entry_paths: &HashSet<Path>) -> Result<()> {
        for path in entry_paths {
            self.reclaim_path_for_dead_session(path, session).await?;
        }
        Ok(())
    }
}

/// How long `shutdown` gives background tasks to notice cancellation before
/// it aborts them outright. Currently unused by `abort`-based shutdown, but
/// kept as the documented contract for a future graceful-join variant.
#[allow(dead_code)]
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemNetwork, MemStorage};

    async fn two_participants() -> (Arc<Participant>, Arc<Participant>, Arc<MemStorage>) {
        let storage = Arc::new(MemStorage::new());
        let net = MemNetwork::new();
        let config = EngineConfig::default();

        let a = Participant::bootstrap(
            storage.clone(),
            Arc::new(net.transport(vec![1])),
            config.clone(),
        )
        .await
        .unwrap();
        let b = Participant::bootstrap(
            storage.clone(),
            Arc::new(net.transport(vec![2])),
            config,
        )
        .await
        .unwrap();
        (a, b, storage)
    }

    fn nc() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let (a, _b, _storage) = two_participants().await;
        let root_child = Path::root().child("service-a");
        a.create(&root_child, b"hello".to_vec(), false, &nc()).await.unwrap();
        assert_eq!(a.get(&root_child, &nc()).await.unwrap(), b"hello");
        a.delete(&root_child, false, &nc()).await.unwrap();
        assert!(matches!(a.get(&root_child, &nc()).await, Err(Error::EntryNotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (a, _b, _storage) = two_participants().await;
        let path = Path::root().child("x");
        a.create(&path, vec![], false, &nc()).await.unwrap();
        assert!(matches!(
            a.create(&path, vec![], false, &nc()).await,
            Err(Error::DuplicateEntry(_))
        ));
    }

    #[tokio::test]
    async fn write_lock_blocks_a_second_participant() {
        let (a, b, _storage) = two_participants().await;
        let path = Path::root().child("lockable");
        a.create(&path, vec![], false, &nc()).await.unwrap();

        a.acquire_write_lock(&path, &nc()).await.unwrap();
        let b2 = b.clone();
        let path2 = path.clone();
        let waiter = tokio::spawn(async move { b2.acquire_write_lock(&path2, &CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        a.release_write_lock(&path, &nc()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn get_after_remote_set_value_sees_fresh_value_via_invalidation() {
        let (a, b, _storage) = two_participants().await;
        let path = Path::root().child("shared");
        a.create(&path, b"v1".to_vec(), false, &nc()).await.unwrap();
        assert_eq!(b.get(&path, &nc()).await.unwrap(), b"v1");

        a.set_value(&path, b"v2".to_vec(), &nc()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.get(&path, &nc()).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn ephemeral_entry_is_reclaimed_after_owner_session_ends() {
        let (a, b, _storage) = two_participants().await;
        let path = Path::root().child("ephemeral-member");
        a.create(&path, vec![], true, &nc()).await.unwrap();
        assert_eq!(b.get(&path, &nc()).await.unwrap(), Vec::<u8>::new());

        a.shutdown().await.unwrap();

        // the cleaner runs on b's poll interval (2s default); nudge it by
        // polling get() until the entry disappears, bounded by a timeout.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if matches!(b.get(&path, &nc()).await, Err(Error::EntryNotFound(_))) {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("ephemeral entry was never reclaimed");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn recursive_delete_removes_children_in_list_order() {
        let (a, _b, _storage) = two_participants().await;
        let parent = Path::root().child("group");
        let c1 = parent.child("c1");
        let c2 = parent.child("c2");
        let c3 = parent.child("c3");

        a.create(&parent, vec![], false, &nc()).await.unwrap();
        a.create(&c1, vec![], false, &nc()).await.unwrap();
        a.create(&c2, vec![], false, &nc()).await.unwrap();
        a.create(&c3, vec![], false, &nc()).await.unwrap();
        assert_eq!(a.children(&parent, &nc()).await.unwrap(), vec!["c1", "c2", "c3"]);

        a.delete(&parent, true, &nc()).await.unwrap();
        assert!(matches!(a.get(&parent, &nc()).await, Err(Error::EntryNotFound(_))));
        assert!(matches!(a.get(&c1, &nc()).await, Err(Error::EntryNotFound(_))));
        assert!(matches!(a.get(&c2, &nc()).await, Err(Error::EntryNotFound(_))));
        assert!(matches!(a.get(&c3, &nc()).await, Err(Error::EntryNotFound(_))));
    }

    #[tokio::test]
    async fn cancelled_write_lock_acquire_leaves_no_residual_lock() {
        let (a, b, _storage) = two_participants().await;
        let path = Path::root().child("contended");
        a.create(&path, vec![], false, &nc()).await.unwrap();

        a.acquire_write_lock(&path, &nc()).await.unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let blocked = b.acquire_write_lock(&path, &cancel).await;
        assert!(matches!(blocked, Err(Error::Cancelled)));

        a.release_write_lock(&path, &nc()).await.unwrap();
        // a third party can still acquire the lock: b's cancelled attempt
        // left nothing behind.
        b.acquire_write_lock(&path, &nc()).await.unwrap();
    }
}
