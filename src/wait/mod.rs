// Wait directory + wait manager: in-process notification of lock-release
// events, with an exponential-backoff poll as a fallback for notifications
// lost to a race or dropped by a remote peer's best-effort send.
//
// The two capability traits below let the wait manager call back into the
// session manager (to check a lock holder's liveness) and the exchange
// manager (to ask a foreign peer to drop a read-lock) without holding a
// reference to either at construction time — callers pass a concrete
// implementor in per call, the same dependency-inversion shape
// `SessionCleanupHandler` already uses one layer out in `session_mgr`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::model::StoredEntry;
use crate::path::Path;
use crate::storage::{CasOutcome, Storage};

/// A capability the session manager exposes to the wait manager: whether a
/// given session's lease is still current. Kept narrow rather than a full
/// `SessionManager` reference so the wait manager never needs one at
/// construction time.
#[async_trait]
pub trait SessionLiveness: Send + Sync {
    async fn is_session_alive(&self, session: &SessionId) -> Result<bool>;
}

/// A capability the exchange manager exposes to the wait manager: best-effort
/// request that `target` drop its read-lock on `path`. Fire-and-forget, same
/// as every other exchange send — correctness never depends on delivery,
/// only the backoff poll below does.
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    async fn request_read_lock_release(&self, target: &SessionId, path: &Path);
}

/// Per-path `Notify` handles for lock-release events. Entries here are
/// shared infrastructure, not versioned state — a spurious or duplicate
/// `notify_waiters()` only causes an extra wasted wakeup, never a
/// correctness problem, since every waiter re-checks the actual stored
/// entry before deciding to stop waiting.
#[derive(Default)]
pub struct WaitDirectory {
    write_release: DashMap<Path, Arc<Notify>>,
    read_release: DashMap<Path, Arc<Notify>>,
}

impl WaitDirectory {
    fn handle(map: &DashMap<Path, Arc<Notify>>, path: &Path) -> Arc<Notify> {
        map.entry(path.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify_write_lock_released(&self, path: &Path) {
        if let Some(n) = self.write_release.get(path) {
            n.notify_waiters();
        }
    }

    pub fn notify_read_locks_released(&self, path: &Path) {
        if let Some(n) = self.read_release.get(path) {
            n.notify_waiters();
        }
    }
}

pub struct WaitManager {
    directory: Arc<WaitDirectory>,
    storage: Arc<dyn Storage>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl WaitManager {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        Self {
            directory: Arc::new(WaitDirectory::default()),
            storage,
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
        }
    }

    pub fn directory(&self) -> Arc<WaitDirectory> {
        self.directory.clone()
    }

    /// Blocks until `path` has no write-lock holder other than `allow_self`
    /// (or doesn't exist at all), returning the entry as last observed. A
    /// holder whose session has died is stripped via
    /// `cleanup_locks_on_session_termination` rather than waited on forever.
    pub async fn wait_for_write_lock_release(
        &self,
        path: &Path,
        allow_self: Option<&SessionId>,
        liveness: &dyn SessionLiveness,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut backoff = self.backoff_initial;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = self.storage.get_entry(path).await?;
            let free = match &entry {
                None => true,
                Some(e) => e.write_lock.is_none() || e.write_lock.as_ref() == allow_self,
            };
            if free {
                return Ok(entry);
            }
            let holder = entry
                .as_ref()
                .and_then(|e| e.write_lock.clone())
                .expect("write_lock is Some when free is false");

            if Some(&holder) != allow_self && !liveness.is_session_alive(&holder).await? {
                if let Some(local) = allow_self {
                    self.cleanup_locks_on_session_termination(path, &holder, local)
                        .await?;
                }
                continue;
            }

            let notify = WaitDirectory::handle(&self.directory.write_release, path);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(jittered(backoff)) => {
                    backoff = (backoff * 2).min(self.backoff_max);
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Blocks until `path`'s read-locks are empty or held only by
    /// `allow_self`, sending a best-effort release request to every foreign
    /// holder on each poll iteration.
    pub async fn wait_for_read_locks_release(
        &self,
        path: &Path,
        allow_self: Option<&SessionId>,
        notifier: &dyn PeerNotifier,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut backoff = self.backoff_initial;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = self.storage.get_entry(path).await?;
            let foreign: Vec<SessionId> = match &entry {
                None => Vec::new(),
                Some(e) => e
                    .read_locks
                    .iter()
                    .filter(|holder| Some(*holder) != allow_self)
                    .cloned()
                    .collect(),
            };
            if foreign.is_empty() {
                return Ok(entry);
            }

            for holder in &foreign {
                notifier.request_read_lock_release(holder, path).await;
            }

            let notify = WaitDirectory::handle(&self.directory.read_release, path);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(jittered(backoff)) => {
                    backoff = (backoff * 2).min(self.backoff_max);
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Strips a dead `holder` from `path`'s write-lock and read-locks.
    /// Invoked when a lock-release wait discovers the current holder's
    /// session has already terminated. Refuses to act when `holder` is the
    /// caller's own `local_session` — that would mean the caller itself has
    /// been terminated mid-wait, which is a bug further up the stack, not
    /// something to silently clean up.
    async fn cleanup_locks_on_session_termination(
        &self,
        path: &Path,
        holder: &SessionId,
        local_session: &SessionId,
    ) -> Result<Option<StoredEntry>> {
        if holder == local_session {
            return Err(Error::SessionTerminated);
        }
        let mut current = self.storage.get_entry(path).await?;
        loop {
            let entry = match &current {
                Some(e) => e,
                None => return Ok(None),
            };
            let held_write = entry.write_lock.as_ref() == Some(holder);
            let held_read = entry.read_locks.contains(holder);
            if !held_write && !held_read {
                return Ok(current);
            }
            let mut next = entry.clone();
            if held_write {
                next.write_lock = None;
            }
            next.read_locks.remove(holder);
            next.storage_version += 1;
            match self
                .storage
                .update_entry(Some(next.clone()), current.clone())
                .await?
            {
                CasOutcome::Success(_) => {
                    if held_write {
                        self.directory.notify_write_lock_released(path);
                    }
                    if held_read {
                        self.directory.notify_read_locks_released(path);
                    }
                    return Ok(Some(next));
                }
                CasOutcome::Conflict(latest) => current = latest,
            }
        }
    }
}

/// Adds up to 20% random jitter to a backoff duration, so many participants
/// woken by the same missed notification don't all re-poll storage in
/// lockstep.
fn jittered(backoff: Duration) -> Duration {
    let extra_ms = rand::random::<u64>() % (backoff.as_millis() as u64 / 5 + 1);
    backoff + Duration::from_millis(extra_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStorage;
    use std::time::SystemTime;

    fn cfg() -> EngineConfig {
        let mut c = EngineConfig::default();
        c.backoff_initial = Duration::from_millis(5);
        c.backoff_max = Duration::from_millis(20);
        c
    }

    struct AlwaysAlive;
    #[async_trait]
    impl SessionLiveness for AlwaysAlive {
        async fn is_session_alive(&self, _session: &SessionId) -> Result<bool> {
            Ok(true)
        }
    }

    struct NeverAlive;
    #[async_trait]
    impl SessionLiveness for NeverAlive {
        async fn is_session_alive(&self, _session: &SessionId) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_free() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let wm = WaitManager::new(storage, &cfg());
        let path = Path::root().child("a");
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            wm.wait_for_write_lock_release(&path, None, &AlwaysAlive, &CancellationToken::new()),
        )
        .await
        .expect("should not block");
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn notification_wakes_waiter_before_backoff_elapses() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let session = SessionId::generate(1, vec![1]);
        let path = Path::root().child("a");
        let now = SystemTime::now();
        let entry = StoredEntry::new(path.clone(), now).acquire_write_lock(&session, now);
        storage.update_entry(Some(entry), None).await.unwrap();

        let mut c = cfg();
        c.backoff_initial = Duration::from_secs(5);
        c.backoff_max = Duration::from_secs(5);
        let wm = Arc::new(WaitManager::new(storage.clone(), &c));

        let waiter = {
            let wm = wm.clone();
            let path = path.clone();
            tokio::spawn(async move {
                wm.wait_for_write_lock_release(&path, None, &AlwaysAlive, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        storage
            .update_entry(None, storage.get_entry(&path).await.unwrap())
            .await
            .unwrap();
        wm.directory().notify_write_lock_released(&path);

        let result = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("notification should wake waiter well before the 5s backoff")
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_holder_is_cleaned_up_instead_of_waited_on() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let holder = SessionId::generate(1, vec![1]);
        let local = SessionId::generate(2, vec![2]);
        let path = Path::root().child("a");
        let now = SystemTime::now();
        let entry = StoredEntry::new(path.clone(), now).acquire_write_lock(&holder, now);
        storage.update_entry(Some(entry), None).await.unwrap();

        let wm = WaitManager::new(storage, &cfg());
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            wm.wait_for_write_lock_release(&path, Some(&local), &NeverAlive, &CancellationToken::new()),
        )
        .await
        .expect("dead holder must be cleaned up, not waited on forever")
        .unwrap();
        assert_eq!(result.unwrap().write_lock, None);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_wait() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let holder = SessionId::generate(1, vec![1]);
        let path = Path::root().child("a");
        let now = SystemTime::now();
        let entry = StoredEntry::new(path.clone(), now).acquire_write_lock(&holder, now);
        storage.update_entry(Some(entry), None).await.unwrap();

        let mut c = cfg();
        c.backoff_initial = Duration::from_secs(5);
        c.backoff_max = Duration::from_secs(5);
        let wm = WaitManager::new(storage, &c);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            wm.wait_for_write_lock_release(&path, None, &AlwaysAlive, &cancel),
        )
        .await
        .expect("cancellation should wake the waiter");
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn read_lock_wait_sends_release_request_to_every_foreign_holder() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingNotifier(AtomicUsize);
        #[async_trait]
        impl PeerNotifier for CountingNotifier {
            async fn request_read_lock_release(&self, _target: &SessionId, _path: &Path) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let holder = SessionId::generate(1, vec![1]);
        let path = Path::root().child("a");
        let now = SystemTime::now();
        let entry = StoredEntry::new(path.clone(), now).acquire_read_lock(&holder, now);
        storage.update_entry(Some(entry), None).await.unwrap();

        let wm = WaitManager::new(storage.clone(), &cfg());
        let notifier = CountingNotifier(AtomicUsize::new(0));

        let waiter = tokio::time::timeout(
            Duration::from_millis(50),
            wm.wait_for_read_locks_release(&path, None, &notifier, &CancellationToken::new()),
        )
        .await;
        assert!(waiter.is_err(), "should still be waiting, holder never released");
        assert!(notifier.0.load(Ordering::SeqCst) >= 1);

        storage
            .update_entry(None, storage.get_entry(&path).await.unwrap())
            .await
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            wm.wait_for_read_locks_release(&path, None, &notifier, &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(result.is_none());
    }
}
