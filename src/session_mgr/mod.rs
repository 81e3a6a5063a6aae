// Session manager: lease-backed session lifecycle — begin, renew, end,
// entry-path bookkeeping, and expired-session discovery for the cleaner
// task. A CAS'd record per session, with a background renewer keeping its
// own lease alive and a background reaper sweeping expired ones cluster-wide.

pub mod tasks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::model::StoredSession;
use crate::path::Path;
use crate::storage::{CasOutcome, Storage};
use crate::wait::SessionLiveness;

/// Invoked by the cleaner task once per expiring session, before its
/// `StoredSession` record is removed — responsible for releasing any locks
/// the session held and deleting any ephemeral entries it owned. Implemented
/// by the engine façade, which is the only component holding both the lock
/// manager and the entry cache.
#[async_trait]
pub trait SessionCleanupHandler: Send + Sync {
    async fn clean_up_session(&self, session: &SessionId, entry_paths: &HashSet<Path>) -> Result<()>;
}

pub struct SessionManager {
    storage: Arc<dyn Storage>,
    lease_length: Duration,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        Self {
            storage,
            lease_length: config.lease_length,
        }
    }

    /// Mints a fresh session and persists its initial lease.
    pub async fn begin(&self, now_millis: u64, local_address: Vec<u8>) -> Result<SessionId> {
        let session = SessionId::generate(now_millis, local_address);
        let record = StoredSession::new(session.clone(), SystemTime::now() + self.lease_length);
        match self.storage.update_session(Some(record), None).await? {
            CasOutcome::Success(_) => Ok(session),
            CasOutcome::Conflict(_) => Err(Error::Internal(format!(
                "freshly generated session id collided: {session}"
            ))),
        }
    }

    pub async fn renew(&self, session: &SessionId) -> Result<()> {
        loop {
            let current = self
                .storage
                .get_session(session)
                .await?
                .ok_or(Error::SessionTerminated)?;
            if !current.is_alive(SystemTime::now()) {
                return Err(Error::SessionTerminated);
            }
            let next = current.with_renewed_lease(SystemTime::now() + self.lease_length);
            match self
                .storage
                .update_session(Some(next), Some(current))
                .await?
            {
                CasOutcome::Success(_) => return Ok(()),
                CasOutcome::Conflict(Some(_)) => continue,
                CasOutcome::Conflict(None) => return Err(Error::SessionTerminated),
            }
        }
    }

    /// Ends `session`. If it still owns ephemeral paths, the record is
    /// tombstoned (the cleaner needs it alive long enough to reclaim those
    /// paths); otherwise it's removed outright — there's nothing left for
    /// the cleaner to do with it.
    pub async fn end(&self, session: &SessionId) -> Result<()> {
        loop {
            let current = match self.storage.get_session(session).await? {
                Some(c) if !c.is_ended => c,
                _ => return Ok(()),
            };
            let next = if current.entry_paths.is_empty() {
                None
            } else {
                Some(current.tombstoned())
            };
            match self
                .storage
                .update_session(next, Some(current))
                .await?
            {
                CasOutcome::Success(_) => return Ok(()),
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    pub async fn is_alive(&self, session: &SessionId) -> Result<bool> {
        Ok(self
            .storage
            .get_session(session)
            .await?
            .is_some_and(|s| s.is_alive(SystemTime::now())))
    }

    pub async fn add_entry(&self, session: &SessionId, path: Path) -> Result<()> {
        loop {
            let current = self
                .storage
                .get_session(session)
                .await?
                .ok_or(Error::SessionTerminated)?;
            let next = current.with_entry_added(path.clone());
            match self
                .storage
                .update_session(Some(next), Some(current))
                .await?
            {
                CasOutcome::Success(_) => return Ok(()),
                CasOutcome::Conflict(Some(_)) => continue,
                CasOutcome::Conflict(None) => return Err(Error::SessionTerminated),
            }
        }
    }

    /// Removes `path` from `session`'s owned-entry bookkeeping. If the
    /// session has already ended and this was its last owned ephemeral
    /// path, the record is physically deleted — it was only kept around as
    /// a tombstone for the cleaner to find this path through.
    pub async fn remove_entry(&self, session: &SessionId, path: &Path) -> Result<()> {
        loop {
            let current = match self.storage.get_session(session).await? {
                Some(c) => c,
                None => return Ok(()),
            };
            let next = current.with_entry_removed(path);
            let replacement = if current.is_ended && next.entry_paths.is_empty() {
                None
            } else {
                Some(next)
            };
            match self
                .storage
                .update_session(replacement, Some(current))
                .await?
            {
                CasOutcome::Success(_) => return Ok(()),
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    pub async fn get_entries(&self, session: &SessionId) -> Result<HashSet<Path>> {
        Ok(self
            .storage
            .get_session(session)
            .await?
            .map(|s| s.entry_paths)
            .unwrap_or_default())
    }

    /// All currently live sessions, across the whole cluster's storage —
    /// used both as the broadcast target list and by the cleaner to find
    /// newly expired sessions.
    pub async fn get_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut all = Vec::new();
        let mut after = None;
        loop {
            let page = self.storage.scan_sessions(after.as_ref()).await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|s| s.session.clone());
            all.extend(page);
        }
        Ok(all)
    }

    pub async fn live_session_ids(&self) -> Result<Vec<SessionId>> {
        let now = SystemTime::now();
        Ok(self
            .get_sessions()
            .await?
            .into_iter()
            .filter(|s| s.is_alive(now))
            .map(|s| s.session)
            .collect())
    }

    pub(crate) async fn expired_sessions(&self) -> Result<Vec<StoredSession>> {
        let now = SystemTime::now();
        Ok(self
            .get_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.is_alive(now))
            .collect())
    }

    pub(crate) async fn remove_session_record(&self, session: StoredSession) -> Result<()> {
        match self
            .storage
            .update_session(None, Some(session))
            .await?
        {
            CasOutcome::Success(_) | CasOutcome::Conflict(None) => Ok(()),
            CasOutcome::Conflict(Some(_)) => Ok(()), // someone else already mutated/removed it
        }
    }

    pub fn lease_length(&self) -> Duration {
        self.lease_length
    }
}

#[async_trait]
impl SessionLiveness for SessionManager {
    async fn is_session_alive(&self, session: &SessionId) -> Result<bool> {
        self.is_alive(session).await
    }
}
