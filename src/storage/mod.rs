// The coordination storage contract: a typed CAS wrapper over an abstract
// transactional key-value store. Only `get`/`compare_exchange`/`scan` are
// assumed of the backing store; replication and cluster membership are
// entirely the store's problem.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::ids::SessionId;
use crate::model::{StoredEntry, StoredSession};
use crate::path::Path;

/// Outcome of a `compare_exchange`-style update.
///
/// `Success` carries the caller's prior view (the value CAS'd against) —
/// callers that need the just-written value already have it (`new`).
#[derive(Debug, Clone)]
pub enum CasOutcome<T> {
    Success(Option<T>),
    Conflict(Option<T>),
}

impl<T> CasOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CasOutcome::Success(_))
    }

    pub fn into_current(self) -> Option<T> {
        match self {
            CasOutcome::Success(v) | CasOutcome::Conflict(v) => v,
        }
    }
}

/// Two CAS-keyed tables: entries by path, sessions by session id.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_entry(&self, path: &Path) -> Result<Option<StoredEntry>, StorageError>;

    /// Atomic CAS keyed on `expected.storage_version` (`None` means "no
    /// entry"). On success returns `Success(expected)`; on mismatch returns
    /// `Conflict(current)`.
    async fn update_entry(
        &self,
        new: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<CasOutcome<StoredEntry>, StorageError>;

    async fn get_session(&self, session: &SessionId) -> Result<Option<StoredSession>, StorageError>;

    async fn update_session(
        &self,
        new: Option<StoredSession>,
        expected: Option<StoredSession>,
    ) -> Result<CasOutcome<StoredSession>, StorageError>;

    /// Returns a page of sessions strictly after `after` (by the store's own
    /// iteration order), empty when exhausted. Restartable: a caller that
    /// stops and resumes later with the last-seen id picks back up correctly
    /// even if sessions were added/removed meanwhile.
    async fn scan_sessions(
        &self,
        after: Option<&SessionId>,
    ) -> Result<Vec<StoredSession>, StorageError>;
}
