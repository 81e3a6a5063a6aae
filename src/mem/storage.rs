// An in-memory `Storage` reference implementation, used by the demo binary
// and the integration test suite. Mirrors the CAS semantics a real
// transactional KV store would provide; production deployments replace this
// with one backed by their own store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StorageError;
use crate::ids::SessionId;
use crate::model::{StoredEntry, StoredSession};
use crate::path::Path;
use crate::storage::{CasOutcome, Storage};

#[derive(Default)]
pub struct MemStorage {
    entries: DashMap<Path, StoredEntry>,
    sessions: DashMap<SessionId, StoredSession>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage_version_of<T>(value: &Option<T>) -> Option<u64>
    where
        T: VersionedValue,
    {
        value.as_ref().map(VersionedValue::storage_version)
    }
}

trait VersionedValue {
    fn storage_version(&self) -> u64;
}

impl VersionedValue for StoredEntry {
    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}

impl VersionedValue for StoredSession {
    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get_entry(&self, path: &Path) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self.entries.get(path).map(|e| e.clone()))
    }

    async fn update_entry(
        &self,
        new: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<CasOutcome<StoredEntry>, StorageError> {
        let path = new
            .as_ref()
            .map(|e| e.path.clone())
            .or_else(|| expected.as_ref().map(|e| e.path.clone()))
            .ok_or_else(|| {
                StorageError::Corrupt("update_entry called with no path in either argument".into())
            })?;

        let expected_version = Self::storage_version_of(&expected);

        match self.entries.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if Some(occ.get().storage_version) != expected_version {
                    return Ok(CasOutcome::Conflict(Some(occ.get().clone())));
                }
                match new {
                    Some(new_entry) => {
                        occ.insert(new_entry);
                    }
                    None => {
                        occ.remove();
                    }
                }
                Ok(CasOutcome::Success(expected))
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected_version.is_some() {
                    return Ok(CasOutcome::Conflict(None));
                }
                if let Some(new_entry) = new {
                    vac.insert(new_entry);
                }
                Ok(CasOutcome::Success(expected))
            }
        }
    }

    async fn get_session(
        &self,
        session: &SessionId,
    ) -> Result<Option<StoredSession>, StorageError> {
        Ok(self.sessions.get(session).map(|s| s.clone()))
    }

    async fn update_session(
        &self,
        new: Option<StoredSession>,
        expected: Option<StoredSession>,
    ) -> Result<CasOutcome<StoredSession>, StorageError> {
        let session = new
            .as_ref()
            .map(|s| s.session.clone())
            .or_else(|| expected.as_ref().map(|s| s.session.clone()))
            .ok_or_else(|| {
                StorageError::Corrupt(
                    "update_session called with no session in either argument".into(),
                )
            })?;

        let expected_version = Self::storage_version_of(&expected);

        match self.sessions.entry(session) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if Some(occ.get().storage_version) != expected_version {
                    return Ok(CasOutcome::Conflict(Some(occ.get().clone())));
                }
                match new {
                    Some(new_session) => {
                        occ.insert(new_session);
                    }
                    None => {
                        occ.remove();
                    }
                }
                Ok(CasOutcome::Success(expected))
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected_version.is_some() {
                    return Ok(CasOutcome::Conflict(None));
                }
                if let Some(new_session) = new {
                    vac.insert(new_session);
                }
                Ok(CasOutcome::Success(expected))
            }
        }
    }

    async fn scan_sessions(
        &self,
        after: Option<&SessionId>,
    ) -> Result<Vec<StoredSession>, StorageError> {
        let mut all: Vec<StoredSession> = self.sessions.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by(|a, b| a.session.cmp(&b.session));
        let start = match after {
            None => 0,
            Some(marker) => all
                .iter()
                .position(|s| &s.session == marker)
                .map(|idx| idx + 1)
                .unwrap_or(all.len()),
        };
        Ok(all.split_off(start.min(all.len())))
    }
}
