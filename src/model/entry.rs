// The stored-entry value type and its pure transformations.
//
// Every transform returns a new `StoredEntry` (structural sharing of
// `read_locks`/`children` via `im`-free `Vec`/`HashSet` clone — acceptable
// here since entries are small; a production build could swap in `im`
// without changing this module's API). `remove` returns `None` to mean
// "this entry no longer exists" (a tombstone at the CAS layer).
//
// Precondition violations are programmer errors (mis-sequenced calls from
// the lock manager), never attributable to a remote peer or user input, so
// they panic after logging rather than returning a `Result`.

use std::collections::HashSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub path: Path,
    pub value: Vec<u8>,
    pub read_locks: HashSet<SessionId>,
    pub write_lock: Option<SessionId>,
    pub children: Vec<String>,
    pub version: u64,
    pub storage_version: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub creation_time: SystemTime,
    pub last_write_time: SystemTime,
}

fn invariant(cond: bool, msg: impl FnOnce() -> String) {
    if !cond {
        let msg = msg();
        tracing::error!(%msg, "stored-entry precondition violated");
        panic!("stored-entry precondition violated: {msg}");
    }
}

impl StoredEntry {
    pub fn new(path: Path, now: SystemTime) -> Self {
        Self {
            path,
            value: Vec::new(),
            read_locks: HashSet::new(),
            write_lock: None,
            children: Vec::new(),
            version: 0,
            storage_version: 0,
            ephemeral_owner: None,
            creation_time: now,
            last_write_time: now,
        }
    }

    /// True if `session` is the sole permitted holder of the write-lock,
    /// i.e. this session may still acquire/extend a write-lock.
    fn write_lock_free_for(&self, session: &SessionId) -> bool {
        matches!(&self.write_lock, None) || self.write_lock.as_ref() == Some(session)
    }

    /// Exclusively held by `session`: write-locked by it, and no other
    /// session holds a read-lock.
    fn exclusively_held_by(&self, session: &SessionId) -> bool {
        self.write_lock.as_ref() == Some(session)
            && self.read_locks.iter().all(|s| s == session)
    }

    fn bump(mut self, now: SystemTime) -> Self {
        self.storage_version += 1;
        let _ = now;
        self
    }

    pub fn acquire_write_lock(&self, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.write_lock_free_for(session), || {
            format!(
                "acquire_write_lock({session}) on {} held by {:?}",
                self.path, self.write_lock
            )
        });
        if self.write_lock.as_ref() == Some(session) {
            return self.clone();
        }
        let mut next = self.clone();
        next.write_lock = Some(session.clone());
        next.bump(now)
    }

    pub fn release_write_lock(&self, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.write_lock.as_ref() == Some(session), || {
            format!(
                "release_write_lock({session}) on {} held by {:?}",
                self.path, self.write_lock
            )
        });
        let mut next = self.clone();
        next.write_lock = None;
        next.read_locks.clear();
        next.bump(now)
    }

    pub fn acquire_read_lock(&self, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.write_lock_free_for(session), || {
            format!(
                "acquire_read_lock({session}) on {} held by {:?}",
                self.path, self.write_lock
            )
        });
        if self.read_locks.contains(session) {
            return self.clone();
        }
        let mut next = self.clone();
        next.read_locks.insert(session.clone());
        next.bump(now)
    }

    pub fn release_read_lock(&self, session: &SessionId, now: SystemTime) -> StoredEntry {
        if !self.read_locks.contains(session) {
            return self.clone();
        }
        let mut next = self.clone();
        next.read_locks.remove(session);
        next.bump(now)
    }

    pub fn set_value(&self, value: Vec<u8>, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.exclusively_held_by(session), || {
            format!(
                "set_value({session}) on {} not exclusively held (write_lock={:?}, read_locks={:?})",
                self.path, self.write_lock, self.read_locks
            )
        });
        let mut next = self.clone();
        next.value = value;
        next.version += 1;
        next.last_write_time = now.max(next.creation_time);
        next.bump(now)
    }

    pub fn add_child(&self, segment: &str, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.exclusively_held_by(session), || {
            format!("add_child({session}) on {} not exclusively held", self.path)
        });
        if self.children.iter().any(|c| c == segment) {
            return self.clone();
        }
        let mut next = self.clone();
        next.children.push(segment.to_string());
        next.bump(now)
    }

    pub fn remove_child(&self, segment: &str, session: &SessionId, now: SystemTime) -> StoredEntry {
        invariant(self.exclusively_held_by(session), || {
            format!(
                "remove_child({session}) on {} not exclusively held",
                self.path
            )
        });
        if !self.children.iter().any(|c| c == segment) {
            return self.clone();
        }
        let mut next = self.clone();
        next.children.retain(|c| c != segment);
        next.bump(now)
    }

    /// Tombstones the entry. Returns `None` (no replacement entry) on
    /// success.
    pub fn remove(&self, session: &SessionId) -> Option<StoredEntry> {
        invariant(self.exclusively_held_by(session), || {
            format!("remove({session}) on {} not exclusively held", self.path)
        });
        invariant(self.children.is_empty(), || {
            format!("remove({session}) on {} with non-empty children", self.path)
        });
        None
    }
}
