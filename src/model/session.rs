// The stored-session value type.
//
// Liveness (`is_alive`) is always derived from `is_ended`/`lease_end` against
// a caller-supplied `now` — never cached across an `await` point, per the
// concurrency model's warning about suspension points.

use std::collections::HashSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session: SessionId,
    pub is_ended: bool,
    pub lease_end: SystemTime,
    pub entry_paths: HashSet<Path>,
    pub storage_version: u64,
}

impl StoredSession {
    pub fn new(session: SessionId, lease_end: SystemTime) -> Self {
        Self {
            session,
            is_ended: false,
            lease_end,
            entry_paths: HashSet::new(),
            storage_version: 0,
        }
    }

    pub fn is_alive(&self, now: SystemTime) -> bool {
        !self.is_ended && self.lease_end > now
    }

    /// Extends the lease monotonically — never shortens it.
    pub fn with_renewed_lease(&self, lease_end: SystemTime) -> StoredSession {
        let mut next = self.clone();
        next.lease_end = next.lease_end.max(lease_end);
        next.storage_version += 1;
        next
    }

    pub fn tombstoned(&self) -> StoredSession {
        let mut next = self.clone();
        next.is_ended = true;
        next.storage_version += 1;
        next
    }

    pub fn with_entry_added(&self, path: Path) -> StoredSession {
        if self.entry_paths.contains(&path) {
            return self.clone();
        }
        let mut next = self.clone();
        next.entry_paths.insert(path);
        next.storage_version += 1;
        next
    }

    pub fn with_entry_removed(&self, path: &Path) -> StoredSession {
        if !self.entry_paths.contains(path) {
            return self.clone();
        }
        let mut next = self.clone();
        next.entry_paths.remove(path);
        next.storage_version += 1;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sid() -> SessionId {
        SessionId::generate(1, vec![1])
    }

    #[test]
    fn liveness_depends_on_ended_and_lease() {
        let now = SystemTime::now();
        let s = StoredSession::new(sid(), now + Duration::from_secs(30));
        assert!(s.is_alive(now));
        let expired = StoredSession::new(sid(), now - Duration::from_secs(1));
        assert!(!expired.is_alive(now));
        let ended = s.tombstoned();
        assert!(!ended.is_alive(now));
    }

    #[test]
    fn renewal_never_shortens_lease() {
        let now = SystemTime::now();
        let s = StoredSession::new(sid(), now + Duration::from_secs(30));
        let shortened = s.with_renewed_lease(now + Duration::from_secs(5));
        assert_eq!(shortened.lease_end, s.lease_end);
        let extended = s.with_renewed_lease(now + Duration::from_secs(60));
        assert!(extended.lease_end > s.lease_end);
    }
}
