// Exchange manager: the three-message peer protocol participants use to tell
// each other about lock releases and cache invalidation, plus the
// background task that drains a `Transport`'s inbox and dispatches decoded
// messages against the local entry cache / wait directory / lock manager.
//
// Wire format: a `bincode`-serialized payload with a trailing `crc32fast`
// checksum.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::entry_cache::EntryCache;
use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::lock::ReadLockReleaser;
use crate::path::Path;
use crate::transport::Transport;
use crate::wait::{PeerNotifier, WaitDirectory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    InvalidateCacheEntry(Path),
    ReleasedReadLock(Path),
    ReleasedWriteLock(Path),
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("Message encoding cannot fail: no unsized or non-serializable fields");

        let mut hasher = Hasher::new();
        hasher.update(&payload);

        let mut buf = BytesMut::with_capacity(payload.len() + 4);
        buf.put_slice(&payload);
        buf.put_u32_le(hasher.finalize());
        buf.to_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 4 {
            return Err(Error::Internal("exchange frame too short".into()));
        }
        let (payload, checksum_bytes) = frame.split_at(frame.len() - 4);
        let expected = u32::from_le_bytes(checksum_bytes.try_into().unwrap());

        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != expected {
            return Err(Error::Internal("exchange frame checksum mismatch".into()));
        }

        let (message, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| Error::Internal(format!("exchange frame decode failed: {e}")))?;
        Ok(message)
    }
}

pub struct ExchangeManager {
    transport: Arc<dyn Transport>,
    cache: Arc<EntryCache>,
    wait_directory: Arc<WaitDirectory>,
    lock_releaser: Arc<dyn ReadLockReleaser>,
    local_session: SessionId,
}

impl ExchangeManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<EntryCache>,
        wait_directory: Arc<WaitDirectory>,
        lock_releaser: Arc<dyn ReadLockReleaser>,
        local_session: SessionId,
    ) -> Self {
        Self {
            transport,
            cache,
            wait_directory,
            lock_releaser,
            local_session,
        }
    }

    pub async fn send_to(&self, target: &SessionId, message: Message) {
        self.transport.send(target, message.encode()).await;
    }

    pub async fn broadcast(&self, message: Message, targets: &[SessionId]) {
        for target in targets {
            self.send_to(target, message.clone()).await;
        }
    }

    /// Dispatches a decoded peer message. `InvalidateCacheEntry` both drops
    /// the cached slot and releases this participant's own read-lock on the
    /// path (if it holds one) — the request arriving means some other
    /// participant is waiting on a write-lock acquire and needs this
    /// participant's read-lock gone. Release notifications are handled by
    /// waking the wait directory directly; these are hints, and correctness
    /// never depends on their delivery (the wait manager's backoff poll
    /// recovers from a dropped one).
    async fn dispatch(&self, message: Message) {
        match message {
            Message::InvalidateCacheEntry(path) => {
                self.cache.invalidate(&path);
                if let Err(err) = self
                    .lock_releaser
                    .release_local_read_lock(&path, &self.local_session)
                    .await
                {
                    tracing::warn!(%path, %err, "failed to release local read-lock on invalidation request");
                }
            }
            Message::ReleasedReadLock(path) => self.wait_directory.notify_read_locks_released(&path),
            Message::ReleasedWriteLock(path) => self.wait_directory.notify_write_lock_released(&path),
        }
    }

    /// Runs until the transport's inbox is closed. Spawn as a background
    /// task per participant.
    pub async fn run_receive_loop(self: Arc<Self>) {
        while let Some(frame) = self.transport.recv().await {
            match Message::decode(&frame) {
                Ok(message) => self.dispatch(message).await,
                Err(err) => tracing::warn!(%err, "dropping malformed exchange frame"),
            }
        }
        tracing::debug!("exchange receive loop exiting: transport closed");
    }
}

#[async_trait]
impl PeerNotifier for ExchangeManager {
    /// Best-effort request that `target` release its read-lock on `path`,
    /// implemented by sending the same `InvalidateCacheEntry` message a
    /// write would broadcast anyway — any participant receiving it both
    /// drops its cached copy and, if it holds a read-lock, releases it.
    async fn request_read_lock_release(&self, target: &SessionId, path: &Path) {
        self.send_to(target, Message::InvalidateCacheEntry(path.clone())).await;
    }
}
