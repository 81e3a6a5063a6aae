// Point-to-point message transport contract: addressable send/receive of
// opaque frames, no delivery or cross-peer ordering guarantee.

use async_trait::async_trait;

use crate::ids::SessionId;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort send. Transport errors (closed socket, I/O failure) are
    /// swallowed by implementations — the caller never learns of them; a
    /// truly dead peer is caught by lease expiry instead.
    async fn send(&self, to: &SessionId, frame: Vec<u8>);

    /// Blocks until a frame addressed to this participant arrives, or
    /// returns `None` if the transport has been shut down.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Opaque bytes identifying this participant's own address, folded into
    /// its `SessionId` at session-begin time.
    fn local_address(&self) -> Vec<u8>;

    /// Tells the transport which session id it is now addressable as, once
    /// the session manager has minted one from `local_address()`. Transports
    /// that can resolve a peer's address without an explicit routing table
    /// (e.g. a real socket keyed by IP:port) may leave this a no-op.
    fn bind_session(&self, _session: &SessionId) {}
}
