// An in-memory `Transport` reference implementation built on a shared
// registry of mpsc channels — one per bound session id. Used by the demo
// binary and the integration test suite to exercise the exchange protocol
// without real sockets.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};

use crate::ids::SessionId;
use crate::transport::Transport;

type Inbox = mpsc::UnboundedSender<Vec<u8>>;

/// Shared switchboard every `MemTransport` in a test/demo cluster registers
/// with.
#[derive(Default, Clone)]
pub struct MemNetwork {
    routes: Arc<DashMap<SessionId, Inbox>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport endpoint attached to this network, identified by
    /// `address` until a session id is bound over it.
    pub fn transport(&self, address: Vec<u8>) -> MemTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        MemTransport {
            network: self.routes.clone(),
            address,
            inbox_tx: tx,
            inbox_rx: Mutex::new(rx),
            bound_session: SyncMutex::new(None),
        }
    }
}

pub struct MemTransport {
    network: Arc<DashMap<SessionId, Inbox>>,
    address: Vec<u8>,
    inbox_tx: Inbox,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    bound_session: SyncMutex<Option<SessionId>>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, to: &SessionId, frame: Vec<u8>) {
        if let Some(route) = self.network.get(to) {
            // Swallow the error: a closed receiver means the peer is gone,
            // which the session's lease expiry will eventually reflect.
            let _ = route.send(frame);
        } else {
            tracing::debug!(%to, "send: no route for session, dropping frame");
        }
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        // `recv` on the underlying channel requires `&mut`; a single
        // participant has exactly one receive-loop task, so this lock is
        // never contended.
        let mut rx = self.inbox_rx.lock().await;
        rx.recv().await
    }

    fn local_address(&self) -> Vec<u8> {
        self.address.clone()
    }

    fn bind_session(&self, session: &SessionId) {
        *self.bound_session.lock() = Some(session.clone());
        self.network.insert(session.clone(), self.inbox_tx.clone());
    }
}
