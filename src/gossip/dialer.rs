//! Opening gossip streams to peers.
//!
//! The scheduler only needs a bidirectional stream of [`SyncMessage`]s to a
//! peer address. [`MemoryDialer`] connects replicas living in the same
//! process (tests, simulations); the TCP dialer lives with the server.

use super::message::SyncMessage;
use super::ReplicaService;
use crate::error::ReplicaError;
use crate::peer::Peer;
use crate::transport::{duplex, Duplex, TransportFuture};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

/// Buffer of each in-memory stream direction, in messages.
pub const MEMORY_STREAM_CAPACITY: usize = 256;

/// Opens a gossip stream to a peer.
pub trait Dialer: Send + Sync + 'static {
    fn dial<'a>(&'a self, peer: &'a Peer) -> TransportFuture<'a, Duplex<SyncMessage, SyncMessage>>;
}

/// Dials replicas registered in the same process by address.
///
/// Holds weak references so replicas dialing each other do not keep each
/// other alive.
#[derive(Default)]
pub struct MemoryDialer {
    replicas: RwLock<HashMap<String, Weak<ReplicaService>>>,
}

impl MemoryDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `replica` reachable at `addr`.
    pub fn register(&self, addr: impl Into<String>, replica: &Arc<ReplicaService>) {
        let mut replicas = self.replicas.write().unwrap_or_else(|e| e.into_inner());
        replicas.insert(addr.into(), Arc::downgrade(replica));
    }

    pub fn unregister(&self, addr: &str) {
        let mut replicas = self.replicas.write().unwrap_or_else(|e| e.into_inner());
        replicas.remove(addr);
    }

    fn lookup(&self, addr: &str) -> Option<Arc<ReplicaService>> {
        let replicas = self.replicas.read().unwrap_or_else(|e| e.into_inner());
        replicas.get(addr).and_then(Weak::upgrade)
    }
}

impl Dialer for MemoryDialer {
    fn dial<'a>(&'a self, peer: &'a Peer) -> TransportFuture<'a, Duplex<SyncMessage, SyncMessage>> {
        Box::pin(async move {
            let remote = self
                .lookup(&peer.addr)
                .ok_or_else(|| ReplicaError::transport(&peer.addr, "connection refused"))?;

            let (local, other) = duplex::<SyncMessage, SyncMessage>(MEMORY_STREAM_CAPACITY);
            let addr = peer.addr.clone();
            tokio::spawn(async move {
                if let Err(e) = remote.gossip(other).await {
                    debug!(addr = %addr, error = %e, "In-memory gossip session ended with error");
                }
            });
            Ok(local)
        })
    }
}
