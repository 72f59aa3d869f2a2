//! Peer registry.
//!
//! Peers are ordinary objects in the reserved `peers` namespace, keyed by
//! the hex-encoded process id and stored as JSON. Because that namespace is
//! replicated, membership itself spreads by gossip: adding a peer on one
//! replica is enough for every replica to eventually learn about it.
//!
//! # Selection
//!
//! [`PeerRegistry::select_peer`] draws uniformly from the stored keys and
//! retries up to [`SELECT_ATTEMPTS`] times when it lands on the local
//! replica (which is normally registered too). Failing to find a partner is
//! not an error; the scheduler just skips the round.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> trtl_replica::Result<()> {
//! use std::sync::Arc;
//! use trtl_replica::gossip::SyncClock;
//! use trtl_replica::object::Identity;
//! use trtl_replica::peer::{Peer, PeerRegistry};
//! use trtl_replica::probability::shared_rng;
//! use trtl_replica::store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new(Identity::new(8, "us-east-1", "trtl-8")));
//! let registry = PeerRegistry::new(store, shared_rng(None), SyncClock::new());
//!
//! registry.add_peers(Peer::new(9, "10.0.0.9:4436", "trtl-9", "eu-west-1")).await?;
//! let partner = registry.select_peer(8).await;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicaError, Result};
use crate::gossip::SyncClock;
use crate::probability::{with_rng, SharedRng};
use crate::store::{ObjectStore, ScanRange, Scanner};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace holding the peer records.
pub const NAMESPACE_PEERS: &str = "peers";

/// Draws before giving up on finding a peer other than self.
pub const SELECT_ATTEMPTS: usize = 10;

/// A replica in the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Process id; zero is not a valid id.
    pub id: u64,
    /// `host:port` of the replica's gossip endpoint.
    pub addr: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn new(id: u64, addr: impl Into<String>, name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            name: name.into(),
            region: region.into(),
            created: None,
            modified: None,
        }
    }

    /// Store key for this peer.
    pub fn key(&self) -> Vec<u8> {
        peer_key(self.id)
    }
}

fn peer_key(id: u64) -> Vec<u8> {
    format!("{:016x}", id).into_bytes()
}

/// Filter for [`PeerRegistry::get_peers`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersFilter {
    /// Only list peers in these regions (all regions if empty).
    pub regions: Vec<String>,
    /// Skip the peer list and only return the status.
    pub status_only: bool,
}

/// Summary of the known network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersStatus {
    pub network_size: u64,
    /// Number of peers per region.
    pub regions: HashMap<String, u64>,
    /// `"never"` or an RFC3339 timestamp.
    pub last_synchronization: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersList {
    pub peers: Vec<Peer>,
    pub status: PeersStatus,
}

/// Peer membership backed by the object store.
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn ObjectStore>,
    rng: SharedRng,
    clock: SyncClock,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, rng: SharedRng, clock: SyncClock) -> Self {
        Self { store, rng, clock }
    }

    /// List peers matching `filter` along with network statistics.
    pub async fn get_peers(&self, filter: &PeersFilter) -> Result<PeersList> {
        let mut list = PeersList::default();
        let mut scanner = Scanner::new(Arc::clone(&self.store), NAMESPACE_PEERS, ScanRange::all());

        while let Some(obj) = scanner.next().await? {
            let peer: Peer = match serde_json::from_slice(&obj.value) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(key = %obj.key_b64(), error = %e, "Could not decode peer record");
                    continue;
                }
            };

            list.status.network_size += 1;
            *list.status.regions.entry(peer.region.clone()).or_insert(0) += 1;

            if filter.status_only {
                continue;
            }
            if filter.regions.is_empty() || filter.regions.contains(&peer.region) {
                list.peers.push(peer);
            }
        }

        list.status.last_synchronization = self.clock.last_synchronization();
        Ok(list)
    }

    /// Insert or update a peer. The stored `created` time is preserved.
    pub async fn add_peers(&self, mut peer: Peer) -> Result<PeersStatus> {
        if peer.id == 0 {
            return Err(ReplicaError::InvalidArgument("a valid peer id is required".into()));
        }

        let key = peer.key();
        let now = Utc::now();
        match self.store.get(NAMESPACE_PEERS, &key).await {
            Ok(data) => {
                let existing: Peer = serde_json::from_slice(&data)?;
                peer.created = existing.created.or(Some(now));
            }
            Err(e) if e.is_not_found() => {
                peer.created = peer.created.or(Some(now));
            }
            Err(e) => {
                return Err(ReplicaError::FailedPrecondition(format!("could not check for existing peer: {}", e)));
            }
        }
        peer.modified = Some(now);

        let data = serde_json::to_vec(&peer)?;
        self.store.put(NAMESPACE_PEERS, &key, data).await?;
        debug!(peer_id = peer.id, name = %peer.name, "Peer added");

        self.status().await
    }

    /// Remove a peer (a tombstone replicates the removal).
    pub async fn rm_peers(&self, peer: &Peer) -> Result<PeersStatus> {
        if peer.id == 0 {
            return Err(ReplicaError::InvalidArgument("a valid peer id is required".into()));
        }

        if let Err(e) = self.store.delete(NAMESPACE_PEERS, &peer.key()).await {
            debug!(peer_id = peer.id, error = %e, "Could not remove peer");
            return Err(ReplicaError::InvalidArgument(format!("invalid peer {}; could not be removed", peer.id)));
        }
        debug!(peer_id = peer.id, "Peer removed");

        self.status().await
    }

    pub async fn status(&self) -> Result<PeersStatus> {
        let filter = PeersFilter {
            status_only: true,
            ..PeersFilter::default()
        };
        Ok(self.get_peers(&filter).await?.status)
    }

    /// Pick a random peer other than `self_pid`, or `None` if there is none.
    pub async fn select_peer(&self, self_pid: u64) -> Option<Peer> {
        // Collect only keys so large networks are not fully decoded.
        let mut keys = Vec::new();
        let mut scanner = Scanner::new(Arc::clone(&self.store), NAMESPACE_PEERS, ScanRange::all());
        loop {
            match scanner.next().await {
                Ok(Some(obj)) => keys.push(obj.key),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Could not read peer record");
                    continue;
                }
            }
        }

        if keys.is_empty() {
            warn!("No peers are registered");
            return None;
        }

        for _ in 0..SELECT_ATTEMPTS {
            let idx = with_rng(&self.rng, |rng| rng.gen_range(0..keys.len()));
            let key = &keys[idx];

            let data = match self.store.get(NAMESPACE_PEERS, key).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(key), error = %e, "Could not fetch peer");
                    continue;
                }
            };

            match serde_json::from_slice::<Peer>(&data) {
                Ok(peer) if peer.id != self_pid => return Some(peer),
                Ok(_) => continue,
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(key), error = %e, "Could not decode peer");
                }
            }
        }

        warn!(peers = keys.len(), attempts = SELECT_ATTEMPTS, "Could not select a remote peer");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Identity;
    use crate::probability::shared_rng;
    use crate::store::MemoryStore;

    fn registry() -> PeerRegistry {
        let store = Arc::new(MemoryStore::new(Identity::new(1, "us-east-1", "trtl-1")));
        PeerRegistry::new(store, shared_rng(Some(3)), SyncClock::new())
    }

    #[test]
    fn test_peer_key_is_hex() {
        assert_eq!(Peer::new(255, "a", "b", "c").key(), b"00000000000000ff".to_vec());
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let reg = registry();
        reg.add_peers(Peer::new(1, "a:1", "trtl-1", "us-east-1")).await.unwrap();
        reg.add_peers(Peer::new(2, "a:2", "trtl-2", "us-east-1")).await.unwrap();
        let status = reg.add_peers(Peer::new(3, "a:3", "trtl-3", "eu-west-1")).await.unwrap();

        assert_eq!(status.network_size, 3);
        assert_eq!(status.regions["us-east-1"], 2);
        assert_eq!(status.regions["eu-west-1"], 1);
        assert_eq!(status.last_synchronization, "never");

        let list = reg.get_peers(&PeersFilter::default()).await.unwrap();
        assert_eq!(list.peers.len(), 3);

        let eu = PeersFilter {
            regions: vec!["eu-west-1".into()],
            status_only: false,
        };
        let list = reg.get_peers(&eu).await.unwrap();
        assert_eq!(list.peers.len(), 1);
        assert_eq!(list.peers[0].name, "trtl-3");
        assert_eq!(list.status.network_size, 3);

        let status_only = PeersFilter {
            status_only: true,
            ..PeersFilter::default()
        };
        assert!(reg.get_peers(&status_only).await.unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_add_is_upsert_and_keeps_created() {
        let reg = registry();
        reg.add_peers(Peer::new(5, "a:5", "trtl-5", "us-east-1")).await.unwrap();
        let first = reg.get_peers(&PeersFilter::default()).await.unwrap().peers.remove(0);

        let status = reg.add_peers(Peer::new(5, "b:5", "trtl-5", "us-east-1")).await.unwrap();
        assert_eq!(status.network_size, 1);

        let second = reg.get_peers(&PeersFilter::default()).await.unwrap().peers.remove(0);
        assert_eq!(second.addr, "b:5");
        assert_eq!(second.created, first.created);
        assert!(second.modified >= first.modified);
    }

    #[tokio::test]
    async fn test_zero_id_rejected() {
        let reg = registry();
        let err = reg.add_peers(Peer::new(0, "a", "b", "c")).await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidArgument(_)));
        let err = reg.rm_peers(&Peer::new(0, "a", "b", "c")).await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_rm_peers() {
        let reg = registry();
        reg.add_peers(Peer::new(1, "a:1", "trtl-1", "us-east-1")).await.unwrap();
        reg.add_peers(Peer::new(2, "a:2", "trtl-2", "us-east-1")).await.unwrap();

        let status = reg.rm_peers(&Peer::new(2, "", "", "")).await.unwrap();
        assert_eq!(status.network_size, 1);

        let err = reg.rm_peers(&Peer::new(2, "", "", "")).await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_select_no_peers() {
        assert!(registry().select_peer(1).await.is_none());
    }

    #[tokio::test]
    async fn test_select_only_self() {
        let reg = registry();
        reg.add_peers(Peer::new(1, "a:1", "trtl-1", "us-east-1")).await.unwrap();
        assert!(reg.select_peer(1).await.is_none());
    }

    #[tokio::test]
    async fn test_select_never_self() {
        let reg = registry();
        for id in 1..=5 {
            reg.add_peers(Peer::new(id, format!("a:{}", id), format!("trtl-{}", id), "us-east-1"))
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            if let Some(peer) = reg.select_peer(3).await {
                assert_ne!(peer.id, 3);
                seen.insert(peer.id);
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_last_synchronization_reported() {
        let reg = registry();
        reg.clock.synchronized_now();
        let status = reg.status().await.unwrap();
        assert_ne!(status.last_synchronization, "never");
        assert!(DateTime::parse_from_rfc3339(&status.last_synchronization).is_ok());
    }
}
