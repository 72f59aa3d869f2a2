// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Anti-entropy replication service.
//!
//! Ties together:
//! - Peer selection via [`crate::peer::PeerRegistry`]
//! - Probabilistic object selection via [`crate::probability::ReplicationOracle`]
//! - Session workers for both roles ([`initiator`] and [`remote`])
//! - The jittered scheduler ([`JitterTicker`])
//!
//! # Architecture
//!
//! Every replica periodically picks a random peer and runs one bilateral
//! session with it:
//!
//! ```text
//!  initiator                                   remote
//!  ─────────                                   ──────
//!  phase 1: CHECK (versions) ───────────────►  compare, reply CHECK/REPAIR
//!           COMPLETE ───────────────────────►  phase 2: REPAIR unseen objects
//!  phase 2: apply REPAIR, answer CHECK  ◄────  COMPLETE
//! ```
//!
//! Afterwards both sides hold the later version of every object either side
//! sent. Sessions are driven from the scheduler on a jittered interval, but
//! [`ReplicaService::anti_entropy_sync`] runs one on demand.

mod dialer;
mod initiator;
mod message;
mod remote;
mod seen;
mod sender;
mod ticker;
mod types;

pub use dialer::{Dialer, MemoryDialer, MEMORY_STREAM_CAPACITY};
pub use message::{SyncMessage, SyncStatus};
pub use seen::SeenSet;
pub use sender::{StreamSender, STREAM_BUFFER};
pub use ticker::{JitterTicker, MIN_DELAY};
pub use types::{ReplicaState, Role, SessionStats, SyncClock};

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::object::{Object, UpdateType};
use crate::peer::{Peer, PeerRegistry};
use crate::probability::{ReplicationOracle, SelectionPolicy, SharedRng};
use crate::store::ObjectStore;
use crate::transport::Duplex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// State shared by the scheduler and every session.
#[derive(Clone)]
pub(crate) struct Replica {
    pub(crate) config: ReplicaConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) oracle: ReplicationOracle,
    pub(crate) clock: SyncClock,
}

impl Replica {
    fn replicates(&self, namespace: &str) -> bool {
        self.config.replicated_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Apply a REPAIR from the peer.
    pub(crate) async fn apply(&self, object: Object) -> Result<UpdateType> {
        if !self.replicates(&object.namespace) {
            debug!(namespace = %object.namespace, "Ignoring repair for namespace that is not replicated");
            return Ok(UpdateType::Skip);
        }

        let namespace = object.namespace.clone();
        let key = object.key_b64();
        match self.store.update(object).await {
            Ok(update) => {
                metrics::record_update(&namespace, update);
                trace!(namespace = %namespace, key = %key, update = %update, "Repair applied");
                Ok(update)
            }
            Err(e) => {
                warn!(namespace = %namespace, key = %key, error = %e, "Could not apply repair");
                Err(e)
            }
        }
    }

    pub(crate) fn log_remote_error(&self, msg: &SyncMessage) {
        let error = msg.error.as_deref().unwrap_or("unknown error");
        match &msg.object {
            Some(obj) => warn!(
                namespace = %obj.namespace,
                key = %obj.key_b64(),
                error = %error,
                "Peer could not handle sync message"
            ),
            None => warn!(error = %error, "Peer reported a gossip error"),
        }
    }
}

/// Map a joined task result onto the crate error.
pub(crate) fn joined<T>(task: &str, result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ReplicaError::Internal(format!("{} panicked: {}", task, e))),
        Err(e) => Err(ReplicaError::Internal(format!("{} was cancelled: {}", task, e))),
    }
}

/// Run one initiated session against `peer`.
async fn sync_with(replica: &Arc<Replica>, dialer: &dyn Dialer, peer: &Peer) -> Result<SessionStats> {
    let start = Instant::now();
    let timeout = replica.config.session_timeout();

    let stream = tokio::time::timeout(timeout, dialer.dial(peer))
        .await
        .map_err(|_| ReplicaError::Timeout(timeout))??;

    let stats = initiator::run(Arc::clone(replica), stream, timeout).await?;
    metrics::record_session_latency(&peer.name, Role::Initiator.as_str(), start.elapsed());
    Ok(stats)
}

/// The anti-entropy replication service.
///
/// Owns the scheduler that initiates sessions and serves sessions opened
/// by peers through [`gossip`](Self::gossip).
pub struct ReplicaService {
    replica: Arc<Replica>,

    /// Peer membership (shares the store and sync clock)
    registry: PeerRegistry,

    /// Opens streams to selected peers
    dialer: Arc<dyn Dialer>,

    /// Randomness for the oracle, peer selection and the ticker
    rng: SharedRng,

    /// Service state (broadcast to watchers)
    state_tx: watch::Sender<ReplicaState>,
    state_rx: watch::Receiver<ReplicaState>,

    /// Shutdown signal for the scheduler
    shutdown_tx: watch::Sender<bool>,

    /// Scheduler task handle
    scheduler: Mutex<Option<JoinHandle<()>>>,

    /// Sessions currently served for remote initiators
    active_sessions: Arc<AtomicUsize>,
}

impl ReplicaService {
    /// Create the service. It starts in [`ReplicaState::Created`]; call
    /// [`start()`](Self::start) to begin anti-entropy.
    pub fn new(
        config: ReplicaConfig,
        store: Arc<dyn ObjectStore>,
        dialer: Arc<dyn Dialer>,
        rng: SharedRng,
    ) -> Result<Self> {
        config.validate()?;

        let clock = SyncClock::new();
        let registry = PeerRegistry::new(Arc::clone(&store), Arc::clone(&rng), clock.clone());
        let replica = Replica {
            config,
            store,
            oracle: ReplicationOracle::new(Arc::clone(&rng)),
            clock,
        };

        let (state_tx, state_rx) = watch::channel(ReplicaState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            replica: Arc::new(replica),
            registry,
            dialer,
            rng,
            state_tx,
            state_rx,
            shutdown_tx,
            scheduler: Mutex::new(None),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replace the object selection policy (before `start`).
    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        let mut replica = (*self.replica).clone();
        replica.oracle = ReplicationOracle::with_policy(Arc::clone(&self.rng), policy);
        self.replica = Arc::new(replica);
        self
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.replica.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.replica.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Get current service state.
    pub fn state(&self) -> ReplicaState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicaState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReplicaState::Running)
    }

    /// `"never"` or the RFC3339 time of the last session that moved data.
    pub fn last_synchronization(&self) -> String {
        self.replica.clock.last_synchronization()
    }

    /// Number of sessions currently served for remote initiators.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ReplicaState) {
        let _ = self.state_tx.send(state);
        metrics::set_replica_state(&state.to_string());
    }

    /// Start the anti-entropy scheduler.
    ///
    /// When replication is disabled the service still moves to `Running`
    /// but no scheduler is spawned.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ReplicaState::Created {
            return Err(ReplicaError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let config = &self.replica.config;
        if !config.enabled {
            info!("Anti-entropy not enabled");
            self.set_state(ReplicaState::Running);
            return Ok(());
        }

        let scheduler = Scheduler {
            replica: Arc::clone(&self.replica),
            registry: self.registry.clone(),
            dialer: Arc::clone(&self.dialer),
            ticker: JitterTicker::new(config.interval(), config.sigma(), Arc::clone(&self.rng)),
        };
        let span = info_span!("anti_entropy", pid = config.pid, name = %config.display_name());
        let handle = tokio::spawn(scheduler.run(self.shutdown_tx.subscribe()).instrument(span));
        *self.scheduler.lock().await = Some(handle);

        self.set_state(ReplicaState::Running);
        info!(
            pid = config.pid,
            region = %config.region,
            namespaces = ?config.replicated_namespaces,
            "Replica service running"
        );
        Ok(())
    }

    /// Run one session against `peer` now, outside the schedule.
    pub async fn anti_entropy_sync(&self, peer: &Peer) -> Result<SessionStats> {
        let span = info_span!("session", role = "initiator", peer = %peer.name, addr = %peer.addr);
        let result = sync_with(&self.replica, self.dialer.as_ref(), peer).instrument(span).await;
        metrics::record_sync(&peer.name, &peer.region, Role::Initiator.as_str());
        result
    }

    /// Serve a session opened by a remote initiator.
    pub async fn gossip(&self, stream: Duplex<SyncMessage, SyncMessage>) -> Result<SessionStats> {
        self.gossip_until(stream, CancellationToken::new()).await
    }

    /// Serve a session, ending early when `cancel` fires.
    pub async fn gossip_until(
        &self,
        stream: Duplex<SyncMessage, SyncMessage>,
        cancel: CancellationToken,
    ) -> Result<SessionStats> {
        let active = self.active_sessions.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_sessions(active);

        let start = Instant::now();
        let span = info_span!("session", role = "remote");
        let result = remote::serve(Arc::clone(&self.replica), stream, cancel).instrument(span).await;
        metrics::record_session_latency("remote", Role::Remote.as_str(), start.elapsed());
        if let Err(e) = &result {
            metrics::record_error(e.kind());
        }

        let active = self.active_sessions.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_active_sessions(active);
        result
    }

    /// Stop the scheduler, waiting for an in-flight session to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down replica service");
        self.set_state(ReplicaState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Anti-entropy scheduler panicked");
                self.set_state(ReplicaState::Failed);
                return;
            }
        }

        self.set_state(ReplicaState::Stopped);
        info!("Replica service stopped");
    }
}

struct Scheduler {
    replica: Arc<Replica>,
    registry: PeerRegistry,
    dialer: Arc<dyn Dialer>,
    ticker: JitterTicker,
}

impl Scheduler {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        // Ignore a stale value
        let _ = shutdown_rx.borrow_and_update();

        info!(
            interval = ?self.replica.config.interval(),
            sigma = ?self.replica.config.sigma(),
            "Anti-entropy routine started"
        );

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Stopping anti-entropy routine");
                        break;
                    }
                    continue;
                }

                _ = self.ticker.tick() => {}
            }

            let Some(peer) = self.registry.select_peer(self.replica.config.pid).await else {
                debug!("No remote peer available; skipping anti-entropy round");
                continue;
            };

            let span = info_span!("session", role = "initiator", peer = %peer.name, addr = %peer.addr);
            match sync_with(&self.replica, self.dialer.as_ref(), &peer).instrument(span).await {
                Ok(stats) => debug!(
                    peer = %peer.name,
                    versions = stats.versions,
                    updates = stats.updates,
                    repairs = stats.repairs,
                    "Anti-entropy session finished"
                ),
                Err(e) => {
                    warn!(peer = %peer.name, addr = %peer.addr, error = %e, "Anti-entropy session failed");
                    metrics::record_error(e.kind());
                }
            }
            metrics::record_sync(&peer.name, &peer.region, Role::Initiator.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Identity, VersionVector};
    use crate::probability::shared_rng;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn replica_config(pid: u64) -> ReplicaConfig {
        ReplicaConfig {
            replicated_namespaces: vec!["v".to_string(), "peers".to_string()],
            ..ReplicaConfig::for_testing(pid, "us-east-1")
        }
    }

    fn service(pid: u64, dialer: Arc<MemoryDialer>) -> (Arc<ReplicaService>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(Identity::new(pid, "us-east-1", format!("trtl-{}", pid))));
        let svc = ReplicaService::new(replica_config(pid), store.clone(), dialer, shared_rng(Some(pid)))
            .unwrap()
            .with_selection_policy(SelectionPolicy::Always);
        (Arc::new(svc), store)
    }

    fn obj(key: &str, pid: u64, counter: u64, value: &str) -> Object {
        Object {
            namespace: "v".to_string(),
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            version: VersionVector {
                pid,
                counter,
                ..VersionVector::first(pid, "us-east-1")
            },
            tombstone: false,
            owner: format!("trtl-{}", pid),
            region: "us-east-1".to_string(),
            modified: Utc::now(),
        }
    }

    #[test]
    fn test_joined_maps_result() {
        let ok: std::result::Result<Result<u8>, JoinError> = Ok(Ok(3));
        assert_eq!(joined("task", ok).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_joined_maps_panic_to_internal() {
        let handle = tokio::spawn(async {
            if true {
                panic!("boom");
            }
            Ok::<(), ReplicaError>(())
        });
        let err = joined("task", handle.await).unwrap_err();
        assert!(matches!(err, ReplicaError::Internal(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new(Identity::new(1, "us-east-1", "trtl-1")));
        let config = ReplicaConfig {
            pid: 0,
            ..ReplicaConfig::for_testing(1, "us-east-1")
        };
        let result = ReplicaService::new(config, store, MemoryDialer::new(), shared_rng(None));
        assert!(matches!(result, Err(ReplicaError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let (svc, _) = service(1, MemoryDialer::new());
        assert_eq!(svc.state(), ReplicaState::Created);
        svc.start().await.unwrap();
        assert!(svc.is_running());

        let err = svc.start().await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidState { .. }));

        svc.shutdown().await;
        assert_eq!(svc.state(), ReplicaState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let (svc, _) = service(1, MemoryDialer::new());
        svc.shutdown().await;
        assert_eq!(svc.state(), ReplicaState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_runs_without_scheduler() {
        let store = Arc::new(MemoryStore::new(Identity::new(1, "us-east-1", "trtl-1")));
        let config = ReplicaConfig {
            enabled: false,
            ..ReplicaConfig::default()
        };
        let svc = ReplicaService::new(config, store, MemoryDialer::new(), shared_rng(None)).unwrap();
        svc.start().await.unwrap();
        assert!(svc.is_running());
        assert!(svc.scheduler.lock().await.is_none());
        svc.shutdown().await;
        assert_eq!(svc.state(), ReplicaState::Stopped);
    }

    #[tokio::test]
    async fn test_session_pulls_and_pushes() {
        let dialer = MemoryDialer::new();
        let (a, store_a) = service(1, dialer.clone());
        let (b, store_b) = service(2, dialer.clone());
        dialer.register("b:4436", &b);

        store_a.insert(obj("only-a", 1, 1, "a")).await;
        store_b.insert(obj("only-b", 2, 1, "b")).await;

        let peer = Peer::new(2, "b:4436", "trtl-2", "us-east-1");
        let stats = a.anti_entropy_sync(&peer).await.unwrap();
        assert_eq!(stats.repairs, 1);
        assert_eq!(stats.updates, 1);

        assert_eq!(store_a.get("v", b"only-b").await.unwrap(), b"b");

        // The remote finishes applying after the initiator returns.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while store_b.get("v", b"only-a").await.is_err() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_ne!(a.last_synchronization(), "never");
    }

    #[tokio::test]
    async fn test_sync_with_unknown_address_fails() {
        let (a, _) = service(1, MemoryDialer::new());
        let peer = Peer::new(2, "nowhere:1", "trtl-2", "us-east-1");
        let err = a.anti_entropy_sync(&peer).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Transport { .. }));
        assert_eq!(a.last_synchronization(), "never");
    }

    #[tokio::test]
    async fn test_repair_outside_replicated_namespaces_is_skipped() {
        let (a, store_a) = service(1, MemoryDialer::new());
        let mut o = obj("k", 2, 1, "x");
        o.namespace = "private".to_string();
        let update = a.replica.apply(o).await.unwrap();
        assert_eq!(update, UpdateType::Skip);
        assert!(store_a.is_empty("private").await);
    }
}
