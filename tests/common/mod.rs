//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - In-memory replicas wired together through a `MemoryDialer`
//! - TCP replicas bound to loopback
//! - Object fixtures with explicit versions

#![allow(dead_code)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trtl_replica::config::{ReplicaConfig, TrtlConfig};
use trtl_replica::gossip::{Dialer, MemoryDialer, ReplicaService};
use trtl_replica::object::{Identity, Object, VersionVector};
use trtl_replica::peer::Peer;
use trtl_replica::probability::{shared_rng, SelectionPolicy};
use trtl_replica::server::{self, Server, TcpDialer};
use trtl_replica::store::{MemoryStore, ObjectStore};
use trtl_replica::trtl::TrtlService;

pub const REGION: &str = "us-east-1";

/// Install a subscriber honouring `RUST_LOG`; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replica config replicating the `v` test namespace and peers.
pub fn replica_config(pid: u64) -> ReplicaConfig {
    ReplicaConfig {
        replicated_namespaces: vec!["v".to_string(), "peers".to_string()],
        ..ReplicaConfig::for_testing(pid, REGION)
    }
}

/// One replica with direct access to its store.
pub struct TestReplica {
    pub pid: u64,
    pub service: Arc<ReplicaService>,
    pub store: Arc<MemoryStore>,
    pub trtl: Arc<TrtlService>,
}

impl TestReplica {
    pub fn new(config: ReplicaConfig, dialer: Arc<dyn Dialer>) -> Self {
        init_tracing();
        let pid = config.pid;
        let store = Arc::new(MemoryStore::new(Identity::new(pid, REGION, format!("trtl-{}", pid))));
        let service = ReplicaService::new(config.clone(), store.clone(), dialer, shared_rng(Some(pid)))
            .expect("valid replica config")
            .with_selection_policy(SelectionPolicy::Always);

        let trtl_config = TrtlConfig {
            replica: config,
            ..TrtlConfig::default()
        };
        let trtl = Arc::new(TrtlService::new(store.clone(), &trtl_config));

        Self {
            pid,
            service: Arc::new(service),
            store,
            trtl,
        }
    }

    pub fn peer(&self, addr: &str) -> Peer {
        Peer::new(self.pid, addr, format!("trtl-{}", self.pid), REGION)
    }
}

/// Two in-memory replicas; `b` is reachable from `a` at [`B_ADDR`].
pub const B_ADDR: &str = "trtl-2:4436";

pub fn pair() -> (TestReplica, TestReplica, Arc<MemoryDialer>) {
    pair_with(replica_config(1), replica_config(2))
}

pub fn pair_with(a: ReplicaConfig, b: ReplicaConfig) -> (TestReplica, TestReplica, Arc<MemoryDialer>) {
    let dialer = MemoryDialer::new();
    let a = TestReplica::new(a, dialer.clone());
    let b = TestReplica::new(b, dialer.clone());
    dialer.register(B_ADDR, &b.service);
    (a, b, dialer)
}

/// A replica serving on an ephemeral loopback port.
pub struct TcpReplica {
    pub replica: TestReplica,
    pub addr: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<trtl_replica::Result<()>>,
}

impl TcpReplica {
    pub async fn start(config: ReplicaConfig) -> Self {
        let replica = TestReplica::new(config, TcpDialer::new(Duration::from_secs(2)));
        let listener = server::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr").to_string();

        let server = Server::new(&TrtlConfig::default(), replica.trtl.clone(), replica.service.clone());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { server.serve(listener, rx).await });

        Self {
            replica,
            addr,
            shutdown,
            handle,
        }
    }

    pub fn peer(&self) -> Peer {
        self.replica.peer(&self.addr)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.await.expect("server task").expect("server stopped cleanly");
    }
}

/// An object in the `v` namespace with an explicit version and no parent.
pub fn object(key: &str, pid: u64, counter: u64, value: &str) -> Object {
    Object {
        namespace: "v".to_string(),
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        version: VersionVector {
            pid,
            counter,
            region: REGION.to_string(),
            parent: None,
        },
        tombstone: false,
        owner: format!("trtl-{}", pid),
        region: REGION.to_string(),
        modified: Utc::now(),
    }
}

/// Wait until `check` holds for the object at `key`, or panic after a second.
///
/// The remote side of a session applies its last repairs after the
/// initiator has already returned.
pub async fn eventually<F>(store: &MemoryStore, namespace: &str, key: &[u8], check: F) -> Object
where
    F: Fn(&Object) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(obj) = store.object(namespace, key).await {
                if check(&obj) {
                    return obj;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match found {
        Ok(obj) => obj,
        Err(_) => panic!("{} was not replicated in time", String::from_utf8_lossy(key)),
    }
}
