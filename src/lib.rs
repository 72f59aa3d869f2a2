//! # trtl replica
//!
//! A replicated key/value store kept consistent by bilateral anti-entropy
//! gossip.
//!
//! ## Architecture
//!
//! Every replica serves key/value RPCs against its local object store and
//! periodically reconciles with one randomly chosen peer:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               trtl replica                                │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ TrtlService │───►│ ObjectStore  │◄───│ ReplicaService               │  │
//! │  │ get/put/... │    │ (memory or   │    │ scheduler + gossip sessions  │  │
//! │  └─────────────┘    │  SQLite)     │    └──────────────────────────────┘  │
//! │         ▲           └──────────────┘          ▲            │              │
//! │         │                  ▲                  │            ▼              │
//! │  ┌──────┴──────────────────┴──────────────────┴──┐   ┌─────────────┐      │
//! │  │ Server (TCP, length-delimited bincode frames) │   │ PeerRegistry│      │
//! │  └───────────────────────────────────────────────┘   │ ("peers" ns)│      │
//! │                                                      └─────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Anti-entropy
//!
//! A session has two phases per side. The initiator offers versions of a
//! random sample of its objects (CHECK), the remote answers with newer data
//! (REPAIR) or asks for the initiator's copy, then pushes everything the
//! initiator did not mention. Objects are sampled with a probability that
//! decays with their age, so recent writes spread fastest.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use trtl_replica::config::TrtlConfig;
//! use trtl_replica::gossip::ReplicaService;
//! use trtl_replica::object::Identity;
//! use trtl_replica::probability::shared_rng;
//! use trtl_replica::server::{self, Server, TcpDialer};
//! use trtl_replica::trtl::TrtlService;
//!
//! #[tokio::main]
//! async fn main() -> trtl_replica::Result<()> {
//!     let config = TrtlConfig::default();
//!     config.validate()?;
//!
//!     let identity = Identity::new(config.replica.pid, &config.replica.region, config.replica.display_name());
//!     let store = trtl_replica::store::open(&config.database, identity).await?;
//!
//!     let trtl = Arc::new(TrtlService::new(Arc::clone(&store), &config));
//!     let replica = Arc::new(ReplicaService::new(
//!         config.replica.clone(),
//!         store,
//!         TcpDialer::new(server::DEFAULT_CONNECT_TIMEOUT),
//!         shared_rng(None),
//!     )?);
//!     replica.start().await?;
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let listener = server::bind(&config.bind_addr).await?;
//!     Server::new(&config, trtl, Arc::clone(&replica)).serve(listener, shutdown_rx).await?;
//!
//!     replica.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod gossip;
pub mod iterator;
pub mod metrics;
pub mod object;
pub mod peer;
pub mod probability;
pub mod resilience;
pub mod server;
pub mod store;
pub mod transport;
pub mod trtl;

// Re-exports for convenience
pub use config::{DatabaseConfig, ReplicaConfig, ReplicaStrategy, StoreEngine, TrtlConfig};
pub use error::{MultiError, ReplicaError, Result};
pub use gossip::{Dialer, MemoryDialer, ReplicaService, ReplicaState, SessionStats};
pub use iterator::{BatchIterator, KvIterator, LocalClient, StreamingIterator, TrtlClient};
pub use object::{Identity, Object, UpdateType, VersionVector};
pub use peer::{Peer, PeerRegistry};
pub use server::{Server, TcpClient, TcpDialer};
pub use store::{MemoryStore, ObjectStore};
pub use trtl::TrtlService;
