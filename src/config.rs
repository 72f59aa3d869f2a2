//! Configuration for a trtl replica.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"1m"`, `"5s"`).
//!
//! # Quick Start
//!
//! ```rust
//! use trtl_replica::config::{TrtlConfig, ReplicaConfig};
//!
//! let config = TrtlConfig {
//!     replica: ReplicaConfig::for_testing(8, "us-east-1"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! TrtlConfig
//! ├── bind_addr: String            # Gossip/RPC listen address
//! ├── maintenance: bool            # Report "maintenance" status
//! ├── max_sessions: usize          # Concurrent inbound streams
//! ├── replica: ReplicaConfig
//! │   ├── enabled, pid, region, name
//! │   ├── gossip_interval / gossip_sigma
//! │   └── replicated_namespaces
//! └── database: DatabaseConfig     # memory or sqlite
//! ```
//!
//! # Replica Identity Strategies
//!
//! The pid must be unique in the network. In a StatefulSet every pod shares
//! one config, so [`ReplicaConfig::configure`] can derive the identity from
//! the pod hostname, a pid file, or a JSON map of pid to full config.

use crate::error::{MultiError, ReplicaError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrtlConfig {
    /// Address the gossip and key/value RPC server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Report "maintenance" from the status RPC.
    #[serde(default)]
    pub maintenance: bool,

    /// Maximum concurrent inbound streams (gossip sessions and cursors).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub replica: ReplicaConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:4436".to_string()
}

fn default_max_sessions() -> usize {
    16
}

impl Default for TrtlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            maintenance: false,
            max_sessions: default_max_sessions(),
            replica: ReplicaConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl TrtlConfig {
    /// Check the config before the node starts serving.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ReplicaError::Config(format!("invalid bind_addr {:?}: {}", self.bind_addr, e)))?;

        if self.max_sessions == 0 {
            return Err(ReplicaError::Config("max_sessions must be at least 1".to_string()));
        }

        self.replica.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig: identity and gossip timing
// ═══════════════════════════════════════════════════════════════════════════════

/// Replica identity and anti-entropy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Run anti-entropy and accept gossip streams.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Process id; must be unique in the network.
    #[serde(default)]
    pub pid: u64,

    /// Region the replica runs in.
    #[serde(default)]
    pub region: String,

    /// Human readable name (defaults to something derived from the pid).
    #[serde(default)]
    pub name: String,

    /// Mean time between anti-entropy sessions.
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval: String,

    /// Standard deviation of the jitter applied to the interval.
    #[serde(default = "default_gossip_sigma")]
    pub gossip_sigma: String,

    /// Namespaces exchanged during anti-entropy.
    #[serde(default = "default_replicated_namespaces")]
    pub replicated_namespaces: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_gossip_interval() -> String {
    "1m".to_string()
}

fn default_gossip_sigma() -> String {
    "5s".to_string()
}

fn default_replicated_namespaces() -> Vec<String> {
    vec![crate::peer::NAMESPACE_PEERS.to_string()]
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pid: 0,
            region: String::new(),
            name: String::new(),
            gossip_interval: default_gossip_interval(),
            gossip_sigma: default_gossip_sigma(),
            replicated_namespaces: default_replicated_namespaces(),
        }
    }
}

impl ReplicaConfig {
    /// A valid, enabled config for tests.
    pub fn for_testing(pid: u64, region: &str) -> Self {
        Self {
            pid,
            region: region.to_string(),
            name: format!("trtl-{}", pid),
            ..Default::default()
        }
    }

    /// Gossip interval, falling back to one minute if unparseable.
    pub fn interval(&self) -> Duration {
        humantime::parse_duration(&self.gossip_interval).unwrap_or(Duration::from_secs(60))
    }

    /// Gossip sigma, falling back to five seconds if unparseable.
    pub fn sigma(&self) -> Duration {
        humantime::parse_duration(&self.gossip_sigma).unwrap_or(Duration::from_secs(5))
    }

    /// Deadline for one initiated session.
    ///
    /// Two sigmas short of the mean interval so a session finishes before
    /// the next tick in the common case.
    pub fn session_timeout(&self) -> Duration {
        self.interval().saturating_sub(self.sigma() * 2)
    }

    /// Name used in logs and peer records.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("trtl-{}", self.pid)
        } else {
            self.name.clone()
        }
    }

    /// Validation only applies when replication is enabled.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.pid == 0 {
            return Err(ReplicaError::Config("invalid replica configuration: pid is required".to_string()));
        }

        if self.region.is_empty() {
            return Err(ReplicaError::Config("invalid replica configuration: region is required".to_string()));
        }

        let interval = parse_nonzero("gossip_interval", &self.gossip_interval)?;
        let sigma = parse_nonzero("gossip_sigma", &self.gossip_sigma)?;
        if interval <= sigma * 2 {
            return Err(ReplicaError::Config(format!(
                "invalid replica configuration: gossip_interval ({}) must exceed twice gossip_sigma ({})",
                self.gossip_interval, self.gossip_sigma
            )));
        }

        Ok(())
    }

    /// Apply identity strategies in order and return a new config.
    ///
    /// `HostnamePid` and `FilePid` failures are collected and processing
    /// continues. `JsonConfig` is skipped once anything has failed; when it
    /// finds the pid it ends processing successfully. Any collected failures
    /// are returned together as a [`MultiError`].
    pub fn configure(&self, strategies: &[ReplicaStrategy]) -> Result<ReplicaConfig> {
        let mut conf = self.clone();
        let mut errs = MultiError::new();

        for strategy in strategies {
            match strategy.apply(&conf, &errs) {
                Ok(Applied::Continue(next)) => conf = next,
                Ok(Applied::Break(done)) => return Ok(done),
                Err(e) => errs.push(e),
            }
        }

        errs.into_result()?;
        Ok(conf)
    }
}

fn parse_nonzero(field: &str, value: &str) -> Result<Duration> {
    let d = humantime::parse_duration(value)
        .map_err(|e| ReplicaError::Config(format!("invalid replica configuration: {} {:?}: {}", field, value, e)))?;
    if d.is_zero() {
        return Err(ReplicaError::Config(format!(
            "invalid replica configuration: {} must be non-zero",
            field
        )));
    }
    Ok(d)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replica strategies
// ═══════════════════════════════════════════════════════════════════════════════

/// A way of deriving the replica identity beyond plain config values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaStrategy {
    /// Parse `name-N` from the hostname (None reads the host's name) and add N to the pid.
    HostnamePid(Option<String>),
    /// Add the integer stored in a file to the pid.
    FilePid(PathBuf),
    /// Replace the config with the entry for this pid in a JSON map.
    JsonConfig(PathBuf),
}

enum Applied {
    Continue(ReplicaConfig),
    Break(ReplicaConfig),
}

impl ReplicaStrategy {
    fn apply(&self, conf: &ReplicaConfig, prior: &MultiError) -> Result<Applied> {
        match self {
            ReplicaStrategy::HostnamePid(hostname) => {
                let hostname = match hostname {
                    Some(h) => h.clone(),
                    None => local_hostname()?,
                };
                hostname_pid(conf, &hostname).map(Applied::Continue)
            }
            ReplicaStrategy::FilePid(path) => file_pid(conf, path).map(Applied::Continue),
            ReplicaStrategy::JsonConfig(path) => {
                if !prior.is_empty() {
                    return Ok(Applied::Continue(conf.clone()));
                }
                json_config(conf, path)
            }
        }
    }
}

fn local_hostname() -> Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .map_err(|e| ReplicaError::Config(format!("could not fetch hostname: {}", e)))
}

fn hostname_pid(conf: &ReplicaConfig, hostname: &str) -> Result<ReplicaConfig> {
    let re = Regex::new(r"^(?P<name>[\w\-\.]+)-(?P<pod>\d+)$")
        .map_err(|e| ReplicaError::Internal(e.to_string()))?;

    let caps = re.captures(hostname).ok_or_else(|| {
        ReplicaError::Config(format!("could not parse {:?} - does not match host-pid expression", hostname))
    })?;

    let pod: u64 = caps["pod"]
        .parse()
        .map_err(|_| ReplicaError::Config(format!("could not parse {:?} - not a uint64", &caps["pod"])))?;

    let mut out = conf.clone();
    out.pid += pod;
    out.name = format!("{}-{}", &caps["name"], out.pid);
    Ok(out)
}

fn file_pid(conf: &ReplicaConfig, path: &Path) -> Result<ReplicaConfig> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| ReplicaError::Config(format!("could not read pid file {:?}: {}", path, e)))?;

    let pid: u64 = data
        .trim()
        .parse()
        .map_err(|_| ReplicaError::Config("could not parse data in pid file - not a uint64".to_string()))?;

    let mut out = conf.clone();
    out.pid += pid;
    out.name = format!("{}-{}", conf.name, out.pid);
    Ok(out)
}

fn json_config(conf: &ReplicaConfig, path: &Path) -> Result<Applied> {
    if !path.exists() {
        return Ok(Applied::Continue(conf.clone()));
    }

    let data = std::fs::read(path)
        .map_err(|e| ReplicaError::Config(format!("could not read json config {:?}: {}", path, e)))?;

    let configs: HashMap<u64, ReplicaConfig> = serde_json::from_slice(&data)
        .map_err(|e| ReplicaError::Config(format!("could not unmarshal JSON data: {}", e)))?;

    // The mapped entry must be complete; serde defaults still apply.
    match configs.get(&conf.pid) {
        Some(found) => Ok(Applied::Break(found.clone())),
        None => Ok(Applied::Continue(conf.clone())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DatabaseConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Which object store backs the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreEngine {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub engine: StoreEngine,

    /// SQLite file path (ignored by the memory engine).
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "trtl.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: StoreEngine::Sqlite,
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            engine: StoreEngine::Memory,
            path: String::new(),
        }
    }
}
