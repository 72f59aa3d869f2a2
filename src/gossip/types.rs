//! Replica service state types.
//!
//! Defines the state machine for the anti-entropy service lifecycle and the
//! small shared values the gossip workers report into.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//!
//! Failed: the scheduler task panicked.
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicaService::new()`. No scheduler running.
//! - **Running**: Scheduler ticking (if enabled); gossip streams are served.
//! - **ShuttingDown**: `shutdown()` called. Waiting for the in-flight session.
//! - **Stopped**: Scheduler has exited. Safe to drop.
//! - **Failed**: The scheduler died unexpectedly.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::{Arc, RwLock};

/// State of the replica service.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::ReplicaService::start) to begin anti-entropy.
    Created,

    /// Anti-entropy scheduler running.
    Running,

    /// Shutting down gracefully.
    ///
    /// The scheduler has been signalled; an in-flight session is allowed to
    /// finish. Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// The scheduler task panicked. Check logs for details.
    Failed,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Created => write!(f, "Created"),
            ReplicaState::Running => write!(f, "Running"),
            ReplicaState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicaState::Stopped => write!(f, "Stopped"),
            ReplicaState::Failed => write!(f, "Failed"),
        }
    }
}

/// Which side of a session this replica plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the stream (client side).
    Initiator,
    /// Accepted the stream (server side).
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Remote => "remote",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time of the last session that changed data on either side.
///
/// Cloned handles share the same timestamp.
#[derive(Debug, Clone, Default)]
pub struct SyncClock {
    inner: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synchronized_now(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Utc::now());
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// `"never"` or an RFC3339 timestamp.
    pub fn last_synchronization(&self) -> String {
        match self.last() {
            Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            None => "never".to_string(),
        }
    }
}

/// Message counts for one session, from this replica's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// CHECK messages received from the peer.
    pub versions: u64,
    /// REPAIR messages sent to the peer.
    pub updates: u64,
    /// REPAIR messages applied locally.
    pub repairs: u64,
}

impl SessionStats {
    pub fn synchronized(&self) -> bool {
        self.updates > 0 || self.repairs > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_state_display() {
        assert_eq!(ReplicaState::Created.to_string(), "Created");
        assert_eq!(ReplicaState::Running.to_string(), "Running");
        assert_eq!(ReplicaState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(ReplicaState::Stopped.to_string(), "Stopped");
        assert_eq!(ReplicaState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::Initiator.to_string(), "initiator");
        assert_eq!(Role::Remote.as_str(), "remote");
    }

    #[test]
    fn test_sync_clock_never() {
        let clock = SyncClock::new();
        assert_eq!(clock.last_synchronization(), "never");
        assert!(clock.last().is_none());
    }

    #[test]
    fn test_sync_clock_shared_between_clones() {
        let clock = SyncClock::new();
        let other = clock.clone();
        other.synchronized_now();

        let ts = clock.last_synchronization();
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_session_stats_synchronized() {
        assert!(!SessionStats::default().synchronized());
        assert!(SessionStats { updates: 1, ..Default::default() }.synchronized());
        assert!(SessionStats { repairs: 2, ..Default::default() }.synchronized());
        assert!(!SessionStats { versions: 9, ..Default::default() }.synchronized());
    }
}
