// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replica.
//!
//! Errors are categorized by where they come from (the network, the local
//! store, the gossip protocol, configuration) so callers can decide whether
//! an anti-entropy session should simply be retried on the next tick.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connection refused, stream broken, dial timeout |
//! | `Timeout` | Yes | Session exceeded its deadline |
//! | `Protocol` | No | Malformed or unexpected gossip message |
//! | `Storage` | No | Local SQLite errors (needs operator attention) |
//! | `Multi` | No | Aggregated per-object errors from one scan |
//! | `Codec` | No | bincode/base64/json encode or decode failure |
//! | `Config` | No | Missing or invalid replica identity |
//! | `NotFound` | No | Key does not exist (or is a tombstone) |
//! | `AlreadyExists` | No | Key exists when it was required not to |
//! | `InvalidArgument` | No | Bad request (empty key, bad page token) |
//! | `FailedPrecondition` | No | Operation not possible in current state |
//! | `PermissionDenied` | No | Reserved namespace access |
//! | `Unsupported` | No | Store does not implement the capability |
//! | `InvalidState` | No | Service state machine violation |
//! | `Shutdown` | No | Service is shutting down |
//! | `Internal` | No | Unexpected internal error (including worker panics) |
//!
//! # Retry Behavior
//!
//! Retryable errors are never retried immediately. The anti-entropy
//! scheduler logs them and tries again with a (possibly different) peer on
//! the next jittered tick.

use std::fmt;
use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors that can occur in the replica.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// Network failure talking to a peer.
    #[error("Transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// A session or RPC ran past its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The remote sent something the gossip protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SQLite error in the local object store.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Several independent errors collected during one pass.
    #[error("{0}")]
    Multi(MultiError),

    /// Serialization failure (wire frames, page tokens, stored peers).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    ///
    /// Fatal at startup: the node must not serve with a bad identity.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The store does not implement this capability.
    ///
    /// Distinct from `Internal` so callers can branch on it.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Service state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicaError {
    /// Create a transport error for a peer.
    pub fn transport(peer: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.to_string(),
        }
    }

    /// Create an unsupported-capability error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout(_) => true,
            Self::Protocol(_) => false,
            Self::Storage(_) => false,
            Self::Multi(_) => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::NotFound(_) => false,
            Self::AlreadyExists(_) => false,
            Self::InvalidArgument(_) => false,
            Self::FailedPrecondition(_) => false,
            Self::PermissionDenied(_) => false,
            Self::Unsupported { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Short label used for the error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Storage(_) => "storage",
            Self::Multi(_) => "multi",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }

    /// Rebuild an error reported by a server as `(kind, message)`.
    ///
    /// Kinds that only make sense locally come back as `Internal`.
    pub fn from_wire(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "transport" => Self::transport("server", message),
            "protocol" => Self::Protocol(message),
            "codec" => Self::Codec(message),
            "not_found" => Self::NotFound(message),
            "already_exists" => Self::AlreadyExists(message),
            "invalid_argument" => Self::InvalidArgument(message),
            "failed_precondition" => Self::FailedPrecondition(message),
            "permission_denied" => Self::PermissionDenied(message),
            "unsupported" => Self::unsupported(message),
            "shutdown" => Self::Shutdown,
            _ => Self::Internal(message),
        }
    }
}

impl From<bincode::Error> for ReplicaError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for ReplicaError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<MultiError> for ReplicaError {
    fn from(e: MultiError) -> Self {
        Self::Multi(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MultiError: aggregate of independent failures
// ═══════════════════════════════════════════════════════════════════════════════

/// A collection of errors surfaced as a single failure.
///
/// Scans keep going past a bad object and push the error here; the
/// caller turns it into one result once the pass is finished.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ReplicaError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ReplicaError) {
        // Flatten nested aggregates so the count stays meaningful.
        match err {
            ReplicaError::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ReplicaError] {
        &self.errors
    }

    /// `Ok(())` if nothing was collected, otherwise a `ReplicaError::Multi`.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ReplicaError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors occurred"),
            1 => write!(f, "1 error occurred: {}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for err in &self.errors {
                    write!(f, "\n\t* {}", err)?;
                }
                Ok(())
            }
        }
    }
}
