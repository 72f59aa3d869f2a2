// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned objects: the unit of replication.
//!
//! Every write to the store produces a new [`VersionVector`] whose `parent`
//! is the version it superseded. Replicas compare versions to decide which
//! copy of a key wins:
//!
//! ```text
//! counter higher            → later
//! counter equal, pid higher → later (deterministic tie-break)
//! counter and pid equal     → same version
//! ```
//!
//! There is no causal merge across processes. Two writes from different
//! processes with the same counter resolve to the higher pid on every node.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Version metadata attached to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    /// Process id of the replica that produced this version.
    pub pid: u64,
    /// Monotonic write counter for the object.
    pub counter: u64,
    /// Region of the producing replica.
    pub region: String,
    /// The version this write replaced (None for the first write).
    pub parent: Option<Box<VersionVector>>,
}

impl VersionVector {
    /// The sentinel version that every real version is later than.
    ///
    /// Sent in a CHECK reply when the responder does not have the key at all.
    pub fn zero() -> Self {
        Self {
            pid: 0,
            counter: 0,
            region: String::new(),
            parent: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.pid == 0 && self.counter == 0
    }

    /// First version of a brand new object.
    pub fn first(pid: u64, region: impl Into<String>) -> Self {
        Self {
            pid,
            counter: 1,
            region: region.into(),
            parent: None,
        }
    }

    /// The version that follows this one when `pid` writes the object.
    ///
    /// The parent link is shallow; grandparents are not retained.
    pub fn next(&self, pid: u64, region: impl Into<String>) -> Self {
        Self {
            pid,
            counter: self.counter + 1,
            region: region.into(),
            parent: Some(Box::new(self.shallow())),
        }
    }

    fn shallow(&self) -> Self {
        Self {
            pid: self.pid,
            counter: self.counter,
            region: self.region.clone(),
            parent: None,
        }
    }

    /// Total order used for conflict resolution.
    pub fn precedence(&self, other: &VersionVector) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.pid.cmp(&other.pid))
    }

    /// True if this version should replace `other`.
    pub fn is_later(&self, other: &VersionVector) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// True if both name the same write (same process and counter).
    pub fn same(&self, other: &VersionVector) -> bool {
        self.precedence(other) == Ordering::Equal
    }

    /// True if `other` is the direct parent of this version.
    pub fn is_child_of(&self, other: &VersionVector) -> bool {
        self.parent.as_deref().is_some_and(|p| p.same(other))
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.counter)
    }
}

/// A stored key/value pair with its version metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub namespace: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: VersionVector,
    /// Deletions replicate as tombstones so a stale peer cannot undo them.
    pub tombstone: bool,
    /// Name of the replica that created the object.
    pub owner: String,
    /// Region of the replica that created the object.
    pub region: String,
    /// When this version was written.
    pub modified: DateTime<Utc>,
}

impl Object {
    /// Copy of the object with the value stripped, for CHECK messages.
    pub fn without_value(&self) -> Self {
        Self {
            value: Vec::new(),
            ..self.clone()
        }
    }

    /// Key encoded for logging.
    pub fn key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.key)
    }
}

/// Outcome of applying a replicated object to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Applied; the incoming version directly follows the local one (or the key was new).
    Forward,
    /// Applied; the incoming version is later but did not descend from the local one.
    Stomp,
    /// Ignored; the local version is later.
    Skip,
    /// Ignored; both sides already hold this version.
    NoChange,
}

impl UpdateType {
    /// Decide how an incoming version relates to the local one.
    pub fn resolve(local: Option<&VersionVector>, incoming: &VersionVector) -> Self {
        let Some(local) = local else {
            return UpdateType::Forward;
        };

        match incoming.precedence(local) {
            Ordering::Equal => UpdateType::NoChange,
            Ordering::Less => UpdateType::Skip,
            Ordering::Greater if incoming.is_child_of(local) => UpdateType::Forward,
            Ordering::Greater => UpdateType::Stomp,
        }
    }

    /// True if the store was modified.
    pub fn applied(&self) -> bool {
        matches!(self, UpdateType::Forward | UpdateType::Stomp)
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::Forward => write!(f, "forward"),
            UpdateType::Stomp => write!(f, "stomp"),
            UpdateType::Skip => write!(f, "skip"),
            UpdateType::NoChange => write!(f, "no change"),
        }
    }
}

/// Identity stamped onto local writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub pid: u64,
    pub region: String,
    pub owner: String,
}

impl Identity {
    pub fn new(pid: u64, region: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            pid,
            region: region.into(),
            owner: owner.into(),
        }
    }

    /// Build the object produced by writing `value` over `previous`.
    pub fn stamp(
        &self,
        namespace: &str,
        key: &[u8],
        value: Vec<u8>,
        previous: Option<&Object>,
        tombstone: bool,
    ) -> Object {
        let (version, owner, region) = match previous {
            Some(prev) => (
                prev.version.next(self.pid, &self.region),
                prev.owner.clone(),
                prev.region.clone(),
            ),
            None => (
                VersionVector::first(self.pid, &self.region),
                self.owner.clone(),
                self.region.clone(),
            ),
        };

        Object {
            namespace: namespace.to_string(),
            key: key.to_vec(),
            value,
            version,
            tombstone,
            owner,
            region,
            modified: Utc::now(),
        }
    }
}
