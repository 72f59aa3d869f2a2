// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gossip stream messages.
//!
//! Both roles exchange the same message shape; which side opened the stream
//! decides how each status is handled.
//!
//! | Status | Payload | Meaning |
//! |--------|---------|---------|
//! | `Check` | object without value | "this is my version, is yours later?" |
//! | `Repair` | full object | "here is a later version, apply it" |
//! | `Complete` | none | sender has finished its scan |
//! | `Error` | optional object, message | the peer failed to handle a message |

use crate::object::{Object, VersionVector};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Check,
    Repair,
    Complete,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Check => write!(f, "CHECK"),
            SyncStatus::Repair => write!(f, "REPAIR"),
            SyncStatus::Complete => write!(f, "COMPLETE"),
            SyncStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub status: SyncStatus,
    pub object: Option<Object>,
    pub error: Option<String>,
}

impl SyncMessage {
    /// CHECK carrying only the object metadata.
    pub fn check(object: &Object) -> Self {
        Self {
            status: SyncStatus::Check,
            object: Some(object.without_value()),
            error: None,
        }
    }

    /// CHECK asking the peer for an object this replica does not have.
    pub fn check_missing(object: &Object) -> Self {
        let mut obj = object.without_value();
        obj.version = VersionVector::zero();
        Self {
            status: SyncStatus::Check,
            object: Some(obj),
            error: None,
        }
    }

    pub fn repair(object: Object) -> Self {
        Self {
            status: SyncStatus::Repair,
            object: Some(object),
            error: None,
        }
    }

    pub fn complete() -> Self {
        Self {
            status: SyncStatus::Complete,
            object: None,
            error: None,
        }
    }

    pub fn error(object: Option<&Object>, message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            object: object.map(Object::without_value),
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Identity;

    fn obj() -> Object {
        Identity::new(1, "us-east-1", "trtl-1").stamp("v", b"x", b"data".to_vec(), None, false)
    }

    #[test]
    fn test_check_strips_value() {
        let msg = SyncMessage::check(&obj());
        assert_eq!(msg.status, SyncStatus::Check);
        let payload = msg.object.unwrap();
        assert!(payload.value.is_empty());
        assert_eq!(payload.version.counter, 1);
    }

    #[test]
    fn test_check_missing_uses_version_zero() {
        let msg = SyncMessage::check_missing(&obj());
        assert!(msg.object.unwrap().version.is_zero());
    }

    #[test]
    fn test_repair_keeps_value() {
        let msg = SyncMessage::repair(obj());
        assert_eq!(msg.object.unwrap().value, b"data");
    }

    #[test]
    fn test_error_message() {
        let msg = SyncMessage::error(None, "disabled");
        assert_eq!(msg.status, SyncStatus::Error);
        assert!(msg.object.is_none());
        assert_eq!(msg.error.as_deref(), Some("disabled"));
        assert_eq!(msg.status.to_string(), "ERROR");
    }
}
