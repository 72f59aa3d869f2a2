// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Page tokens for paginated iteration.
//!
//! A [`PageCursor`] records where the next page of an `iter` request starts.
//! Clients treat the token as opaque and hand it back unchanged.
//!
//! # Encoding
//!
//! ```text
//! PageCursor ──bincode──► bytes ──base64 (URL-safe, no padding)──► token
//! ```
//!
//! Field order is part of the wire format: reordering or retyping fields
//! breaks tokens held by clients across an upgrade.
//!
//! # Seeking
//!
//! The batch iterator seeks by asking the server for a page that starts at a
//! key. It does this with a synthetic token from [`seek_cursor`], so seeking
//! is resolved on the server rather than by skipping rows on the client.

use crate::error::{ReplicaError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Position of the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page_size: i32,
    /// First key of the next page.
    pub next_key: Vec<u8>,
    /// Namespace the iteration is bound to.
    pub namespace: String,
}

impl PageCursor {
    pub fn new(page_size: i32, next_key: impl Into<Vec<u8>>, namespace: impl Into<String>) -> Self {
        Self {
            page_size,
            next_key: next_key.into(),
            namespace: namespace.into(),
        }
    }

    /// Serialize into a page token.
    pub fn dump(&self) -> Result<String> {
        let data = bincode::serialize(self)?;
        Ok(URL_SAFE_NO_PAD.encode(data))
    }

    /// Parse a page token produced by [`dump`](Self::dump).
    pub fn load(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Err(ReplicaError::Codec("empty page token".to_string()));
        }
        let data = URL_SAFE_NO_PAD.decode(token)?;
        Ok(bincode::deserialize(&data)?)
    }
}

/// A token for a page of `page_size` that starts at `key`.
pub fn seek_cursor(page_size: i32, key: &[u8], namespace: &str) -> Result<String> {
    PageCursor::new(page_size, key, namespace).dump()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cursor = PageCursor::new(100, b"alice".to_vec(), "vasps");
        let token = cursor.dump().unwrap();
        assert_eq!(PageCursor::load(&token).unwrap(), cursor);
    }

    #[test]
    fn test_token_is_url_safe() {
        let cursor = PageCursor::new(7, vec![0xfb, 0xff, 0xfe, 0x3e, 0x3f], "ns");
        let token = cursor.dump().unwrap();
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
    }

    #[test]
    fn test_empty_next_key_round_trips() {
        let cursor = PageCursor::new(10, Vec::new(), "");
        assert_eq!(PageCursor::load(&cursor.dump().unwrap()).unwrap(), cursor);
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(PageCursor::load("").is_err());
        assert!(PageCursor::load("not base64 at all!").is_err());
        // Valid base64, but far too short for a cursor.
        assert!(matches!(PageCursor::load("AA"), Err(ReplicaError::Codec(_))));
    }

    #[test]
    fn test_seek_cursor() {
        let token = seek_cursor(100, b"k9", "default").unwrap();
        let cursor = PageCursor::load(&token).unwrap();
        assert_eq!(cursor.page_size, 100);
        assert_eq!(cursor.next_key, b"k9");
        assert_eq!(cursor.namespace, "default");
    }
}
