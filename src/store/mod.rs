// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object store capability trait.
//!
//! The replica only needs a narrow slice of a storage engine: point reads
//! and writes, version-aware updates, and ordered namespace scans. Anything
//! beyond that is optional and defaults to [`ReplicaError::Unsupported`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trtl_replica::object::Identity;
//! use trtl_replica::store::{MemoryStore, ObjectStore};
//!
//! # async fn example() -> trtl_replica::Result<()> {
//! let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(Identity::new(8, "us-east-1", "trtl-8")));
//! store.put("vasps", b"alice", b"{}".to_vec()).await?;
//! let value = store.get("vasps", b"alice").await?;
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{DatabaseConfig, StoreEngine};
use crate::error::{ReplicaError, Result};
use crate::object::{Identity, Object, UpdateType};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Page size used when walking a namespace.
pub const DEFAULT_SCAN_PAGE: usize = 100;

/// Bounds for a namespace scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    /// Only keys starting with this prefix.
    pub prefix: Vec<u8>,
    /// First key to return (inclusive).
    pub start: Option<Vec<u8>>,
    /// Maximum objects to return; 0 means no limit.
    pub limit: usize,
    /// Include deleted objects.
    pub tombstones: bool,
}

impl ScanRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// True if `key` falls inside the prefix and start bounds.
    pub fn contains(&self, key: &[u8]) -> bool {
        if !key.starts_with(&self.prefix) {
            return false;
        }
        match &self.start {
            Some(start) => key >= start.as_slice(),
            None => true,
        }
    }
}

/// A stored row whose metadata could not be decoded.
///
/// Keeps the key so a namespace walk can step past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptObject {
    pub namespace: String,
    pub key: Vec<u8>,
    pub reason: String,
}

impl CorruptObject {
    pub fn into_error(self) -> ReplicaError {
        ReplicaError::Codec(format!(
            "corrupt object {}/{}: {}",
            self.namespace,
            URL_SAFE_NO_PAD.encode(&self.key),
            self.reason
        ))
    }
}

/// One row of a scan.
pub type ScanItem = std::result::Result<Object, CorruptObject>;

/// Key of a scanned row, decoded or not.
pub fn scan_key(item: &ScanItem) -> &[u8] {
    match item {
        Ok(obj) => &obj.key,
        Err(bad) => &bad.key,
    }
}

/// Summary returned by [`ObjectStore::count`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Count {
    pub objects: u64,
    pub key_bytes: u64,
    pub value_bytes: u64,
}

/// What the replica needs from a storage engine.
///
/// Implementations must be safe for concurrent use by several gossip
/// sessions at once.
pub trait ObjectStore: Send + Sync + 'static {
    /// Value of a live object. Tombstones are `NotFound`.
    fn get<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Vec<u8>>;

    /// Write a new version of the object stamped with the local identity.
    fn put<'a>(&'a self, namespace: &'a str, key: &'a [u8], value: Vec<u8>) -> StoreFuture<'a, Object>;

    /// Write a tombstone version. Missing or already deleted keys are `NotFound`.
    fn delete<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object>;

    /// Full object including metadata; tombstones are returned.
    fn object<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object>;

    /// Apply a replicated object if its version is later than the local one.
    fn update(&self, object: Object) -> StoreFuture<'_, UpdateType>;

    /// Rows in key order within `range`.
    ///
    /// A row that cannot be decoded is reported in place and does not fail
    /// the page; the outer error is for the query as a whole.
    fn scan<'a>(&'a self, namespace: &'a str, range: ScanRange) -> StoreFuture<'a, Vec<ScanItem>>;

    /// Count live objects under a prefix.
    fn count<'a>(&'a self, _namespace: &'a str, _prefix: &'a [u8]) -> StoreFuture<'a, Count> {
        Box::pin(async { Err(ReplicaError::unsupported("count")) })
    }
}

/// Open the store selected by the database config.
pub async fn open(config: &DatabaseConfig, identity: Identity) -> Result<Arc<dyn ObjectStore>> {
    match config.engine {
        StoreEngine::Memory => Ok(Arc::new(MemoryStore::new(identity))),
        StoreEngine::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path, identity).await?)),
    }
}

/// Smallest key strictly greater than `key`.
pub(crate) fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Walks a namespace one page at a time.
///
/// Holds at most one page of rows in memory. A corrupt row comes back as
/// an error from [`next`](Self::next) and the walk continues after it; a
/// failed page query ends the walk.
pub struct Scanner {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    range: ScanRange,
    page: VecDeque<ScanItem>,
    exhausted: bool,
}

impl Scanner {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>, mut range: ScanRange) -> Self {
        if range.limit == 0 {
            range.limit = DEFAULT_SCAN_PAGE;
        }
        Self {
            store,
            namespace: namespace.into(),
            range,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Next object, or `None` once the namespace is exhausted.
    pub async fn next(&mut self) -> Result<Option<Object>> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fill().await {
                self.exhausted = true;
                return Err(e);
            }
        }
        match self.page.pop_front() {
            Some(Ok(obj)) => Ok(Some(obj)),
            Some(Err(bad)) => Err(bad.into_error()),
            None => Ok(None),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let page = self.store.scan(&self.namespace, self.range.clone()).await?;
        if page.len() < self.range.limit {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.range.start = Some(successor(scan_key(last)));
        }
        self.page.extend(page);
        Ok(())
    }
}
