// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key/value RPCs served by a replica.
//!
//! [`TrtlService`] validates requests and translates them onto the
//! [`ObjectStore`]. Local writes get a new version stamped with the replica
//! identity and reach the other replicas through anti-entropy.
//!
//! # Namespaces
//!
//! An empty namespace means [`DEFAULT_NAMESPACE`]. Namespaces in
//! [`RESERVED_NAMESPACES`] hold replica state (peer records) and are refused
//! with `PermissionDenied`.
//!
//! # Iteration
//!
//! | RPC | Shape | Notes |
//! |-----|-------|-------|
//! | `iter` | one page per call | resume with `next_page_token` |
//! | `cursor` | stream of pairs | optional seek key |
//!
//! Both skip tombstones. The `iter_no_keys`, `iter_no_values` and
//! `return_meta` options trim each pair; asking for none of the three is
//! rejected because there would be nothing to return.

use crate::config::{ReplicaConfig, TrtlConfig};
use crate::cursor::PageCursor;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::object::{Object, VersionVector};
use crate::peer::NAMESPACE_PEERS;
use crate::store::{scan_key, ObjectStore, ScanRange, Scanner};
use crate::transport::MessageSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Page size when the request does not set one.
pub const DEFAULT_PAGE_SIZE: i32 = 100;

/// Namespace used when a request leaves it empty.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespaces clients may not touch.
pub const RESERVED_NAMESPACES: &[&str] = &[NAMESPACE_PEERS];

/// Request options shared by every RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    pub return_meta: bool,
    pub require_exists: bool,
    pub require_not_exists: bool,
    pub iter_no_keys: bool,
    pub iter_no_values: bool,
    pub page_token: String,
    pub page_size: i32,
}

impl Options {
    fn returns_no_data(&self) -> bool {
        self.iter_no_keys && self.iter_no_values && !self.return_meta
    }
}

/// Object metadata returned when `return_meta` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub key: Vec<u8>,
    pub namespace: String,
    pub region: String,
    pub owner: String,
    pub version: VersionVector,
}

impl From<&Object> for Meta {
    fn from(obj: &Object) -> Self {
        Self {
            key: obj.key.clone(),
            namespace: obj.namespace.clone(),
            region: obj.region.clone(),
            owner: obj.owner.clone(),
            version: obj.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: Vec<u8>,
    pub namespace: String,
    pub options: Options,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub value: Vec<u8>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub namespace: String,
    pub options: Options,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: Vec<u8>,
    pub namespace: String,
    pub options: Options,
}

/// Reply to a put or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub success: bool,
    pub meta: Option<Meta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterRequest {
    pub prefix: Vec<u8>,
    pub namespace: String,
    pub options: Options,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterReply {
    pub values: Vec<KvPair>,
    /// Empty when there are no more pages.
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRequest {
    pub prefix: Vec<u8>,
    /// Start the stream at this key (inclusive) when set.
    pub seek_key: Vec<u8>,
    pub namespace: String,
    pub options: Options,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub namespace: String,
    pub meta: Option<Meta>,
}

impl KvPair {
    fn project(obj: Object, opts: &Options) -> Self {
        let mut pair = KvPair {
            meta: opts.return_meta.then(|| Meta::from(&obj)),
            ..KvPair::default()
        };
        if !opts.iter_no_keys {
            pair.key = obj.key;
            pair.namespace = obj.namespace;
        }
        if !opts.iter_no_values {
            pair.value = obj.value;
        }
        pair
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRequest {
    pub prefix: Vec<u8>,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReply {
    pub objects: u64,
    pub key_bytes: u64,
    pub value_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub enabled: bool,
    pub pid: u64,
    pub region: String,
    pub name: String,
    pub interval: String,
    pub sigma: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// `"ok"` or `"maintenance"`.
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub replica: ReplicaStatus,
}

fn check_namespace(namespace: &str) -> Result<()> {
    if RESERVED_NAMESPACES.contains(&namespace) {
        warn!(namespace = %namespace, "Cannot use reserved namespace");
        return Err(ReplicaError::PermissionDenied("cannot use reserved namespace".into()));
    }
    Ok(())
}

/// The namespace a request actually addresses.
pub fn resolve_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Record the RPC outcome and pass the result through.
fn observe<T>(method: &str, result: Result<T>) -> Result<T> {
    metrics::record_rpc(method, result.is_ok());
    result
}

/// Key/value RPC handlers over an object store.
pub struct TrtlService {
    store: Arc<dyn ObjectStore>,
    replica: ReplicaConfig,
    maintenance: bool,
    started: Instant,
}

impl TrtlService {
    pub fn new(store: Arc<dyn ObjectStore>, config: &TrtlConfig) -> Self {
        Self {
            store,
            replica: config.replica.clone(),
            maintenance: config.maintenance,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn get(&self, req: GetRequest) -> Result<GetReply> {
        observe("get", self.do_get(req).await)
    }

    async fn do_get(&self, req: GetRequest) -> Result<GetReply> {
        check_namespace(&req.namespace)?;
        if req.key.is_empty() {
            return Err(ReplicaError::InvalidArgument("key must be provided in Get request".into()));
        }

        let namespace = resolve_namespace(&req.namespace);
        let obj = self.store.object(namespace, &req.key).await?;
        if obj.tombstone {
            debug!(namespace = %namespace, key = %obj.key_b64(), "Specified key not found");
            return Err(ReplicaError::NotFound(format!("key not found in {}", namespace)));
        }

        let meta = req.options.return_meta.then(|| Meta::from(&obj));
        debug!(namespace = %namespace, return_meta = meta.is_some(), "trtl Get");
        Ok(GetReply { value: obj.value, meta })
    }

    pub async fn put(&self, req: PutRequest) -> Result<WriteReply> {
        observe("put", self.do_put(req).await)
    }

    async fn do_put(&self, req: PutRequest) -> Result<WriteReply> {
        check_namespace(&req.namespace)?;
        if req.key.is_empty() {
            return Err(ReplicaError::InvalidArgument("key must be provided in Put request".into()));
        }
        if req.value.is_empty() {
            return Err(ReplicaError::InvalidArgument("value must be provided in Put request".into()));
        }

        let namespace = resolve_namespace(&req.namespace);
        self.check_existence(namespace, &req.key, &req.options).await?;

        let obj = self.store.put(namespace, &req.key, req.value).await?;
        debug!(namespace = %namespace, key = %obj.key_b64(), version = %obj.version, "trtl Put");
        Ok(WriteReply {
            success: true,
            meta: req.options.return_meta.then(|| Meta::from(&obj)),
        })
    }

    pub async fn delete(&self, req: DeleteRequest) -> Result<WriteReply> {
        observe("delete", self.do_delete(req).await)
    }

    async fn do_delete(&self, req: DeleteRequest) -> Result<WriteReply> {
        check_namespace(&req.namespace)?;
        if req.key.is_empty() {
            return Err(ReplicaError::InvalidArgument("key must be provided in Delete request".into()));
        }

        let namespace = resolve_namespace(&req.namespace);
        self.check_existence(namespace, &req.key, &req.options).await?;

        let obj = self.store.delete(namespace, &req.key).await?;
        debug!(namespace = %namespace, key = %obj.key_b64(), version = %obj.version, "trtl Delete");
        Ok(WriteReply {
            success: true,
            meta: req.options.return_meta.then(|| Meta::from(&obj)),
        })
    }

    /// Enforce `require_exists` / `require_not_exists`. Tombstones count as absent.
    async fn check_existence(&self, namespace: &str, key: &[u8], opts: &Options) -> Result<()> {
        if !opts.require_exists && !opts.require_not_exists {
            return Ok(());
        }

        let exists = match self.store.object(namespace, key).await {
            Ok(obj) => !obj.tombstone,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if opts.require_exists && !exists {
            return Err(ReplicaError::NotFound(format!("key does not exist in {}", namespace)));
        }
        if opts.require_not_exists && exists {
            // Surfaced to clients as a failed precondition.
            return Err(ReplicaError::FailedPrecondition(format!("key already exists in {}", namespace)));
        }
        Ok(())
    }

    /// One page of pairs under `prefix`.
    pub async fn iter(&self, req: IterRequest) -> Result<IterReply> {
        observe("iter", self.do_iter(req).await)
    }

    async fn do_iter(&self, req: IterRequest) -> Result<IterReply> {
        check_namespace(&req.namespace)?;

        let mut opts = req.options;
        if opts.page_size == 0 {
            opts.page_size = DEFAULT_PAGE_SIZE;
        }
        if opts.page_size < 0 {
            return Err(ReplicaError::InvalidArgument("page size cannot be negative".into()));
        }
        if opts.returns_no_data() {
            warn!(namespace = %req.namespace, "Iter request would return no data");
            return Err(ReplicaError::InvalidArgument(
                "cannot specify no keys, values, and no return meta: no data would be returned".into(),
            ));
        }

        let namespace = resolve_namespace(&req.namespace);
        let cursor = if opts.page_token.is_empty() {
            PageCursor::new(opts.page_size, Vec::new(), namespace)
        } else {
            let cursor = PageCursor::load(&opts.page_token).map_err(|e| {
                warn!(error = %e, "Invalid page token on iter request");
                ReplicaError::InvalidArgument("invalid page token".into())
            })?;

            if cursor.page_size != opts.page_size {
                return Err(ReplicaError::InvalidArgument("page size cannot change between requests".into()));
            }
            if !cursor.next_key.starts_with(&req.prefix) {
                return Err(ReplicaError::InvalidArgument("prefix cannot change between requests".into()));
            }
            if cursor.namespace != namespace {
                return Err(ReplicaError::InvalidArgument("namespace cannot change between requests".into()));
            }
            cursor
        };

        // One extra object tells us whether there is a next page.
        let page_size = cursor.page_size as usize;
        let range = ScanRange {
            prefix: req.prefix,
            start: (!cursor.next_key.is_empty()).then_some(cursor.next_key),
            limit: page_size + 1,
            tombstones: false,
        };
        let iteration_failure = |e: ReplicaError| {
            warn!(namespace = %namespace, error = %e, "Could not iterate");
            ReplicaError::FailedPrecondition(format!("iteration failure: {}", e))
        };
        let mut rows = self.store.scan(namespace, range).await.map_err(iteration_failure)?;

        let mut reply = IterReply::default();
        if rows.len() > page_size {
            if let Some(next) = rows.pop() {
                let next_key = scan_key(&next).to_vec();
                reply.next_page_token = PageCursor::new(cursor.page_size, next_key, namespace).dump()?;
            }
        }
        reply.values = rows
            .into_iter()
            .map(|row| {
                row.map(|obj| KvPair::project(obj, &opts))
                    .map_err(|bad| iteration_failure(bad.into_error()))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            namespace = %namespace,
            count = reply.values.len(),
            has_next_page = !reply.next_page_token.is_empty(),
            "Iter request complete"
        );
        Ok(reply)
    }

    /// Check a cursor request before any pair is streamed.
    pub fn validate_cursor(&self, req: &CursorRequest) -> Result<()> {
        check_namespace(&req.namespace)?;
        if req.options.returns_no_data() {
            warn!(namespace = %req.namespace, "Cursor request would return no data");
            return Err(ReplicaError::InvalidArgument(
                "cannot specify no keys, values, and no return meta: no data would be returned".into(),
            ));
        }
        Ok(())
    }

    /// Stream every live pair under the prefix into `sink`.
    ///
    /// Returns the number of pairs sent. The sink is not closed.
    pub async fn cursor(&self, req: CursorRequest, sink: &mut dyn MessageSink<KvPair>) -> Result<u64> {
        let result = self.stream_cursor(req, sink).await;
        observe("cursor", result)
    }

    async fn stream_cursor(&self, req: CursorRequest, sink: &mut dyn MessageSink<KvPair>) -> Result<u64> {
        self.validate_cursor(&req)?;

        let namespace = resolve_namespace(&req.namespace);
        let range = ScanRange {
            prefix: req.prefix,
            start: (!req.seek_key.is_empty()).then_some(req.seek_key),
            limit: 0,
            tombstones: false,
        };
        let mut scanner = Scanner::new(Arc::clone(&self.store), namespace, range);

        let mut sent: u64 = 0;
        while let Some(obj) = scanner.next().await? {
            if let Err(e) = sink.send(KvPair::project(obj, &req.options)).await {
                // Usually the client hanging up early.
                debug!(error = %e, "Could not send cursor reply during iteration");
                return Err(e);
            }
            sent += 1;
        }

        info!(namespace = %namespace, count = sent, "Cursor request complete");
        Ok(sent)
    }

    /// Count live objects under a prefix.
    pub async fn count(&self, req: CountRequest) -> Result<CountReply> {
        observe("count", self.do_count(req).await)
    }

    async fn do_count(&self, req: CountRequest) -> Result<CountReply> {
        check_namespace(&req.namespace)?;
        let namespace = resolve_namespace(&req.namespace);

        let count = match self.store.count(namespace, &req.prefix).await {
            Ok(count) => count,
            Err(e) if e.is_unsupported() => {
                // Fall back to a scan for stores without a native count.
                let mut count = crate::store::Count::default();
                let mut scanner = Scanner::new(Arc::clone(&self.store), namespace, ScanRange::with_prefix(req.prefix));
                while let Some(obj) = scanner.next().await? {
                    count.objects += 1;
                    count.key_bytes += obj.key.len() as u64;
                    count.value_bytes += obj.value.len() as u64;
                }
                count
            }
            Err(e) => return Err(e),
        };

        info!(namespace = %namespace, count = count.objects, "Count request complete");
        Ok(CountReply {
            objects: count.objects,
            key_bytes: count.key_bytes,
            value_bytes: count.value_bytes,
        })
    }

    pub fn status(&self) -> ServerStatus {
        let uptime = Duration::from_secs(self.started.elapsed().as_secs());
        ServerStatus {
            status: if self.maintenance { "maintenance" } else { "ok" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: humantime::format_duration(uptime).to_string(),
            replica: ReplicaStatus {
                enabled: self.replica.enabled,
                pid: self.replica.pid,
                region: self.replica.region.clone(),
                name: self.replica.display_name(),
                interval: self.replica.gossip_interval.clone(),
                sigma: self.replica.gossip_sigma.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Identity;
    use crate::store::MemoryStore;
    use crate::transport::{channel, MessageSource};

    fn service() -> TrtlService {
        let store = Arc::new(MemoryStore::new(Identity::new(1, "us-east-1", "trtl-1")));
        let config = TrtlConfig {
            replica: ReplicaConfig::for_testing(1, "us-east-1"),
            ..TrtlConfig::default()
        };
        TrtlService::new(store, &config)
    }

    async fn seed(svc: &TrtlService, namespace: &str, n: usize) {
        for i in 0..n {
            svc.put(PutRequest {
                key: format!("key-{:03}", i).into_bytes(),
                value: format!("value-{}", i).into_bytes(),
                namespace: namespace.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
    }

    fn put(key: &str, value: &str) -> PutRequest {
        PutRequest {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn get(key: &str) -> GetRequest {
        GetRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn delete(key: &str) -> DeleteRequest {
        DeleteRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let svc = service();
        let reply = svc.put(put("a", "1")).await.unwrap();
        assert!(reply.success);
        assert!(reply.meta.is_none());

        let got = svc.get(get("a")).await.unwrap();
        assert_eq!(got.value, b"1");

        svc.delete(delete("a")).await.unwrap();
        assert!(matches!(svc.get(get("a")).await, Err(ReplicaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_namespace_is_default() {
        let svc = service();
        svc.put(put("a", "1")).await.unwrap();
        assert_eq!(svc.store().get(DEFAULT_NAMESPACE, b"a").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_return_meta() {
        let svc = service();
        let mut req = put("a", "1");
        req.options.return_meta = true;
        let meta = svc.put(req).await.unwrap().meta.unwrap();
        assert_eq!(meta.version.pid, 1);
        assert_eq!(meta.version.counter, 1);
        assert_eq!(meta.namespace, DEFAULT_NAMESPACE);

        let mut req = get("a");
        req.options.return_meta = true;
        svc.put(put("a", "2")).await.unwrap();
        let meta = svc.get(req).await.unwrap().meta.unwrap();
        assert_eq!(meta.version.counter, 2);
        assert_eq!(meta.version.parent.unwrap().counter, 1);
    }

    #[tokio::test]
    async fn test_validation() {
        let svc = service();
        assert!(matches!(svc.put(put("", "1")).await, Err(ReplicaError::InvalidArgument(_))));
        assert!(matches!(svc.put(put("a", "")).await, Err(ReplicaError::InvalidArgument(_))));
        assert!(matches!(svc.get(get("")).await, Err(ReplicaError::InvalidArgument(_))));
        assert!(matches!(svc.delete(delete("")).await, Err(ReplicaError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_reserved_namespace() {
        let svc = service();
        let mut req = put("a", "1");
        req.namespace = NAMESPACE_PEERS.to_string();
        assert!(matches!(svc.put(req).await, Err(ReplicaError::PermissionDenied(_))));

        let req = IterRequest {
            namespace: NAMESPACE_PEERS.to_string(),
            ..Default::default()
        };
        assert!(matches!(svc.iter(req).await, Err(ReplicaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_require_exists_options() {
        let svc = service();

        let mut req = put("a", "1");
        req.options.require_exists = true;
        assert!(matches!(svc.put(req).await, Err(ReplicaError::NotFound(_))));

        svc.put(put("a", "1")).await.unwrap();
        let mut req = put("a", "2");
        req.options.require_not_exists = true;
        assert!(matches!(svc.put(req).await, Err(ReplicaError::FailedPrecondition(_))));

        // Deleted keys count as absent.
        svc.delete(delete("a")).await.unwrap();
        let mut req = put("a", "3");
        req.options.require_not_exists = true;
        svc.put(req).await.unwrap();
    }

    #[tokio::test]
    async fn test_iter_pages() {
        let svc = service();
        seed(&svc, "vasps", 25).await;

        let mut req = IterRequest {
            namespace: "vasps".to_string(),
            options: Options {
                page_size: 10,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut keys = Vec::new();
        let mut pages = 0;
        loop {
            let reply = svc.iter(req.clone()).await.unwrap();
            pages += 1;
            keys.extend(reply.values.into_iter().map(|p| p.key));
            if reply.next_page_token.is_empty() {
                break;
            }
            req.options.page_token = reply.next_page_token;
        }

        assert_eq!(pages, 3);
        assert_eq!(keys.len(), 25);
        assert_eq!(keys[0], b"key-000");
        assert_eq!(keys[24], b"key-024");
    }

    #[tokio::test]
    async fn test_iter_exact_page_has_no_next_token() {
        let svc = service();
        seed(&svc, "vasps", 10).await;
        let req = IterRequest {
            namespace: "vasps".to_string(),
            options: Options {
                page_size: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let reply = svc.iter(req).await.unwrap();
        assert_eq!(reply.values.len(), 10);
        assert!(reply.next_page_token.is_empty());
    }

    #[tokio::test]
    async fn test_iter_skips_tombstones() {
        let svc = service();
        seed(&svc, "", 5).await;
        svc.delete(delete("key-002")).await.unwrap();

        let reply = svc.iter(IterRequest::default()).await.unwrap();
        assert_eq!(reply.values.len(), 4);
        assert!(reply.values.iter().all(|p| p.key != b"key-002"));
    }

    #[tokio::test]
    async fn test_iter_token_must_match_request() {
        let svc = service();
        seed(&svc, "vasps", 5).await;

        let token = PageCursor::new(2, b"key-003".to_vec(), "vasps").dump().unwrap();
        let base = IterRequest {
            namespace: "vasps".to_string(),
            options: Options {
                page_size: 2,
                page_token: token.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(svc.iter(base.clone()).await.unwrap().values.len(), 2);

        let mut req = base.clone();
        req.options.page_size = 3;
        assert!(matches!(svc.iter(req).await, Err(ReplicaError::InvalidArgument(_))));

        let mut req = base.clone();
        req.prefix = b"other".to_vec();
        assert!(matches!(svc.iter(req).await, Err(ReplicaError::InvalidArgument(_))));

        let mut req = base.clone();
        req.namespace = "certs".to_string();
        assert!(matches!(svc.iter(req).await, Err(ReplicaError::InvalidArgument(_))));

        let mut req = base;
        req.options.page_token = "garbage".to_string();
        assert!(matches!(svc.iter(req).await, Err(ReplicaError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_iter_options() {
        let svc = service();
        seed(&svc, "", 3).await;

        let mut req = IterRequest::default();
        req.options.iter_no_values = true;
        let reply = svc.iter(req).await.unwrap();
        assert!(reply.values.iter().all(|p| p.value.is_empty() && !p.key.is_empty()));

        let mut req = IterRequest::default();
        req.options.iter_no_keys = true;
        req.options.iter_no_values = true;
        assert!(matches!(svc.iter(req.clone()).await, Err(ReplicaError::InvalidArgument(_))));

        req.options.return_meta = true;
        let reply = svc.iter(req).await.unwrap();
        assert!(reply.values.iter().all(|p| p.key.is_empty() && p.meta.is_some()));
    }

    #[tokio::test]
    async fn test_cursor_streams_from_seek_key() {
        let svc = service();
        seed(&svc, "", 10).await;
        svc.delete(delete("key-007")).await.unwrap();

        let (mut sink, mut source) = channel::<KvPair>(32);
        let req = CursorRequest {
            seek_key: b"key-005".to_vec(),
            ..Default::default()
        };
        let sent = svc.cursor(req, &mut sink).await.unwrap();
        assert_eq!(sent, 4);
        sink.close().await.unwrap();

        let mut keys = Vec::new();
        while let Some(pair) = source.recv().await.unwrap() {
            keys.push(String::from_utf8(pair.key).unwrap());
        }
        assert_eq!(keys, vec!["key-005", "key-006", "key-008", "key-009"]);
    }

    #[tokio::test]
    async fn test_count() {
        let svc = service();
        seed(&svc, "", 4).await;
        svc.delete(delete("key-000")).await.unwrap();
        let reply = svc.count(CountRequest::default()).await.unwrap();
        assert_eq!(reply.objects, 3);
        assert_eq!(reply.key_bytes, 21);
    }

    #[test]
    fn test_status() {
        let status = service().status();
        assert_eq!(status.status, "ok");
        assert_eq!(status.replica.pid, 1);
        assert_eq!(status.replica.name, "trtl-1");
    }
}
