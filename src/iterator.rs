// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side iteration over a namespace.
//!
//! Two implementations of one [`KvIterator`] contract:
//!
//! | Iterator | Backed by | Memory | Look-behind |
//! |----------|-----------|--------|-------------|
//! | [`BatchIterator`] | paged `iter` calls | every fetched page | anywhere in the fetched pages |
//! | [`StreamingIterator`] | one `cursor` stream | previous, current, next | one step per `next` |
//!
//! The usual loop is:
//!
//! ```rust,no_run
//! # async fn example(client: std::sync::Arc<dyn trtl_replica::iterator::TrtlClient>) -> trtl_replica::Result<()> {
//! use trtl_replica::iterator::{BatchIterator, KvIterator};
//!
//! let mut iter = BatchIterator::new(client, "vasps");
//! while iter.next().await {
//!     let _key = iter.key();
//!     let _value = iter.value();
//! }
//! iter.release();
//! if let Some(err) = iter.error() {
//!     eprintln!("iteration failed: {}", err);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Once exhausted both iterators return `None` from `key()` and `value()`,
//! and a failure is kept and reported by `error()` instead of being
//! returned from `next()`.

use crate::cursor::seek_cursor;
use crate::error::{ReplicaError, Result};
use crate::transport::{MessageSink, MessageSource, TransportFuture};
use crate::trtl::{resolve_namespace, CursorRequest, IterReply, IterRequest, KvPair, TrtlService, DEFAULT_PAGE_SIZE};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pairs buffered between a cursor producer and the iterator.
pub const CURSOR_BUFFER: usize = 16;

/// Future returned by iterator moves.
pub type IterFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Client view of the iteration RPCs.
pub trait TrtlClient: Send + Sync + 'static {
    /// Fetch one page.
    fn iter(&self, req: IterRequest) -> TransportFuture<'_, IterReply>;

    /// Open a cursor. The producer stops when `cancel` fires.
    fn cursor(&self, req: CursorRequest, cancel: CancellationToken) -> TransportFuture<'_, CursorStream>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor stream
// ═══════════════════════════════════════════════════════════════════════════════

/// Receiving end of a cursor. Errors from the producer surface from `recv`.
pub struct CursorStream {
    rx: mpsc::Receiver<Result<KvPair>>,
}

/// Producing end of a cursor.
pub struct CursorSender {
    tx: Option<mpsc::Sender<Result<KvPair>>>,
}

impl CursorStream {
    pub fn channel(capacity: usize) -> (CursorSender, CursorStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (CursorSender { tx: Some(tx) }, CursorStream { rx })
    }

    /// Stop receiving; the producer's next send fails.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl MessageSource<KvPair> for CursorStream {
    fn recv(&mut self) -> TransportFuture<'_, Option<KvPair>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(pair)) => Ok(Some(pair)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }
}

impl CursorSender {
    /// Hand a terminal error to the iterator.
    pub async fn fail(&mut self, err: ReplicaError) {
        if let Some(tx) = self.tx.take() {
            if tx.send(Err(err)).await.is_err() {
                debug!("Cursor closed before the error could be delivered");
            }
        }
    }
}

impl MessageSink<KvPair> for CursorSender {
    fn send(&mut self, msg: KvPair) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| ReplicaError::transport("cursor", "send on closed cursor"))?;
            tx.send(Ok(msg))
                .await
                .map_err(|_| ReplicaError::transport("cursor", "cursor released by client"))
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-process client
// ═══════════════════════════════════════════════════════════════════════════════

/// Calls a [`TrtlService`] in the same process.
#[derive(Clone)]
pub struct LocalClient {
    service: Arc<TrtlService>,
}

impl LocalClient {
    pub fn new(service: Arc<TrtlService>) -> Self {
        Self { service }
    }
}

impl TrtlClient for LocalClient {
    fn iter(&self, req: IterRequest) -> TransportFuture<'_, IterReply> {
        Box::pin(async move { self.service.iter(req).await })
    }

    fn cursor(&self, req: CursorRequest, cancel: CancellationToken) -> TransportFuture<'_, CursorStream> {
        Box::pin(async move {
            self.service.validate_cursor(&req)?;

            let (mut tx, stream) = CursorStream::channel(CURSOR_BUFFER);
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = service.cursor(req, &mut tx) => Some(result),
                };
                match result {
                    Some(Err(e)) => tx.fail(e).await,
                    Some(Ok(_)) => {}
                    None => debug!("Cursor released by client"),
                }
            });
            Ok(stream)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Iterator contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Walks key/value pairs in key order.
pub trait KvIterator: Send {
    /// Move to the next pair. False when exhausted or on error.
    fn next(&mut self) -> IterFuture<'_>;

    /// Move back one pair.
    fn prev(&mut self) -> bool;

    /// Position at the first pair with a key at or after `key`.
    ///
    /// Only valid before the first `next`.
    fn seek<'a>(&'a mut self, key: &'a [u8]) -> IterFuture<'a>;

    /// The current pair, if positioned on one.
    fn pair(&self) -> Option<&KvPair>;

    fn key(&self) -> Option<&[u8]> {
        self.pair().map(|p| p.key.as_slice())
    }

    fn value(&self) -> Option<&[u8]> {
        self.pair().map(|p| p.value.as_slice())
    }

    /// The error that ended iteration, if any.
    fn error(&self) -> Option<&ReplicaError>;

    /// Free buffered pairs and network resources. Safe to call at any time.
    fn release(&mut self);
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchIterator
// ═══════════════════════════════════════════════════════════════════════════════

/// Materializes a namespace page by page.
///
/// Fetched pages are kept, so `prev` can walk back to the first pair.
pub struct BatchIterator {
    client: Arc<dyn TrtlClient>,
    namespace: String,
    page_size: i32,
    values: Vec<KvPair>,
    index: isize,
    next_page_token: String,
    /// An empty page is possible, so "fetched at least once" is tracked
    /// separately from `values`.
    iter_called: bool,
    err: Option<ReplicaError>,
}

impl BatchIterator {
    pub fn new(client: Arc<dyn TrtlClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            page_size: DEFAULT_PAGE_SIZE,
            values: Vec::new(),
            index: -1,
            next_page_token: String::new(),
            iter_called: false,
            err: None,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size;
        self
    }

    fn len(&self) -> isize {
        self.values.len() as isize
    }

    async fn advance(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        self.index += 1;

        if self.iter_called && self.index >= self.len() && self.next_page_token.is_empty() {
            return false;
        }
        if self.index >= 0 && self.index < self.len() {
            return true;
        }

        let mut req = IterRequest {
            namespace: self.namespace.clone(),
            ..Default::default()
        };
        req.options.page_size = self.page_size;
        req.options.page_token = self.next_page_token.clone();

        let reply = match self.client.iter(req).await {
            Ok(reply) => reply,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        };

        self.iter_called = true;
        self.values.extend(reply.values);
        self.next_page_token = reply.next_page_token;
        self.index < self.len()
    }

    async fn seek_to(&mut self, key: &[u8]) -> bool {
        if !self.values.is_empty() {
            self.err = Some(ReplicaError::FailedPrecondition(
                "cannot seek on a batch iterator after next has been called".into(),
            ));
            return false;
        }

        match seek_cursor(self.page_size, key, resolve_namespace(&self.namespace)) {
            Ok(token) => self.next_page_token = token,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        }
        self.advance().await
    }
}

impl KvIterator for BatchIterator {
    fn next(&mut self) -> IterFuture<'_> {
        Box::pin(self.advance())
    }

    fn prev(&mut self) -> bool {
        self.index -= 1;
        if self.index < 0 {
            self.index = -1;
            return false;
        }
        self.index < self.len()
    }

    fn seek<'a>(&'a mut self, key: &'a [u8]) -> IterFuture<'a> {
        Box::pin(self.seek_to(key))
    }

    fn pair(&self) -> Option<&KvPair> {
        if self.index < 0 {
            return None;
        }
        self.values.get(self.index as usize)
    }

    fn error(&self) -> Option<&ReplicaError> {
        self.err.as_ref()
    }

    fn release(&mut self) {
        self.values = Vec::new();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamingIterator
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulls one pair at a time from a cursor stream.
///
/// Only the previous, current and (after a `prev`) next pair are held.
/// The cursor is opened lazily by the first `next` or by `seek`.
pub struct StreamingIterator {
    client: Arc<dyn TrtlClient>,
    namespace: String,
    cursor: Option<CursorStream>,
    cancel: Option<CancellationToken>,
    prev: Option<KvPair>,
    current: Option<KvPair>,
    next: Option<KvPair>,
    eof: bool,
    err: Option<ReplicaError>,
}

impl StreamingIterator {
    pub fn new(client: Arc<dyn TrtlClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cursor: None,
            cancel: None,
            prev: None,
            current: None,
            next: None,
            eof: false,
            err: None,
        }
    }

    async fn open(&mut self, seek_key: Vec<u8>) {
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let req = CursorRequest {
            namespace: self.namespace.clone(),
            seek_key,
            ..Default::default()
        };
        match self.client.cursor(req, cancel).await {
            Ok(cursor) => self.cursor = Some(cursor),
            Err(e) => self.err = Some(e),
        }
    }

    async fn advance(&mut self) -> bool {
        if self.cursor.is_none() && self.err.is_none() {
            self.open(Vec::new()).await;
        }
        if self.err.is_some() {
            return false;
        }

        if let Some(next) = self.next.take() {
            self.prev = self.current.take();
            self.current = Some(next);
            return true;
        }

        if self.eof {
            return false;
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return false;
        };
        let received = cursor.recv().await;

        self.prev = self.current.take();
        match received {
            Ok(Some(pair)) => {
                self.current = Some(pair);
                true
            }
            Ok(None) => {
                self.eof = true;
                false
            }
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    async fn seek_to(&mut self, key: &[u8]) -> bool {
        if self.cursor.is_some() {
            self.err = Some(ReplicaError::FailedPrecondition(
                "cursor already initialized, cannot seek".into(),
            ));
            return false;
        }

        self.open(key.to_vec()).await;
        self.advance().await
    }
}

impl KvIterator for StreamingIterator {
    fn next(&mut self) -> IterFuture<'_> {
        Box::pin(self.advance())
    }

    /// Valid once per `next`; a second call without a `next` in between
    /// returns false and leaves the position unchanged.
    fn prev(&mut self) -> bool {
        if self.prev.is_none() {
            return false;
        }
        self.next = self.current.take();
        self.current = self.prev.take();
        true
    }

    fn seek<'a>(&'a mut self, key: &'a [u8]) -> IterFuture<'a> {
        Box::pin(self.seek_to(key))
    }

    fn pair(&self) -> Option<&KvPair> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&ReplicaError> {
        self.err.as_ref()
    }

    fn release(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.close();
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReplicaConfig, TrtlConfig};
    use crate::object::Identity;
    use crate::store::MemoryStore;
    use crate::trtl::PutRequest;

    async fn client(n: usize) -> Arc<dyn TrtlClient> {
        let store = Arc::new(MemoryStore::new(Identity::new(1, "us-east-1", "trtl-1")));
        let config = TrtlConfig {
            replica: ReplicaConfig::for_testing(1, "us-east-1"),
            ..TrtlConfig::default()
        };
        let service = Arc::new(TrtlService::new(store, &config));
        for i in 0..n {
            service
                .put(PutRequest {
                    key: format!("k{:02}", i).into_bytes(),
                    value: format!("v{}", i).into_bytes(),
                    namespace: "vasps".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        Arc::new(LocalClient::new(service))
    }

    async fn drain(iter: &mut dyn KvIterator) -> Vec<String> {
        let mut keys = Vec::new();
        while iter.next().await {
            keys.push(String::from_utf8(iter.key().unwrap().to_vec()).unwrap());
        }
        keys
    }

    #[tokio::test]
    async fn test_batch_walks_all_pages() {
        let mut iter = BatchIterator::new(client(7).await, "vasps").with_page_size(3);
        let keys = drain(&mut iter).await;
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], "k00");
        assert_eq!(keys[6], "k06");
        assert!(iter.error().is_none());
        assert!(iter.key().is_none());
        assert!(iter.value().is_none());
    }

    #[tokio::test]
    async fn test_batch_prev_within_buffer() {
        let mut iter = BatchIterator::new(client(4).await, "vasps").with_page_size(2);
        assert!(iter.next().await);
        assert!(iter.next().await);
        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k02".as_slice()));

        assert!(iter.prev());
        assert_eq!(iter.key(), Some(b"k01".as_slice()));
        assert!(iter.prev());
        assert!(!iter.prev());
        assert!(iter.key().is_none());
    }

    #[tokio::test]
    async fn test_batch_seek_at_page_boundary() {
        // k01 is the last key of the first page after seeking.
        let mut iter = BatchIterator::new(client(5).await, "vasps").with_page_size(2);
        assert!(iter.seek(b"k00").await);
        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k01".as_slice()));

        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k02".as_slice()));
        assert!(iter.error().is_none());
    }

    #[tokio::test]
    async fn test_batch_seek_after_next_is_error() {
        let mut iter = BatchIterator::new(client(3).await, "vasps");
        assert!(iter.next().await);
        assert!(!iter.seek(b"k01").await);
        assert!(matches!(iter.error(), Some(ReplicaError::FailedPrecondition(_))));
        assert!(!iter.next().await);
    }

    #[tokio::test]
    async fn test_batch_reports_server_error() {
        let mut iter = BatchIterator::new(client(0).await, "peers");
        assert!(!iter.next().await);
        assert!(matches!(iter.error(), Some(ReplicaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_streaming_walks_all() {
        let mut iter = StreamingIterator::new(client(5).await, "vasps");
        let keys = drain(&mut iter).await;
        assert_eq!(keys, vec!["k00", "k01", "k02", "k03", "k04"]);
        assert!(iter.error().is_none());
        assert!(iter.key().is_none());
        iter.release();
    }

    #[tokio::test]
    async fn test_streaming_prev_once_per_next() {
        let mut iter = StreamingIterator::new(client(3).await, "vasps");
        assert!(iter.next().await);
        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k01".as_slice()));

        assert!(iter.prev());
        assert_eq!(iter.key(), Some(b"k00".as_slice()));
        assert!(!iter.prev());

        // The buffered pair comes back before the stream is read again.
        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k01".as_slice()));
        assert!(iter.next().await);
        assert_eq!(iter.key(), Some(b"k02".as_slice()));
        assert!(!iter.next().await);
        iter.release();
    }

    #[tokio::test]
    async fn test_streaming_seek() {
        let mut iter = StreamingIterator::new(client(5).await, "vasps");
        assert!(iter.seek(b"k03").await);
        assert_eq!(iter.key(), Some(b"k03".as_slice()));
        assert!(!iter.seek(b"k01").await);
        assert!(iter.error().is_some());
        iter.release();
    }

    #[tokio::test]
    async fn test_streaming_release_before_open() {
        let mut iter = StreamingIterator::new(client(1).await, "vasps");
        iter.release();
        assert!(iter.error().is_none());
    }

    #[tokio::test]
    async fn test_streaming_release_stops_producer() {
        let mut iter = StreamingIterator::new(client(40).await, "vasps");
        assert!(iter.next().await);
        iter.release();
        // Closed receiver: buffered pairs may still drain, then the stream ends.
        let mut n = 0;
        while iter.next().await {
            n += 1;
        }
        assert!(n < 40);
    }
}
