// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TCP server and clients.
//!
//! One listener serves both the key/value RPCs and inbound gossip. Every
//! connection speaks length-delimited bincode frames (see
//! [`crate::transport`]) and starts with a [`Request`]:
//!
//! ```text
//! client                         server
//! ──────                         ──────
//! Get/Put/.../Peers ──────────►  Reply<T>          (repeat on same connection)
//! Cursor ─────────────────────►  Reply<KvPair>*    then the server hangs up
//! Gossip ─────────────────────►  SyncMessage ⇄ SyncMessage until both close
//! ```
//!
//! A cursor ends when the server closes the connection; an `Err` reply is
//! always the last frame. Gossip hands the connection to
//! [`ReplicaService::gossip_until`] and never returns to request mode.
//!
//! Each connection holds a [`Bulkhead`] permit, sized by
//! `TrtlConfig::max_sessions`, for as long as it is open.

use crate::config::TrtlConfig;
use crate::error::{ReplicaError, Result};
use crate::gossip::{Dialer, ReplicaService, SyncMessage};
use crate::iterator::{CursorStream, TrtlClient, CURSOR_BUFFER};
use crate::peer::{Peer, PeersFilter, PeersList, PeersStatus};
use crate::resilience::Bulkhead;
use crate::transport::{frame_io, framed, read_frame, write_frame, Duplex, FrameIo, MessageSink, TransportFuture};
use crate::trtl::{
    CountReply, CountRequest, CursorRequest, DeleteRequest, GetReply, GetRequest, IterReply, IterRequest, KvPair,
    PutRequest, ServerStatus, TrtlService, WriteReply,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connect timeout for clients and the gossip dialer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Gossip,
    Get(GetRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    Iter(IterRequest),
    Cursor(CursorRequest),
    Count(CountRequest),
    Status,
    GetPeers(PeersFilter),
    AddPeers(Peer),
    RmPeers(Peer),
}

impl Request {
    fn method(&self) -> &'static str {
        match self {
            Request::Gossip => "gossip",
            Request::Get(_) => "get",
            Request::Put(_) => "put",
            Request::Delete(_) => "delete",
            Request::Iter(_) => "iter",
            Request::Cursor(_) => "cursor",
            Request::Count(_) => "count",
            Request::Status => "status",
            Request::GetPeers(_) => "get_peers",
            Request::AddPeers(_) => "add_peers",
            Request::RmPeers(_) => "rm_peers",
        }
    }
}

/// An error as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<&ReplicaError> for WireError {
    fn from(e: &ReplicaError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<WireError> for ReplicaError {
    fn from(e: WireError) -> Self {
        ReplicaError::from_wire(&e.kind, e.message)
    }
}

/// Response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply<T> {
    Ok(T),
    Err(WireError),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e.into()),
        }
    }
}

impl<T> From<Result<T>> for Reply<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => Reply::Ok(v),
            Err(e) => Reply::Err(WireError::from(&e)),
        }
    }
}

/// Bind the listener for [`Server::serve`].
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ReplicaError::transport(addr, format!("could not bind: {}", e)))
}

async fn connect(addr: &str, timeout: Duration) -> Result<FrameIo<TcpStream>> {
    let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ReplicaError::Timeout(timeout))?
        .map_err(|e| ReplicaError::transport(addr, e))?;
    if let Err(e) = socket.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "Could not set TCP_NODELAY");
    }
    Ok(frame_io(socket))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server
// ═══════════════════════════════════════════════════════════════════════════════

/// Serves key/value RPCs and gossip on one TCP listener.
#[derive(Clone)]
pub struct Server {
    trtl: Arc<TrtlService>,
    replica: Arc<ReplicaService>,
    bulkhead: Arc<Bulkhead>,
}

impl Server {
    pub fn new(config: &TrtlConfig, trtl: Arc<TrtlService>, replica: Arc<ReplicaService>) -> Self {
        Self {
            trtl,
            replica,
            bulkhead: Arc::new(Bulkhead::new(config.max_sessions)),
        }
    }

    /// Accept connections until `shutdown` flips to true.
    ///
    /// Open connections are cancelled on shutdown; gossip sessions end at
    /// their next message.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(addr = %local, max_sessions = self.bulkhead.max_concurrent(), "trtl server listening");

        let cancel = CancellationToken::new();
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            continue;
                        }
                    };

                    let server = self.clone();
                    let cancel = cancel.child_token();
                    let peer = addr.to_string();
                    tokio::spawn(async move {
                        let Ok(_permit) = server.bulkhead.acquire().await else {
                            debug!(peer = %peer, "Server closing; dropping connection");
                            return;
                        };
                        if let Err(e) = server.handle_connection(socket, &peer, cancel).await {
                            warn!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }

        cancel.cancel();
        self.bulkhead.close();
        info!(addr = %local, "trtl server stopped");
        Ok(())
    }

    async fn handle_connection(&self, socket: TcpStream, peer: &str, cancel: CancellationToken) -> Result<()> {
        let mut io = frame_io(socket);

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = read_frame::<_, Request>(&mut io, peer) => request?,
            };
            let Some(request) = request else {
                return Ok(());
            };
            debug!(peer = %peer, method = request.method(), "Request received");

            match request {
                Request::Gossip => {
                    let stream: Duplex<SyncMessage, SyncMessage> = framed(io, peer);
                    let stats = self.replica.gossip_until(stream, cancel).await?;
                    debug!(
                        peer = %peer,
                        versions = stats.versions,
                        updates = stats.updates,
                        repairs = stats.repairs,
                        "Served gossip session"
                    );
                    return Ok(());
                }
                Request::Cursor(req) => return self.stream_cursor(io, peer, req, cancel).await,
                Request::Get(req) => respond(&mut io, peer, self.trtl.get(req).await).await?,
                Request::Put(req) => respond(&mut io, peer, self.trtl.put(req).await).await?,
                Request::Delete(req) => respond(&mut io, peer, self.trtl.delete(req).await).await?,
                Request::Iter(req) => respond(&mut io, peer, self.trtl.iter(req).await).await?,
                Request::Count(req) => respond(&mut io, peer, self.trtl.count(req).await).await?,
                Request::Status => respond(&mut io, peer, Ok(self.trtl.status())).await?,
                Request::GetPeers(filter) => {
                    let result = self.replica.registry().get_peers(&filter).await;
                    respond(&mut io, peer, result).await?
                }
                Request::AddPeers(p) => respond(&mut io, peer, self.replica.registry().add_peers(p).await).await?,
                Request::RmPeers(p) => respond(&mut io, peer, self.replica.registry().rm_peers(&p).await).await?,
            }
        }
    }

    async fn stream_cursor(
        &self,
        mut io: FrameIo<TcpStream>,
        peer: &str,
        req: CursorRequest,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = {
            let mut sink = ReplySink { io: &mut io, peer };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.trtl.cursor(req, &mut sink) => result,
            }
        };

        match result {
            Ok(sent) => {
                debug!(peer = %peer, sent, "Cursor finished");
                Ok(())
            }
            Err(e) => {
                // The client may already be gone; this frame is best effort.
                let reply = Reply::<KvPair>::Err(WireError::from(&e));
                write_frame(&mut io, peer, &reply).await
            }
        }
    }
}

async fn respond<T: Serialize>(io: &mut FrameIo<TcpStream>, peer: &str, result: Result<T>) -> Result<()> {
    write_frame(io, peer, &Reply::from(result)).await
}

/// Writes cursor pairs as `Reply::Ok` frames.
struct ReplySink<'a> {
    io: &'a mut FrameIo<TcpStream>,
    peer: &'a str,
}

impl MessageSink<KvPair> for ReplySink<'_> {
    fn send(&mut self, msg: KvPair) -> TransportFuture<'_, ()> {
        Box::pin(async move { write_frame(self.io, self.peer, &Reply::Ok(msg)).await })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Client for a replica's RPCs.
///
/// Unary calls share one lazily opened connection; each cursor gets its own.
/// A transport failure drops the shared connection and the next call
/// reconnects.
pub struct TcpClient {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<FrameIo<TcpStream>>>,
}

impl TcpClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            conn: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(connect(&self.addr, self.timeout).await?);
        }
        let Some(io) = conn.as_mut() else {
            return Err(ReplicaError::Internal("connection missing after connect".into()));
        };

        match self.round_trip::<T>(io, &request).await {
            Ok(reply) => reply.into_result(),
            Err(e) => {
                *conn = None;
                Err(e)
            }
        }
    }

    async fn round_trip<T: DeserializeOwned>(&self, io: &mut FrameIo<TcpStream>, request: &Request) -> Result<Reply<T>> {
        write_frame(io, &self.addr, request).await?;
        read_frame::<_, Reply<T>>(io, &self.addr)
            .await?
            .ok_or_else(|| ReplicaError::transport(&self.addr, "connection closed before reply"))
    }

    pub async fn get(&self, req: GetRequest) -> Result<GetReply> {
        self.call(Request::Get(req)).await
    }

    pub async fn put(&self, req: PutRequest) -> Result<WriteReply> {
        self.call(Request::Put(req)).await
    }

    pub async fn delete(&self, req: DeleteRequest) -> Result<WriteReply> {
        self.call(Request::Delete(req)).await
    }

    pub async fn count(&self, req: CountRequest) -> Result<CountReply> {
        self.call(Request::Count(req)).await
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        self.call(Request::Status).await
    }

    pub async fn get_peers(&self, filter: PeersFilter) -> Result<PeersList> {
        self.call(Request::GetPeers(filter)).await
    }

    pub async fn add_peers(&self, peer: Peer) -> Result<PeersStatus> {
        self.call(Request::AddPeers(peer)).await
    }

    pub async fn rm_peers(&self, peer: Peer) -> Result<PeersStatus> {
        self.call(Request::RmPeers(peer)).await
    }
}

impl TrtlClient for TcpClient {
    fn iter(&self, req: IterRequest) -> TransportFuture<'_, IterReply> {
        Box::pin(self.call(Request::Iter(req)))
    }

    fn cursor(&self, req: CursorRequest, cancel: CancellationToken) -> TransportFuture<'_, CursorStream> {
        Box::pin(async move {
            let mut io = connect(&self.addr, self.timeout).await?;
            write_frame(&mut io, &self.addr, &Request::Cursor(req)).await?;

            let (mut tx, stream) = CursorStream::channel(CURSOR_BUFFER);
            let addr = self.addr.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = read_frame::<_, Reply<KvPair>>(&mut io, &addr) => frame,
                    };
                    match frame {
                        Ok(Some(Reply::Ok(pair))) => {
                            if tx.send(pair).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Reply::Err(e))) => {
                            tx.fail(e.into()).await;
                            break;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tx.fail(e).await;
                            break;
                        }
                    }
                }
                debug!(addr = %addr, "Cursor connection closed");
            });
            Ok(stream)
        })
    }
}

/// Dials peers over TCP for gossip.
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self { timeout })
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, peer: &'a Peer) -> TransportFuture<'a, Duplex<SyncMessage, SyncMessage>> {
        Box::pin(async move {
            let mut io = connect(&peer.addr, self.timeout).await?;
            write_frame(&mut io, &peer.addr, &Request::Gossip).await?;
            Ok(framed(io, peer.addr.clone()))
        })
    }
}
