// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message streams between replicas.
//!
//! A session is a [`Duplex`]: one half that sends typed messages and one
//! half that receives them. The halves are owned by different tasks, which
//! is what lets the gossip phases receive on one worker while a dedicated
//! sender task writes on another.
//!
//! Two implementations:
//!
//! - [`channel`]/[`duplex`]: bounded tokio channels, for in-process replicas
//!   and tests.
//! - [`framed`]: length-delimited frames over any `AsyncRead + AsyncWrite`
//!   (normally a `TcpStream`), each frame a bincode-encoded message.
//!
//! `recv()` returning `Ok(None)` is a clean end of stream, never an error.

use crate::error::{ReplicaError, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Sending half of a stream. Only one task may send at a time.
pub trait MessageSink<T>: Send {
    fn send(&mut self, msg: T) -> TransportFuture<'_, ()>;

    /// Close the send side; the peer's `recv` then returns `None`.
    fn close(&mut self) -> TransportFuture<'_, ()>;
}

/// Receiving half of a stream.
pub trait MessageSource<T>: Send {
    /// Next message, or `None` once the peer closed its send side.
    fn recv(&mut self) -> TransportFuture<'_, Option<T>>;
}

/// Both halves of one stream.
pub struct Duplex<S, R> {
    pub sink: Box<dyn MessageSink<S>>,
    pub source: Box<dyn MessageSource<R>>,
}

impl<S, R> Duplex<S, R> {
    pub fn new(sink: Box<dyn MessageSink<S>>, source: Box<dyn MessageSource<R>>) -> Self {
        Self { sink, source }
    }

    pub fn into_parts(self) -> (Box<dyn MessageSink<S>>, Box<dyn MessageSource<R>>) {
        (self.sink, self.source)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory channels
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ChannelSink<T> {
    tx: Option<mpsc::Sender<T>>,
}

pub struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

/// A one-directional in-memory stream.
pub fn channel<T: Send + 'static>(capacity: usize) -> (ChannelSink<T>, ChannelSource<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

/// Two connected in-memory duplex streams.
pub fn duplex<A, B>(capacity: usize) -> (Duplex<A, B>, Duplex<B, A>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let (a_tx, a_rx) = channel::<A>(capacity);
    let (b_tx, b_rx) = channel::<B>(capacity);
    (
        Duplex::new(Box::new(a_tx), Box::new(b_rx)),
        Duplex::new(Box::new(b_tx), Box::new(a_rx)),
    )
}

impl<T: Send + 'static> MessageSink<T> for ChannelSink<T> {
    fn send(&mut self, msg: T) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| ReplicaError::transport("local", "send on closed stream"))?;
            tx.send(msg)
                .await
                .map_err(|_| ReplicaError::transport("local", "stream receiver dropped"))
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

impl<T: Send + 'static> MessageSource<T> for ChannelSource<T> {
    fn recv(&mut self) -> TransportFuture<'_, Option<T>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Length-delimited frames
// ═══════════════════════════════════════════════════════════════════════════════

/// A raw framed connection, before it is split into typed halves.
pub type FrameIo<Io> = Framed<Io, LengthDelimitedCodec>;

/// Wrap an IO object in the frame codec.
pub fn frame_io<Io>(io: Io) -> FrameIo<Io>
where
    Io: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(io, codec)
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode<T: DeserializeOwned>(frame: &BytesMut) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}

/// Send one message on an unsplit framed connection.
pub async fn write_frame<Io, T>(io: &mut FrameIo<Io>, peer: &str, msg: &T) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(msg)?;
    io.send(frame).await.map_err(|e| ReplicaError::transport(peer, e))
}

/// Receive one message on an unsplit framed connection.
pub async fn read_frame<Io, T>(io: &mut FrameIo<Io>, peer: &str) -> Result<Option<T>>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match io.next().await {
        None => Ok(None),
        Some(Ok(frame)) => Ok(Some(decode(&frame)?)),
        Some(Err(e)) => Err(ReplicaError::transport(peer, e)),
    }
}

pub struct FramedSink<Io, T> {
    inner: SplitSink<FrameIo<Io>, Bytes>,
    peer: String,
    _msg: PhantomData<fn(T)>,
}

pub struct FramedSource<Io, T> {
    inner: SplitStream<FrameIo<Io>>,
    peer: String,
    _msg: PhantomData<fn() -> T>,
}

/// Split a framed connection into typed halves.
pub fn framed<Io, S, R>(io: FrameIo<Io>, peer: impl Into<String>) -> Duplex<S, R>
where
    Io: AsyncRead + AsyncWrite + Send + 'static,
    S: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    let peer = peer.into();
    let (sink, stream) = io.split();
    Duplex::new(
        Box::new(FramedSink {
            inner: sink,
            peer: peer.clone(),
            _msg: PhantomData,
        }),
        Box::new(FramedSource {
            inner: stream,
            peer,
            _msg: PhantomData,
        }),
    )
}

impl<Io, T> MessageSink<T> for FramedSink<Io, T>
where
    Io: AsyncRead + AsyncWrite + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn send(&mut self, msg: T) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let frame = encode(&msg)?;
            self.inner
                .send(frame)
                .await
                .map_err(|e| ReplicaError::transport(self.peer.clone(), e))
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .close()
                .await
                .map_err(|e| ReplicaError::transport(self.peer.clone(), e))
        })
    }
}

impl<Io, T> MessageSource<T> for FramedSource<Io, T>
where
    Io: AsyncRead + AsyncWrite + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    fn recv(&mut self) -> TransportFuture<'_, Option<T>> {
        Box::pin(async move {
            match self.inner.next().await {
                None => Ok(None),
                Some(Ok(frame)) => Ok(Some(decode(&frame)?)),
                Some(Err(e)) => Err(ReplicaError::transport(self.peer.clone(), e)),
            }
        })
    }
}
