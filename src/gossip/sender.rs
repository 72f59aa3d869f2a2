// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-writer access to the send half of a gossip stream.
//!
//! Both phase workers of a session produce messages, but only one task may
//! write to the stream. Scan workers enqueue on a bounded channel; receive
//! loops answer through an unbounded reply lane so they never wait on the
//! queue while the peer is waiting on them.
//!
//! ```text
//! scan worker ──► [queue: 8]  ──┐
//!                               ├──► sender task ──► sink
//! recv loop   ──► [replies]   ──┘   (replies first)
//! ```
//!
//! Replies are at most one per received message, so the reply lane is
//! bounded by what the peer sends in one session.
//!
//! If a network send fails the sender stops accepting messages
//! (`send()` returns false) but keeps draining both lanes so a producer
//! blocked on a full queue is released. Once [`StreamSender::close`] has been
//! called and the last queued message is handled, the task closes the sink.

use super::message::SyncMessage;
use crate::transport::MessageSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the outgoing queue.
pub const STREAM_BUFFER: usize = 8;

struct Lanes {
    queue: mpsc::Sender<SyncMessage>,
    replies: mpsc::UnboundedSender<SyncMessage>,
}

pub struct StreamSender {
    lanes: Mutex<Option<Lanes>>,
    ok: Arc<AtomicBool>,
}

impl StreamSender {
    /// Start the sender task over `sink`.
    pub fn spawn(sink: Box<dyn MessageSink<SyncMessage>>) -> (Arc<Self>, JoinHandle<()>) {
        let (queue, queue_rx) = mpsc::channel(STREAM_BUFFER);
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let ok = Arc::new(AtomicBool::new(true));

        let sender = Arc::new(Self {
            lanes: Mutex::new(Some(Lanes { queue, replies })),
            ok: Arc::clone(&ok),
        });
        let handle = tokio::spawn(run(queue_rx, replies_rx, sink, ok));
        (sender, handle)
    }

    /// Queue a message from a scan worker, waiting while the queue is full.
    /// False means the stream has failed or was closed and the caller
    /// should stop producing.
    ///
    /// True does not mean the message reached the peer.
    pub async fn send(&self, msg: SyncMessage) -> bool {
        if !self.ok() {
            return false;
        }

        let queue = match self.lanes.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(lanes) => lanes.queue.clone(),
            None => return false,
        };
        queue.send(msg).await.is_ok()
    }

    /// Queue an answer to a received message without waiting.
    ///
    /// Used by receive loops. Replies go out ahead of queued scan messages,
    /// so a reply queued before a COMPLETE on the scan lane is sent first.
    pub fn reply(&self, msg: SyncMessage) -> bool {
        if !self.ok() {
            return false;
        }

        match self.lanes.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(lanes) => lanes.replies.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn ok(&self) -> bool {
        self.ok.load(Ordering::Acquire)
    }

    /// Stop accepting messages and let the task finish both lanes.
    ///
    /// Called once by the worker that owns the end of the session.
    pub fn close(&self) {
        self.ok.store(false, Ordering::Release);
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

async fn run(
    mut queue: mpsc::Receiver<SyncMessage>,
    mut replies: mpsc::UnboundedReceiver<SyncMessage>,
    mut sink: Box<dyn MessageSink<SyncMessage>>,
    ok: Arc<AtomicBool>,
) {
    let mut failed = false;

    loop {
        let msg = tokio::select! {
            biased;

            Some(msg) = replies.recv() => msg,
            Some(msg) = queue.recv() => msg,
            else => break,
        };

        if failed {
            trace!(status = %msg.status, "Dropped sync message (not sent)");
            continue;
        }

        trace!(status = %msg.status, "Sending sync");
        if let Err(e) = sink.send(msg).await {
            warn!(error = %e, "Could not send gossip message to peer");
            failed = true;
            ok.store(false, Ordering::Release);
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Could not close gossip stream");
    }
}
