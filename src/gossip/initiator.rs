// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initiator side of a bilateral anti-entropy session.
//!
//! # Workers
//!
//! ```text
//! phase 1 (pull)   scan local namespaces ──CHECK──► sender ──► remote
//!                  ...then COMPLETE
//!
//! phase 2 (push)   remote ──► recv loop
//!                     CHECK    → REPAIR if the local version is later
//!                     REPAIR   → apply to the local store
//!                     ERROR    → log
//!                     COMPLETE → done, close the sender
//!
//! sender           drains the queue onto the stream, then closes it
//! ```
//!
//! Phase 1 and phase 2 run concurrently. Phase 2 answers through the
//! sender's reply lane so it keeps receiving while phase 1 waits on the
//! queue. The session is bounded by the
//! replica's session timeout; when it expires the workers are cancelled and
//! the session fails with `Timeout`.

use super::message::{SyncMessage, SyncStatus};
use super::sender::StreamSender;
use super::types::{Role, SessionStats};
use super::{joined, Replica};
use crate::error::{MultiError, ReplicaError, Result};
use crate::metrics;
use crate::store::{ScanRange, Scanner};
use crate::transport::{Duplex, MessageSource};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Run one session over an already opened stream.
pub(crate) async fn run(
    replica: Arc<Replica>,
    stream: Duplex<SyncMessage, SyncMessage>,
    timeout: Duration,
) -> Result<SessionStats> {
    let (sink, source) = stream.into_parts();
    let (sender, send_task) = StreamSender::spawn(sink);
    let cancel = CancellationToken::new();

    let deadline = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        }
    });

    let pull = tokio::spawn(phase1(Arc::clone(&replica), Arc::clone(&sender), cancel.clone()));
    let push = tokio::spawn(phase2(Arc::clone(&replica), Arc::clone(&sender), source, cancel.clone()));

    let (pull, push) = tokio::join!(pull, push);
    // Phase 2 closes the sender on every exit path; this covers a panic.
    sender.close();
    let sent = send_task.await;
    deadline.abort();

    if cancel.is_cancelled() {
        return Err(ReplicaError::Timeout(timeout));
    }

    let mut errs = MultiError::new();
    if let Err(e) = joined("initiator phase 1", pull) {
        errs.push(e);
    }
    let stats = match joined("initiator phase 2", push) {
        Ok(stats) => stats,
        Err(e) => {
            errs.push(e);
            SessionStats::default()
        }
    };
    if let Err(e) = sent {
        errs.push(ReplicaError::Internal(format!("gossip sender panicked: {}", e)));
    }

    errs.into_result()?;
    Ok(stats)
}

/// Send a CHECK for every selected local object, then COMPLETE.
#[instrument(skip_all, fields(role = "initiator", phase = 1))]
async fn phase1(replica: Arc<Replica>, sender: Arc<StreamSender>, cancel: CancellationToken) -> Result<()> {
    let start = Instant::now();
    trace!("Starting initiator phase 1");

    let mut errs = MultiError::new();
    let mut versions: u64 = 0;
    let mut namespaces: u64 = 0;

    'namespaces: for namespace in &replica.config.replicated_namespaces {
        let range = ScanRange {
            tombstones: true,
            ..ScanRange::all()
        };
        let mut scanner = Scanner::new(Arc::clone(&replica.store), namespace.as_str(), range);
        trace!(namespace = %namespace, "Sending namespace");

        loop {
            if cancel.is_cancelled() {
                break 'namespaces;
            }

            let obj = match scanner.next().await {
                Ok(Some(obj)) => obj,
                Ok(None) => break,
                Err(e) => {
                    // Report and keep going; one bad object must not hold back the rest.
                    error!(namespace = %namespace, error = %e, "Could not read object while scanning namespace");
                    errs.push(e);
                    continue;
                }
            };

            if !replica.oracle.should_replicate(obj.modified) {
                continue;
            }

            if !sender.send(SyncMessage::check(&obj)).await {
                break 'namespaces;
            }
            versions += 1;
        }
        namespaces += 1;
    }

    sender.send(SyncMessage::complete()).await;
    trace!("Initiator phase 1 complete");

    metrics::record_phase_latency("initiator_phase1", start.elapsed());
    debug!(versions, namespaces, "Version vectors sent to remote peer");

    errs.into_result()
}

/// Answer the remote until it sends COMPLETE.
#[instrument(skip_all, fields(role = "initiator", phase = 2))]
async fn phase2(
    replica: Arc<Replica>,
    sender: Arc<StreamSender>,
    source: Box<dyn MessageSource<SyncMessage>>,
    cancel: CancellationToken,
) -> Result<SessionStats> {
    trace!("Starting initiator phase 2");
    let result = receive(&replica, &sender, source, &cancel).await;

    // No more messages from this side once the remote is done (or on error).
    sender.close();
    result
}

async fn receive(
    replica: &Replica,
    sender: &StreamSender,
    mut source: Box<dyn MessageSource<SyncMessage>>,
    cancel: &CancellationToken,
) -> Result<SessionStats> {
    let mut stats = SessionStats::default();
    let mut errs = MultiError::new();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session canceled while receiving from remote");
                return Err(ReplicaError::Shutdown);
            }
            received = source.recv() => received,
        };

        let msg = match received {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                return Err(ReplicaError::Protocol("remote closed the stream before COMPLETE".into()));
            }
            Err(e) => {
                error!(error = %e, "Anti-entropy aborted early with recv error");
                return Err(e);
            }
        };

        match msg.status {
            SyncStatus::Check => {
                stats.versions += 1;
                let Some(remote) = msg.object else {
                    warn!("CHECK without an object");
                    continue;
                };

                let local = match replica.store.object(&remote.namespace, &remote.key).await {
                    Ok(local) => local,
                    Err(e) => {
                        // Never bounce a CHECK back from the initiator, even on not found.
                        warn!(
                            namespace = %remote.namespace,
                            key = %remote.key_b64(),
                            error = %e,
                            "Failed check sync on initiator: could not fetch object meta"
                        );
                        sender.reply(SyncMessage::error(Some(&remote), e.to_string()));
                        continue;
                    }
                };

                if local.version.is_later(&remote.version) && sender.reply(SyncMessage::repair(local)) {
                    stats.updates += 1;
                }
            }

            SyncStatus::Repair => {
                let Some(obj) = msg.object else {
                    warn!("REPAIR without an object");
                    continue;
                };
                match replica.apply(obj).await {
                    Ok(update) if update.applied() => stats.repairs += 1,
                    Ok(_) => {}
                    Err(e) => errs.push(e),
                }
            }

            SyncStatus::Error => replica.log_remote_error(&msg),

            SyncStatus::Complete => {
                debug!(versions = stats.versions, "Received version vectors from remote peer");
                if stats.synchronized() {
                    replica.clock.synchronized_now();
                    info!(
                        local_repairs = stats.repairs,
                        remote_updates = stats.updates,
                        versions = stats.versions,
                        "Anti-entropy synchronization complete"
                    );
                } else {
                    debug!("Anti-entropy complete with no synchronization");
                }

                metrics::record_session_counts(Role::Initiator.as_str(), stats.versions, stats.updates, stats.repairs);
                trace!("Initiator phase 2 complete");
                break;
            }
        }
    }

    errs.into_result()?;
    Ok(stats)
}
