// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote side of a bilateral anti-entropy session.
//!
//! ```text
//! phase 1   initiator ──► recv loop
//!              CHECK    → record as seen, then compare with local:
//!                           missing      → CHECK with version zero
//!                           local later  → REPAIR
//!                           remote later → CHECK with the local version
//!              REPAIR   → apply to the local store
//!              COMPLETE → start phase 2 (once)
//!
//! phase 2   scan local namespaces, skip seen keys ──REPAIR──► initiator
//!           ...then COMPLETE and close the sender
//! ```
//!
//! Phase 1 answers through the sender's reply lane and never waits on the
//! outbound queue, so the initiator's CHECKs keep draining however many
//! replies are pending.
//!
//! Phase 1 keeps receiving after COMPLETE so that REPAIRs the initiator
//! sends in answer to phase 2 are still applied. It ends when the initiator
//! closes its side of the stream.

use super::message::{SyncMessage, SyncStatus};
use super::seen::SeenSet;
use super::sender::StreamSender;
use super::types::{Role, SessionStats};
use super::{joined, Replica};
use crate::error::{MultiError, ReplicaError, Result};
use crate::metrics;
use crate::store::{ScanRange, Scanner};
use crate::transport::{Duplex, MessageSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Serve one session opened by a remote initiator.
pub(crate) async fn serve(
    replica: Arc<Replica>,
    stream: Duplex<SyncMessage, SyncMessage>,
    cancel: CancellationToken,
) -> Result<SessionStats> {
    let (mut sink, source) = stream.into_parts();

    if !replica.config.enabled {
        // Tell the initiator before hanging up so it can log the reason.
        let reason = "anti-entropy is not enabled on this replica";
        if let Err(e) = sink.send(SyncMessage::error(None, reason)).await {
            debug!(error = %e, "Could not notify initiator");
        }
        let _ = sink.close().await;
        return Err(ReplicaError::FailedPrecondition(reason.into()));
    }

    let (sender, send_task) = StreamSender::spawn(sink);
    let seen = Arc::new(SeenSet::new());
    let updates = Arc::new(AtomicU64::new(0));

    let mut session = Session {
        replica: Arc::clone(&replica),
        sender: Arc::clone(&sender),
        seen: Arc::clone(&seen),
        updates: Arc::clone(&updates),
        cancel: cancel.clone(),
        stats: SessionStats::default(),
        phase2: None,
        errs: MultiError::new(),
    };

    session.phase1(source).await;

    let mut errs = std::mem::take(&mut session.errs);
    if let Some(handle) = session.phase2.take() {
        if let Err(e) = joined("remote phase 2", handle.await) {
            errs.push(e);
        }
    }
    // Phase 2 closes the sender itself; this covers a session that never got there.
    sender.close();
    if let Err(e) = send_task.await {
        errs.push(ReplicaError::Internal(format!("gossip sender panicked: {}", e)));
    }

    let mut stats = session.stats;
    stats.updates += updates.load(Ordering::Acquire);

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
    metrics::record_session_counts(Role::Remote.as_str(), stats.versions, stats.updates, stats.repairs);

    errs.into_result()?;
    Ok(stats)
}

struct Session {
    replica: Arc<Replica>,
    sender: Arc<StreamSender>,
    seen: Arc<SeenSet>,
    updates: Arc<AtomicU64>,
    cancel: CancellationToken,
    stats: SessionStats,
    phase2: Option<JoinHandle<Result<()>>>,
    errs: MultiError,
}

impl Session {
    #[instrument(skip_all, fields(role = "remote", phase = 1))]
    async fn phase1(&mut self, mut source: Box<dyn MessageSource<SyncMessage>>) {
        let start = Instant::now();
        trace!("Starting remote phase 1");

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Session canceled while receiving from initiator");
                    self.errs.push(ReplicaError::Shutdown);
                    break;
                }
                received = source.recv() => received,
            };

            let msg = match received {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Anti-entropy aborted early with recv error");
                    self.errs.push(e);
                    break;
                }
            };

            match msg.status {
                SyncStatus::Check => self.check(msg).await,
                SyncStatus::Repair => {
                    let Some(obj) = msg.object else {
                        warn!("REPAIR without an object");
                        continue;
                    };
                    match self.replica.apply(obj).await {
                        Ok(update) if update.applied() => self.stats.repairs += 1,
                        Ok(_) => {}
                        Err(e) => self.errs.push(e),
                    }
                }
                SyncStatus::Error => self.replica.log_remote_error(&msg),
                SyncStatus::Complete => {
                    if self.phase2.is_some() {
                        warn!("Received duplicate COMPLETE from initiator");
                        continue;
                    }
                    metrics::record_phase_latency("remote_phase1", start.elapsed());
                    debug!(versions = self.stats.versions, "Received version vectors from initiator");
                    self.phase2 = Some(tokio::spawn(phase2(
                        Arc::clone(&self.replica),
                        Arc::clone(&self.sender),
                        Arc::clone(&self.seen),
                        Arc::clone(&self.updates),
                        self.cancel.clone(),
                    )));
                }
            }
        }

        trace!("Remote phase 1 complete");
    }

    async fn check(&mut self, msg: SyncMessage) {
        if self.phase2.is_some() {
            warn!("Received CHECK after COMPLETE from initiator; ignoring");
            return;
        }
        let Some(remote) = msg.object else {
            warn!("CHECK without an object");
            return;
        };

        self.seen.add(&remote.namespace, &remote.key);
        self.stats.versions += 1;

        let local = match self.replica.store.object(&remote.namespace, &remote.key).await {
            Ok(local) => local,
            Err(e) if e.is_not_found() => {
                // Ask the initiator for its copy.
                self.sender.reply(SyncMessage::check_missing(&remote));
                return;
            }
            Err(e) => {
                warn!(
                    namespace = %remote.namespace,
                    key = %remote.key_b64(),
                    error = %e,
                    "Failed check sync on remote: could not fetch object meta"
                );
                self.sender.reply(SyncMessage::error(Some(&remote), e.to_string()));
                return;
            }
        };

        if local.version.is_later(&remote.version) {
            if self.sender.reply(SyncMessage::repair(local)) {
                self.updates.fetch_add(1, Ordering::AcqRel);
            }
        } else if remote.version.is_later(&local.version) {
            // Our version is older; the initiator answers with a REPAIR.
            self.sender.reply(SyncMessage::check(&local));
        }
    }
}

/// Push every selected object the initiator did not mention, then COMPLETE.
#[instrument(skip_all, fields(role = "remote", phase = 2))]
async fn phase2(
    replica: Arc<Replica>,
    sender: Arc<StreamSender>,
    seen: Arc<SeenSet>,
    updates: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let start = Instant::now();
    trace!("Starting remote phase 2");

    let mut errs = MultiError::new();
    let mut sent: u64 = 0;

    'namespaces: for namespace in &replica.config.replicated_namespaces {
        let range = ScanRange {
            tombstones: true,
            ..ScanRange::all()
        };
        let mut scanner = Scanner::new(Arc::clone(&replica.store), namespace.as_str(), range);

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

            if seen.contains(&obj.namespace, &obj.key) {
                continue;
            }
            if !replica.oracle.should_replicate(obj.modified) {
                continue;
            }

            if !sender.send(SyncMessage::repair(obj)).await {
                break 'namespaces;
            }
            sent += 1;
        }
    }
    updates.fetch_add(sent, Ordering::AcqRel);

    sender.send(SyncMessage::complete()).await;
    sender.close();

    metrics::record_phase_latency("remote_phase2", start.elapsed());
    debug!(objects = sent, "Objects pushed to initiator");
    trace!("Remote phase 2 complete");

    errs.into_result()
}
