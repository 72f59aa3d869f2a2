//! Metrics for observability.
//!
//! Anti-entropy metrics are emitted through the `metrics` facade; the
//! embedding process decides whether and how to export them.
//!
//! # Metric Naming Convention
//!
//! Gossip metrics are prefixed with `trtl_ae_`, everything else with `trtl_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, message counts)
//!
//! # Usage
//!
//! ```rust,no_run
//! use trtl_replica::metrics;
//! use std::time::Duration;
//!
//! metrics::record_sync("trtl-2", "eu-west-1", "initiator");
//! metrics::record_phase_latency("initiator_phase1", Duration::from_millis(40));
//! ```

use crate::object::UpdateType;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an anti-entropy session with a peer.
pub fn record_sync(peer: &str, region: &str, role: &str) {
    counter!(
        "trtl_ae_syncs_total",
        "peer" => peer.to_string(),
        "region" => region.to_string(),
        "role" => role.to_string()
    )
    .increment(1);
}

/// Record the latency of a completed session (successful sessions only).
pub fn record_session_latency(peer: &str, role: &str, duration: Duration) {
    histogram!(
        "trtl_ae_session_duration_seconds",
        "peer" => peer.to_string(),
        "role" => role.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the latency of one phase worker.
pub fn record_phase_latency(phase: &str, duration: Duration) {
    histogram!("trtl_ae_phase_duration_seconds", "phase" => phase.to_string())
        .record(duration.as_secs_f64());
}

/// Per-session message counts for one role.
///
/// `versions` are CHECKs received, `updates` are REPAIRs sent to the peer,
/// `repairs` are REPAIRs applied locally.
pub fn record_session_counts(role: &str, versions: u64, updates: u64, repairs: u64) {
    let role = role.to_string();
    histogram!("trtl_ae_versions", "role" => role.clone()).record(versions as f64);
    histogram!("trtl_ae_updates", "role" => role.clone()).record(updates as f64);
    histogram!("trtl_ae_repairs", "role" => role.clone()).record(repairs as f64);

    counter!("trtl_ae_versions_total", "role" => role.clone()).increment(versions);
    counter!("trtl_ae_updates_total", "role" => role).increment(updates);
}

/// Record how a replicated object was applied.
pub fn record_update(namespace: &str, update: UpdateType) {
    match update {
        UpdateType::Stomp => counter!("trtl_ae_stomps_total", "namespace" => namespace.to_string()).increment(1),
        UpdateType::Skip => counter!("trtl_ae_skips_total", "namespace" => namespace.to_string()).increment(1),
        UpdateType::Forward => counter!("trtl_ae_forwards_total", "namespace" => namespace.to_string()).increment(1),
        UpdateType::NoChange => {}
    }
}

/// Record errors by kind (see [`crate::ReplicaError::kind`]).
pub fn record_error(kind: &str) {
    counter!("trtl_ae_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("trtl_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a key-value RPC served by this replica.
pub fn record_rpc(method: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("trtl_rpc_total", "method" => method.to_string(), "status" => status).increment(1);
}

/// Gauge for connection sessions currently being served.
pub fn set_active_sessions(count: usize) {
    gauge!("trtl_active_sessions").set(count as f64);
}

/// Gauge for replica service state.
pub fn set_replica_state(state: &str) {
    // Encoded as a number for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("trtl_replica_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed; these only check the calls don't panic.

    #[test]
    fn test_record_sync() {
        record_sync("trtl-2", "eu-west-1", "initiator");
        record_sync("", "", "remote");
    }

    #[test]
    fn test_record_latencies() {
        record_session_latency("trtl-2", "initiator", Duration::from_millis(250));
        record_phase_latency("initiator_phase1", Duration::ZERO);
        record_phase_latency("remote_phase2", Duration::from_secs(3));
    }

    #[test]
    fn test_record_session_counts() {
        record_session_counts("initiator", 100, 3, 7);
        record_session_counts("remote", 0, 0, 0);
    }

    #[test]
    fn test_record_update_all_types() {
        record_update("vasps", UpdateType::Forward);
        record_update("vasps", UpdateType::Stomp);
        record_update("vasps", UpdateType::Skip);
        record_update("vasps", UpdateType::NoChange);
    }

    #[test]
    fn test_record_error_and_retry() {
        record_error("transport");
        record_store_retry("put");
    }

    #[test]
    fn test_record_rpc() {
        record_rpc("get", true);
        record_rpc("iter", false);
        set_active_sessions(3);
    }

    #[test]
    fn test_set_replica_state_all_states() {
        set_replica_state("Created");
        set_replica_state("Running");
        set_replica_state("ShuttingDown");
        set_replica_state("Stopped");
        set_replica_state("Failed");
        // Unknown state should map to -1
        set_replica_state("Unknown");
    }
}
