//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Local joins and fan-out sends
//! - Bootstrap pushes on (re)connect
//! - Inbound messages by kind
//! - Sync operation outcomes
//! - Outbound permit contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `lattice_mesh_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a locally submitted join.
pub fn record_local_join() {
    counter!("lattice_mesh_local_joins_total").increment(1);
}

/// Record a fan-out send scheduled for a peer.
pub fn record_fanout_send(peer_id: &str) {
    counter!("lattice_mesh_fanout_sends_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record a full-state bootstrap push scheduled for a newly observed
/// connection.
pub fn record_bootstrap_push(peer_id: &str) {
    counter!("lattice_mesh_bootstrap_pushes_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record an inbound protocol message by kind.
pub fn record_inbound_message(kind: &'static str) {
    counter!("lattice_mesh_inbound_messages_total", "kind" => kind).increment(1);
}

/// Record a duplicate or unknown sync reply.
pub fn record_duplicate_reply(protocol: &'static str) {
    counter!("lattice_mesh_duplicate_replies_total", "protocol" => protocol).increment(1);
}

/// Record the outcome of a sync operation.
pub fn record_sync_outcome(operation: &'static str, outcome: &'static str) {
    counter!("lattice_mesh_sync_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Record a message dropped because the transport send failed.
pub fn record_send_dropped(peer_id: &str) {
    counter!("lattice_mesh_sends_dropped_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Set the number of connections currently tracked (and leased).
pub fn set_tracked_connections(count: usize) {
    gauge!("lattice_mesh_tracked_connections").set(count as f64);
}

/// Record time spent waiting for an outbound send permit.
pub fn record_permit_wait(wait: Duration) {
    histogram!("lattice_mesh_outbound_permit_wait_seconds").record(wait.as_secs_f64());
}
