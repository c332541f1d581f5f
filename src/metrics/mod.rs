//! Prometheus metrics for the real-time client.
//!
//! - Connection metrics (open links, reconnects by back-off tier, heartbeats)
//! - Frame metrics (received, dropped by reason, dispatched)
//! - Listener and snapshot metrics

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, FrameMetrics, ListenerMetrics, SnapshotMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, IntCounter,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ctf_realtime";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Currently open links by channel kind
    pub static ref CONNECTIONS_OPEN: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_connections_open", METRIC_PREFIX),
        "Number of open real-time links",
        &["kind"]
    ).unwrap();

    /// Reconnects scheduled by back-off tier
    pub static ref RECONNECTS_SCHEDULED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_reconnects_scheduled_total", METRIC_PREFIX),
        "Total reconnect attempts scheduled",
        &["tier"]
    ).unwrap();

    /// Failed connect attempts (handshake or network)
    pub static ref CONNECT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connect_failures_total", METRIC_PREFIX),
        "Total failed connect attempts"
    ).unwrap();

    /// Keepalive frames sent
    pub static ref HEARTBEATS_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeats_sent_total", METRIC_PREFIX),
        "Total keepalive pings sent"
    ).unwrap();

    // ============================================================================
    // Frame Metrics
    // ============================================================================

    /// Inbound text frames by channel kind
    pub static ref FRAMES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_received_total", METRIC_PREFIX),
        "Total inbound frames",
        &["kind"]
    ).unwrap();

    /// Inbound frames dropped by reason (malformed, duplicate)
    pub static ref FRAMES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_dropped_total", METRIC_PREFIX),
        "Total inbound frames dropped before dispatch",
        &["reason"]
    ).unwrap();

    /// Envelopes handed to the event bus
    pub static ref EVENTS_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_dispatched_total", METRIC_PREFIX),
        "Total envelopes dispatched to listeners"
    ).unwrap();

    // ============================================================================
    // Listener / Snapshot Metrics
    // ============================================================================

    /// Listener invocations that returned an error or panicked
    pub static ref LISTENER_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_listener_failures_total", METRIC_PREFIX),
        "Total listener invocations that failed"
    ).unwrap();

    /// Snapshots stored in the cache
    pub static ref SNAPSHOTS_REPLACED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_snapshots_replaced_total", METRIC_PREFIX),
        "Total snapshot replacements"
    ).unwrap();
}
