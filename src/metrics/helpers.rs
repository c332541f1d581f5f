//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::websocket::{BackoffTier, Channel};

use super::{
    CONNECTIONS_OPEN, CONNECT_FAILURES_TOTAL, EVENTS_DISPATCHED_TOTAL, FRAMES_DROPPED_TOTAL,
    FRAMES_RECEIVED_TOTAL, HEARTBEATS_SENT_TOTAL, LISTENER_FAILURES_TOTAL,
    RECONNECTS_SCHEDULED_TOTAL, SNAPSHOTS_REPLACED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

fn kind(channel: &Channel) -> &'static str {
    if channel.is_notify() {
        "notify"
    } else {
        "contest"
    }
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened(channel: &Channel) {
        CONNECTIONS_OPEN.with_label_values(&[kind(channel)]).inc();
    }

    pub fn record_closed(channel: &Channel) {
        CONNECTIONS_OPEN.with_label_values(&[kind(channel)]).dec();
    }

    pub fn record_connect_failure() {
        CONNECT_FAILURES_TOTAL.inc();
    }

    pub fn record_reconnect(tier: BackoffTier) {
        RECONNECTS_SCHEDULED_TOTAL
            .with_label_values(&[tier.as_str()])
            .inc();
    }

    pub fn record_heartbeat() {
        HEARTBEATS_SENT_TOTAL.inc();
    }
}

/// Helper struct for recording inbound frame metrics
pub struct FrameMetrics;

impl FrameMetrics {
    pub fn record_received(channel: &Channel) {
        FRAMES_RECEIVED_TOTAL.with_label_values(&[kind(channel)]).inc();
    }

    pub fn record_malformed() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["malformed"]).inc();
    }

    pub fn record_duplicate() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["duplicate"]).inc();
    }

    pub fn record_dispatched() {
        EVENTS_DISPATCHED_TOTAL.inc();
    }
}

pub struct ListenerMetrics;

impl ListenerMetrics {
    pub fn record_failure() {
        LISTENER_FAILURES_TOTAL.inc();
    }
}

pub struct SnapshotMetrics;

impl SnapshotMetrics {
    pub fn record_replaced() {
        SNAPSHOTS_REPLACED_TOTAL.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_metrics() {
        let channel = Channel::contest("metrics-test");
        ConnectionMetrics::record_opened(&channel);
        ConnectionMetrics::record_closed(&channel);
        ConnectionMetrics::record_connect_failure();
        ConnectionMetrics::record_reconnect(BackoffTier::Standard);
        ConnectionMetrics::record_reconnect(BackoffTier::Extended);
        ConnectionMetrics::record_heartbeat();
        // Just verify no panics
    }

    #[test]
    fn test_frame_metrics_are_encoded() {
        FrameMetrics::record_received(&Channel::Notify);
        FrameMetrics::record_malformed();
        FrameMetrics::record_duplicate();
        FrameMetrics::record_dispatched();
        ListenerMetrics::record_failure();
        SnapshotMetrics::record_replaced();

        let text = encode_metrics().unwrap();
        assert!(text.contains("ctf_realtime_frames_dropped_total"));
        assert!(text.contains("ctf_realtime_events_dispatched_total"));
    }
}
