use std::sync::Arc;

use crate::bus::EventBus;
use crate::metrics::FrameMetrics;
use crate::snapshot::SnapshotCache;
use crate::websocket::{Channel, Envelope};

/// Receives every deduplicated envelope from every connection
pub struct EventDispatcher {
    bus: EventBus,
    snapshots: Arc<SnapshotCache>,
}

impl EventDispatcher {
    pub fn new(bus: EventBus, snapshots: Arc<SnapshotCache>) -> Self {
        Self { bus, snapshots }
    }

    /// Update the snapshot cache (for snapshot-class events), then fan out.
    ///
    /// Envelopes arriving on a contest channel without a `contest` field are
    /// attributed to that channel's contest. `generation` is the snapshot
    /// admission the sending connection was opened with.
    pub fn dispatch(&self, channel: &Channel, mut envelope: Envelope, generation: Option<u64>) {
        if envelope.contest.is_none() {
            envelope.contest = channel.contest_slug().map(str::to_string);
        }

        if envelope.is_snapshot() {
            self.snapshots.replace(&envelope, generation);
        }

        FrameMetrics::record_dispatched();
        let delivered = self.bus.emit(&envelope);
        tracing::trace!(
            channel = %channel,
            event = %envelope.name,
            seq = ?envelope.seq,
            delivered = delivered,
            "Envelope dispatched"
        );
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }
}
