//! Latest full-state snapshot per joined contest

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::metrics::SnapshotMetrics;
use crate::websocket::Envelope;

/// A full-state replacement payload for one contest
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub contest: String,
    pub envelope: Envelope,
    pub received_at: DateTime<Utc>,
}

impl Snapshot {
    /// Scoreboard rows, when the snapshot carries any
    pub fn entries(&self) -> &[Value] {
        self.envelope
            .get("entries")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    snapshot: Option<Arc<Snapshot>>,
}

/// Snapshots keyed by contest slug.
///
/// Only admitted slugs can hold a snapshot: the multiplexer admits a slug
/// when its first consumer joins and evicts it when the last one leaves, so
/// a frame that arrives after eviction is discarded. Every admission gets a
/// fresh generation; a connection passes the generation it was opened with,
/// so its late frames cannot land in a later admission of the same slug.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: DashMap<String, Slot>,
    next_generation: AtomicU64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `slug`, returning its generation. Admitting a slug that is
    /// already admitted keeps the current generation.
    pub fn admit(&self, slug: &str) -> u64 {
        self.entries
            .entry(slug.to_string())
            .or_insert_with(|| Slot {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                snapshot: None,
            })
            .generation
    }

    pub fn evict(&self, slug: &str) {
        self.entries.remove(slug);
    }

    /// Store `envelope` as the snapshot for its contest, replacing any previous
    /// one. Returns false when the envelope is not a snapshot, names no
    /// contest, the contest is not admitted, or `generation` is given and no
    /// longer matches the admission.
    pub fn replace(&self, envelope: &Envelope, generation: Option<u64>) -> bool {
        if !envelope.is_snapshot() {
            return false;
        }
        let Some(contest) = envelope.contest.as_deref() else {
            return false;
        };

        match self.entries.get_mut(contest) {
            Some(slot) if generation.is_some_and(|g| g != slot.generation) => {
                tracing::debug!(contest = %contest, "Dropping snapshot from a previous session");
                false
            }
            Some(mut slot) => {
                slot.snapshot = Some(Arc::new(Snapshot {
                    contest: contest.to_string(),
                    envelope: envelope.clone(),
                    received_at: Utc::now(),
                }));
                SnapshotMetrics::record_replaced();
                true
            }
            None => {
                tracing::debug!(contest = %contest, "Dropping snapshot for contest that is not joined");
                false
            }
        }
    }

    pub fn get(&self, slug: &str) -> Option<Arc<Snapshot>> {
        self.entries.get(slug).and_then(|slot| slot.snapshot.clone())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.snapshot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
