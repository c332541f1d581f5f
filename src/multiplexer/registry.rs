use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::auth::CredentialSource;
use crate::bus::{EventBus, Subscription};
use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::snapshot::{Snapshot, SnapshotCache};
use crate::websocket::{
    Channel, Connection, ConnectionContext, ConnectionState, Envelope, Transport,
};

use super::{ContestEntry, MultiplexerBuilder, MultiplexerStats};

/// Owns every live connection and hands the event surface to consumers
pub struct ChannelMultiplexer {
    ctx: Arc<ConnectionContext>,
    runtime: Handle,
    notify: Mutex<Option<Connection>>,
    /// slug -> ContestEntry
    contests: DashMap<String, ContestEntry>,
}

impl ChannelMultiplexer {
    pub fn builder(config: RealtimeConfig) -> MultiplexerBuilder {
        MultiplexerBuilder::new(config)
    }

    /// Multiplexer with the default anonymous policy and a fresh bus.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        MultiplexerBuilder::new(config)
            .transport(transport)
            .credentials(credentials)
            .build()
    }

    pub(super) fn from_parts(ctx: Arc<ConnectionContext>, runtime: Handle) -> Self {
        Self {
            ctx,
            runtime,
            notify: Mutex::new(None),
            contests: DashMap::new(),
        }
    }

    /// Open the per-user Notify channel; no-op when it is already live
    pub fn start_notify(&self) {
        let mut notify = self.notify_slot();
        if notify.is_some() {
            return;
        }

        let connection = self.spawn(Channel::Notify, None);
        tracing::info!(connection_id = %connection.id(), "Notify channel started");
        *notify = Some(connection);
    }

    /// Tear the Notify channel down; no-op when it is not live
    pub fn stop_notify(&self) {
        if let Some(connection) = self.notify_slot().take() {
            connection.stop();
            tracing::info!(connection_id = %connection.id(), "Notify channel stopped");
        }
    }

    /// Take one reference on `slug`, opening its channel on the first one.
    ///
    /// Returns the reference count after the call.
    pub fn join_contest(&self, slug: &str) -> usize {
        let mut entry = self.contests.entry(slug.to_string()).or_insert_with(|| {
            let generation = self.snapshots().admit(slug);
            let connection = self.spawn(Channel::contest(slug), Some(generation));
            tracing::info!(contest = %slug, connection_id = %connection.id(), "Contest channel opened");
            ContestEntry {
                connection,
                refs: 0,
            }
        });
        entry.refs += 1;
        tracing::debug!(contest = %slug, refs = entry.refs, "Contest joined");
        entry.refs
    }

    /// Release one reference on `slug`, tearing its channel down and dropping
    /// its snapshot on the last one. Leaving a contest that is not joined is
    /// a no-op.
    ///
    /// Returns the reference count after the call.
    pub fn leave_contest(&self, slug: &str) -> usize {
        let mut remaining = 0;
        let removed = self.contests.remove_if_mut(slug, |_, entry| {
            entry.refs = entry.refs.saturating_sub(1);
            remaining = entry.refs;
            if remaining == 0 {
                entry.connection.stop();
                self.snapshots().evict(slug);
                true
            } else {
                false
            }
        });

        match removed {
            Some((_, entry)) => {
                tracing::info!(contest = %slug, connection_id = %entry.connection.id(), "Contest channel closed");
            }
            None => tracing::debug!(contest = %slug, refs = remaining, "Contest left"),
        }
        remaining
    }

    /// Stop every channel and forget all counts and snapshots
    pub fn stop_all(&self) {
        self.stop_notify();
        self.contests.retain(|slug, entry| {
            entry.connection.stop();
            self.snapshots().evict(slug);
            false
        });
        self.snapshots().clear();
        tracing::info!("All channels stopped");
    }

    /// Latest snapshot cached for a joined contest
    pub fn get_snapshot(&self, slug: &str) -> Option<Arc<Snapshot>> {
        self.snapshots().get(slug)
    }

    pub fn bus(&self) -> &EventBus {
        self.ctx.dispatcher.bus()
    }

    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus().on(event, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus().on_any(handler)
    }

    pub fn ref_count(&self, slug: &str) -> usize {
        self.contests.get(slug).map_or(0, |entry| entry.refs)
    }

    pub fn is_live(&self, channel: &Channel) -> bool {
        match channel {
            Channel::Notify => self.notify_slot().is_some(),
            Channel::Contest(slug) => self.contests.contains_key(slug),
        }
    }

    /// Current state of a live channel's connection
    pub fn connection_state(&self, channel: &Channel) -> Option<ConnectionState> {
        match channel {
            Channel::Notify => self.notify_slot().as_ref().map(Connection::state),
            Channel::Contest(slug) => self.contests.get(slug).map(|e| e.connection.state()),
        }
    }

    pub fn watch_state(&self, channel: &Channel) -> Option<watch::Receiver<ConnectionState>> {
        match channel {
            Channel::Notify => self.notify_slot().as_ref().map(Connection::watch_state),
            Channel::Contest(slug) => self
                .contests
                .get(slug)
                .map(|e| e.connection.watch_state()),
        }
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            notify_live: self.notify_slot().is_some(),
            contests: self
                .contests
                .iter()
                .map(|e| (e.key().clone(), e.refs))
                .collect(),
            cached_snapshots: self.snapshots().len(),
        }
    }

    fn spawn(&self, channel: Channel, generation: Option<u64>) -> Connection {
        let connection =
            Connection::spawn_admitted(channel, generation, self.ctx.clone(), &self.runtime);
        connection.start(Duration::ZERO);
        connection
    }

    fn snapshots(&self) -> &SnapshotCache {
        self.ctx.dispatcher.snapshots()
    }

    fn notify_slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.notify.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        self.stop_all();
    }
}
