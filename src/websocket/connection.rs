//! One resilient duplex link per channel.
//!
//! A [`Connection`] is a handle to a background task that owns the link:
//!
//! - connects to `{base}{channel path}?token={bearer}`, re-reading the token
//!   on every attempt
//! - sends `{"type":"ping"}` every heartbeat interval while open
//! - parses inbound frames, drops malformed ones and replays (`seq` not
//!   greater than the last one seen for the same event name)
//! - on close, runs the close hook and reconnects after the standard or the
//!   extended delay depending on the close code
//!
//! The task keeps reconnecting until [`Connection::stop`] is called or the
//! handle is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;
use url::Url;
use uuid::Uuid;

use crate::auth::{resolve_token, CredentialSource};
use crate::config::{AnonymousPolicy, RealtimeConfig};
use crate::error::{RealtimeError, Result};
use crate::metrics::{ConnectionMetrics, FrameMetrics};
use crate::multiplexer::EventDispatcher;

use super::backoff::{BackoffTier, ReconnectPolicy};
use super::channel::Channel;
use super::message::{ClientMessage, Envelope};
use super::transport::{Link, LinkEvent, Transport};

/// Called with the channel and close code whenever an open link closes
pub type CloseHook = Arc<dyn Fn(&Channel, Option<u16>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a (re)connect attempt
    Idle,
    Connecting,
    Open,
    Closing,
    /// Terminal; entered only through `stop`
    Stopped,
}

/// Everything a connection task needs besides its channel
pub struct ConnectionContext {
    pub base_url: Url,
    pub heartbeat_interval: Duration,
    pub policy: ReconnectPolicy,
    pub anonymous: AnonymousPolicy,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialSource>,
    pub dispatcher: Arc<EventDispatcher>,
    pub close_hook: Option<CloseHook>,
}

impl ConnectionContext {
    pub fn new(
        config: &RealtimeConfig,
        anonymous: AnonymousPolicy,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self> {
        let mut base_url = config.base_url()?;
        let ws_scheme = match base_url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = ws_scheme {
            base_url.set_scheme(scheme).map_err(|_| {
                RealtimeError::InvalidUrl(format!("cannot use {} as websocket address", base_url))
            })?;
        }

        Ok(Self {
            base_url,
            heartbeat_interval: config.heartbeat_interval(),
            policy: ReconnectPolicy::from_config(config),
            anonymous,
            transport,
            credentials,
            dispatcher,
            close_hook: None,
        })
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.close_hook = Some(hook);
        self
    }

    /// Full address for `channel`, with the token as query parameter.
    ///
    /// The contest slug is percent-encoded as one path segment, so it can
    /// never address anything outside `/ws/contests/`.
    pub fn channel_url(&self, channel: &Channel, token: Option<&str>) -> Result<Url> {
        if !channel.is_addressable() {
            return Err(RealtimeError::InvalidUrl(format!(
                "{} is not a valid channel",
                channel
            )));
        }

        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| RealtimeError::InvalidUrl(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(channel.segments())
            .push("");
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

enum ConnCmd {
    Start { delay: Duration },
    Stop,
}

/// Handle to one channel's connection task
pub struct Connection {
    id: Uuid,
    channel: Channel,
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    stopped: Arc<AtomicBool>,
    state: watch::Receiver<ConnectionState>,
    _task: JoinHandle<()>,
}

impl Connection {
    /// Spawn an idle connection task on `runtime`; call [`start`](Self::start)
    /// to connect.
    pub fn spawn(channel: Channel, ctx: Arc<ConnectionContext>, runtime: &Handle) -> Self {
        Self::spawn_admitted(channel, None, ctx, runtime)
    }

    /// Like [`spawn`](Self::spawn), for a contest whose snapshot slot was
    /// admitted with `generation`. Snapshots from this connection only ever
    /// land in that admission.
    pub fn spawn_admitted(
        channel: Channel,
        generation: Option<u64>,
        ctx: Arc<ConnectionContext>,
        runtime: &Handle,
    ) -> Self {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let stopped = Arc::new(AtomicBool::new(false));

        let task = ConnectionTask {
            channel: channel.clone(),
            ctx,
            cmd_rx,
            stopped: stopped.clone(),
            state: state_tx,
            seqs: SeqTracker::default(),
            generation,
        };
        let span = tracing::info_span!("realtime.connection", channel = %channel, connection_id = %id);
        let handle = runtime.spawn(task.run().instrument(span));

        Self {
            id,
            channel,
            cmd_tx,
            stopped,
            state: state_rx,
            _task: handle,
        }
    }

    /// Schedule a connect attempt after `initial_delay`, replacing any
    /// pending reconnect. Ignored while connecting or open.
    pub fn start(&self, initial_delay: Duration) {
        if self.is_stopped() {
            return;
        }
        let _ = self.cmd_tx.send(ConnCmd::Start {
            delay: initial_delay,
        });
    }

    /// Stop for good. Idempotent.
    ///
    /// The task dispatches no frame it reads after this call. A frame already
    /// being dispatched on another worker thread may still reach listeners;
    /// its snapshot never outlives the admission the connection was opened
    /// with.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(ConnCmd::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Last seen sequence number per event name
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: HashMap<String, u64>,
}

impl SeqTracker {
    /// Record `seq` for `event`; false when it is not newer than the last one
    pub fn accept(&mut self, event: &str, seq: u64) -> bool {
        match self.last.get_mut(event) {
            Some(last) if seq <= *last => false,
            Some(last) => {
                *last = seq;
                true
            }
            None => {
                self.last.insert(event.to_string(), seq);
                true
            }
        }
    }

    pub fn last(&self, event: &str) -> Option<u64> {
        self.last.get(event).copied()
    }
}

enum Attempt {
    Opened(Box<dyn Link>),
    Failed(BackoffTier),
    Stopped,
}

enum Served {
    Closed(Option<u16>),
    Stopped,
}

struct ConnectionTask {
    channel: Channel,
    ctx: Arc<ConnectionContext>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    stopped: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
    seqs: SeqTracker,
    generation: Option<u64>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut reconnect_at: Option<Instant> = None;

        loop {
            let timer = async move {
                match reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Start { delay }) => {
                        reconnect_at = Some(Instant::now() + delay);
                        continue;
                    }
                    Some(ConnCmd::Stop) | None => break,
                },
                _ = timer => {}
            }

            if self.is_stopped() {
                break;
            }

            let tier = match self.connect().await {
                Attempt::Opened(link) => match self.serve(link).await {
                    Served::Closed(code) => self.ctx.policy.classify(code),
                    Served::Stopped => break,
                },
                Attempt::Failed(tier) => tier,
                Attempt::Stopped => break,
            };

            let delay = self.schedule(tier);
            reconnect_at = Some(Instant::now() + delay);
        }

        self.stopped.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Stopped);
        tracing::info!("Connection stopped");
    }

    async fn connect(&mut self) -> Attempt {
        self.state.send_replace(ConnectionState::Connecting);

        let token = match resolve_token(
            self.ctx.credentials.as_ref(),
            &self.channel,
            self.ctx.anonymous,
        ) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "No credential available, connect attempt skipped");
                self.state.send_replace(ConnectionState::Idle);
                return Attempt::Failed(BackoffTier::Extended);
            }
        };

        let url = match self.ctx.channel_url(&self.channel, token.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot address channel, connect attempt skipped");
                self.state.send_replace(ConnectionState::Idle);
                return Attempt::Failed(BackoffTier::Extended);
            }
        };
        let transport = self.ctx.transport.clone();
        let connecting = transport.connect(&url);
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    // already connecting
                    Some(ConnCmd::Start { .. }) => continue,
                    Some(ConnCmd::Stop) | None => return Attempt::Stopped,
                },
                res = &mut connecting => break res,
            }
        };

        match result {
            Ok(mut link) => {
                if self.is_stopped() {
                    link.close().await;
                    return Attempt::Stopped;
                }
                self.state.send_replace(ConnectionState::Open);
                ConnectionMetrics::record_opened(&self.channel);
                tracing::info!(path = %url.path(), "Connection established");
                Attempt::Opened(link)
            }
            Err(e) => {
                ConnectionMetrics::record_connect_failure();
                tracing::warn!(error = %e, "Connect attempt failed");
                self.state.send_replace(ConnectionState::Idle);
                let tier = match e {
                    RealtimeError::HandshakeRejected { status } => {
                        self.ctx.policy.classify_handshake(status)
                    }
                    _ => BackoffTier::Standard,
                };
                Attempt::Failed(tier)
            }
        }
    }

    async fn serve(&mut self, mut link: Box<dyn Link>) -> Served {
        let interval = self.ctx.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping = ClientMessage::Ping
            .to_json()
            .unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string());

        let outcome = loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Start { .. }) => {
                        tracing::debug!("Start ignored, link already open");
                    }
                    Some(ConnCmd::Stop) | None => break Served::Stopped,
                },
                event = link.next_event() => match event {
                    LinkEvent::Text(text) => self.handle_frame(&text),
                    LinkEvent::Closed(code) => break Served::Closed(code),
                    LinkEvent::Error(e) => {
                        tracing::warn!(error = %e, "Link error");
                        break Served::Closed(None);
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = link.send_text(ping.clone()).await {
                        tracing::warn!(error = %e, "Heartbeat send failed");
                        break Served::Closed(None);
                    }
                    ConnectionMetrics::record_heartbeat();
                }
            }
        };

        self.state.send_replace(ConnectionState::Closing);
        ConnectionMetrics::record_closed(&self.channel);
        link.close().await;
        drop(link);

        if let Served::Closed(code) = outcome {
            tracing::info!(close_code = ?code, "Connection closed");
            if let Some(hook) = &self.ctx.close_hook {
                hook(&self.channel, code);
            }
        }
        outcome
    }

    fn handle_frame(&mut self, text: &str) {
        FrameMetrics::record_received(&self.channel);

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                FrameMetrics::record_malformed();
                tracing::debug!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        if envelope.is_pong() {
            return;
        }

        if let Some(seq) = envelope.seq {
            if !self.seqs.accept(&envelope.name, seq) {
                FrameMetrics::record_duplicate();
                tracing::debug!(
                    event = %envelope.name,
                    seq = seq,
                    last_seq = ?self.seqs.last(&envelope.name),
                    "Dropping replayed frame"
                );
                return;
            }
        }

        if self.is_stopped() {
            return;
        }
        self.ctx.dispatcher.dispatch(&self.channel, envelope, self.generation);
    }

    fn schedule(&self, tier: BackoffTier) -> Duration {
        let delay = self.ctx.policy.delay(tier);
        ConnectionMetrics::record_reconnect(tier);
        self.state.send_replace(ConnectionState::Idle);
        tracing::info!(
            tier = tier.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        delay
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
