use std::sync::Arc;

use tokio::runtime::Handle;

use crate::auth::CredentialSource;
use crate::bus::EventBus;
use crate::config::{AnonymousPolicy, RealtimeConfig};
use crate::error::{RealtimeError, Result};
use crate::snapshot::SnapshotCache;
use crate::websocket::{Channel, CloseHook, ConnectionContext, Transport, WsTransport};

use super::{ChannelMultiplexer, EventDispatcher};

/// Configures a [`ChannelMultiplexer`].
///
/// Defaults: WebSocket transport, no credentials, a fresh bus, and the Tokio
/// runtime current at `build` time.
pub struct MultiplexerBuilder {
    config: RealtimeConfig,
    anonymous: AnonymousPolicy,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    close_hook: Option<CloseHook>,
    bus: Option<EventBus>,
    runtime: Option<Handle>,
}

impl MultiplexerBuilder {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            anonymous: AnonymousPolicy::default(),
            transport: None,
            credentials: None,
            close_hook: None,
            bus: None,
            runtime: None,
        }
    }

    /// What to do when a contest channel connects without a token
    pub fn anonymous_policy(mut self, policy: AnonymousPolicy) -> Self {
        self.anonymous = policy;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Observe every close of an open link, with the close code when sent
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Channel, Option<u16>) + Send + Sync + 'static,
    {
        self.close_hook = Some(Arc::new(hook));
        self
    }

    /// Share an existing bus instead of creating one
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn connection tasks on `runtime`
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ChannelMultiplexer> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                RealtimeError::Runtime(format!("multiplexer needs a Tokio runtime: {}", e))
            })?,
        };

        let dispatcher = Arc::new(EventDispatcher::new(
            self.bus.unwrap_or_default(),
            Arc::new(SnapshotCache::new()),
        ));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WsTransport::new()));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(|| None::<String>));

        let mut ctx = ConnectionContext::new(
            &self.config,
            self.anonymous,
            transport,
            credentials,
            dispatcher,
        )?;
        if let Some(hook) = self.close_hook {
            ctx = ctx.with_close_hook(hook);
        }

        tracing::debug!(base_url = %ctx.base_url, "Channel multiplexer configured");
        Ok(ChannelMultiplexer::from_parts(Arc::new(ctx), runtime))
    }
}
