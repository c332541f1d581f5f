//! In-process publish/subscribe fan-out of decoded envelopes.
//!
//! Listeners register per event name with [`EventBus::on`] or for every
//! event with [`EventBus::on_any`]. A listener that returns an error or
//! panics is logged and skipped; the remaining listeners still run and
//! [`EventBus::emit`] never fails.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::metrics::ListenerMetrics;
use crate::websocket::Envelope;

/// Listener callback
pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

type ListenerId = u64;

#[derive(Default)]
struct Registry {
    named: HashMap<String, Vec<(ListenerId, Handler)>>,
    wildcard: Vec<(ListenerId, Handler)>,
}

struct BusInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to one bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for envelopes named `event`
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.next_id();
        if let Ok(mut registry) = self.inner.registry.write() {
            registry
                .named
                .entry(event.clone())
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Subscription::new(&self.inner, Some(event), id)
    }

    /// Register `handler` for every envelope
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        if let Ok(mut registry) = self.inner.registry.write() {
            registry.wildcard.push((id, Arc::new(handler)));
        }
        Subscription::new(&self.inner, None, id)
    }

    /// Deliver `envelope` to named listeners, then to wildcard listeners.
    ///
    /// Returns the number of listeners that completed successfully.
    pub fn emit(&self, envelope: &Envelope) -> usize {
        // Snapshot the lists so listeners may (un)subscribe while running
        let (named, wildcard) = match self.inner.registry.read() {
            Ok(registry) => (
                registry
                    .named
                    .get(&envelope.name)
                    .cloned()
                    .unwrap_or_default(),
                registry.wildcard.clone(),
            ),
            Err(_) => return 0,
        };

        named
            .iter()
            .chain(wildcard.iter())
            .filter(|(_, handler)| invoke(handler, envelope))
            .count()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .registry
            .read()
            .map(|r| r.named.get(event).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn wildcard_count(&self) -> usize {
        self.inner
            .registry
            .read()
            .map(|r| r.wildcard.len())
            .unwrap_or(0)
    }

    fn next_id(&self) -> ListenerId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke(handler: &Handler, envelope: &Envelope) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            ListenerMetrics::record_failure();
            tracing::warn!(event = %envelope.name, error = %e, "Listener failed");
            false
        }
        Err(_) => {
            ListenerMetrics::record_failure();
            tracing::warn!(event = %envelope.name, "Listener panicked");
            false
        }
    }
}

/// Capability to remove one registration.
///
/// Dropping it does not unsubscribe.
pub struct Subscription {
    bus: Weak<BusInner>,
    event: Option<String>,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    fn new(bus: &Arc<BusInner>, event: Option<String>, id: ListenerId) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            event,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove the registration. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let Ok(mut registry) = bus.registry.write() else {
            return;
        };

        match &self.event {
            Some(event) => {
                if let Some(list) = registry.named.get_mut(event) {
                    list.retain(|(id, _)| *id != self.id);
                    if list.is_empty() {
                        registry.named.remove(event);
                    }
                }
            }
            None => registry.wildcard.retain(|(id, _)| *id != self.id),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
