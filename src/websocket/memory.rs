//! In-process transport for tests and local development
//!
//! Every successful `connect` hands a [`MemoryPeer`] to whoever holds the
//! receiver returned by [`MemoryTransport::new`]. The peer plays the server:
//! it pushes frames, closes the link with a code, and reads what the client
//! sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{RealtimeError, Result};

use super::transport::{Link, LinkEvent, Transport};

/// Scripted outcome for an upcoming connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Network-level failure
    Unreachable,
    /// Handshake answered with an HTTP status
    Rejected(u16),
}

pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures: Mutex<VecDeque<ConnectFailure>>,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            peers: tx,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// Make the next connect attempt fail
    pub fn fail_next_connect(&self, failure: ConnectFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(failure);
        }
    }

    /// Number of connect attempts seen so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failure = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        match failure {
            Some(ConnectFailure::Unreachable) => {
                return Err(RealtimeError::Transport(format!("{} unreachable", url)));
            }
            Some(ConnectFailure::Rejected(status)) => {
                return Err(RealtimeError::HandshakeRejected { status });
            }
            None => {}
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.clone(),
            to_client,
            from_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| RealtimeError::Transport("memory server is gone".to_string()))?;

        Ok(Box::new(MemoryLink {
            inbound,
            outbound: Some(outbound),
        }))
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx
                .send(text)
                .map_err(|_| RealtimeError::Transport("peer hung up".to_string())),
            None => Err(RealtimeError::Transport("link closed".to_string())),
        }
    }

    async fn next_event(&mut self) -> LinkEvent {
        self.inbound.recv().await.unwrap_or(LinkEvent::Closed(None))
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

/// Server side of one in-memory link
pub struct MemoryPeer {
    pub url: Url,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push a text frame; false once the client side is gone
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Close the link from the server side
    pub fn close(&self, code: Option<u16>) -> bool {
        self.to_client.send(LinkEvent::Closed(code)).is_ok()
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Error(message.into())).is_ok()
    }

    /// Next frame the client sent; `None` once the client closed the link
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Value of the `token` query parameter the client connected with
    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }
}
