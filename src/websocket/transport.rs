//! Link establishment seam and the WebSocket implementation

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Result;

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A UTF-8 text frame
    Text(String),
    /// The remote side closed the link (close code when one was sent)
    Closed(Option<u16>),
    /// The link failed; treated like a close without a code
    Error(String),
}

/// One open duplex link
#[async_trait]
pub trait Link: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next event from the remote side. Must be cancel-safe.
    async fn next_event(&mut self) -> LinkEvent;

    async fn close(&mut self);
}

/// Opens links to a fully-built channel address
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>>;
}

/// WebSocket transport backed by `tokio-tungstenite`
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>> {
        let (stream, _response) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return LinkEvent::Text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return LinkEvent::Text(text),
                    Err(_) => {
                        tracing::debug!(len = data.len(), "Ignoring non UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return LinkEvent::Closed(frame.map(|f| u16::from(f.code)));
                }
                // tungstenite answers pings itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return LinkEvent::Error(e.to_string()),
                None => return LinkEvent::Closed(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}
