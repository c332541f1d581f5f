use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake rejected with HTTP {status}")]
    HandshakeRejected { status: u16 },

    #[error("Credential unavailable for {0}")]
    Credential(String),

    #[error("No Tokio runtime available: {0}")]
    Runtime(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::Http(response) => RealtimeError::HandshakeRejected {
                status: response.status().as_u16(),
            },
            other => RealtimeError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
