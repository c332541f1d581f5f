//! Reconnect delay selection based on how a link closed

use std::time::Duration;

use rand::Rng;

use crate::config::RealtimeConfig;

/// Reconnect delay class currently selected for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffTier {
    Standard,
    /// Server throttled or rejected our credentials
    Extended,
}

impl BackoffTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Extended => "extended",
        }
    }
}

/// Two-tier reconnect policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    standard: Duration,
    extended: Duration,
    jitter_ms: u64,
    extended_codes: Vec<u16>,
}

impl ReconnectPolicy {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            standard: config.reconnect_delay(),
            extended: config.extended_reconnect_delay(),
            jitter_ms: config.reconnect_jitter_ms,
            extended_codes: config.extended_close_codes.clone(),
        }
    }

    /// Classify a close code; a missing code (abrupt drop) is ordinary
    pub fn classify(&self, close_code: Option<u16>) -> BackoffTier {
        match close_code {
            Some(code) if self.extended_codes.contains(&code) => BackoffTier::Extended,
            _ => BackoffTier::Standard,
        }
    }

    /// Classify an HTTP status returned instead of the websocket upgrade
    pub fn classify_handshake(&self, status: u16) -> BackoffTier {
        match status {
            401 | 403 | 429 => BackoffTier::Extended,
            _ => BackoffTier::Standard,
        }
    }

    /// Delay for a tier. Jitter is only ever added, never subtracted.
    pub fn delay(&self, tier: BackoffTier) -> Duration {
        let base = match tier {
            BackoffTier::Standard => self.standard,
            BackoffTier::Extended => self.extended,
        };

        if self.jitter_ms > 0 {
            let jitter = rand::rng().random_range(0..=self.jitter_ms);
            base + Duration::from_millis(jitter)
        } else {
            base
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&RealtimeConfig::default())
    }
}
