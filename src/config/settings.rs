use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use url::Url;

use crate::error::{RealtimeError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Base address of the real-time endpoint, e.g. `wss://ctf.example.org`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Keepalive interval in milliseconds (client sends `{"type":"ping"}`)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Reconnect delay after an ordinary close
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Reconnect delay after a throttling or auth rejection close
    #[serde(default = "default_extended_reconnect_delay_ms")]
    pub extended_reconnect_delay_ms: u64,
    /// Upper bound of random delay added on top of either reconnect delay
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
    /// Close codes that select the extended reconnect delay
    #[serde(default = "default_extended_close_codes")]
    pub extended_close_codes: Vec<u16>,
}

fn default_base_url() -> String {
    "ws://localhost:8000".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    25_000 // 25 seconds
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_extended_reconnect_delay_ms() -> u64 {
    15_000
}

fn default_extended_close_codes() -> Vec<u16> {
    // unauthenticated, forbidden, connection quota exceeded, policy violation
    vec![4401, 4403, 4429, 1008]
}

/// What to do when no bearer token is available for a contest channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnonymousPolicy {
    /// Skip the attempt and retry after the extended delay
    #[default]
    Refuse,
    /// Connect without a `token` query parameter
    Connect,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Static bearer token, mostly useful for the bundled binary
    pub token: Option<String>,
    #[serde(default)]
    pub anonymous_contests: AnonymousPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Contest slugs joined by the binary at start-up
    #[serde(default)]
    pub contests: Vec<String>,
}

impl Settings {
    pub fn new() -> std::result::Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("realtime.base_url", default_base_url())?
            .set_default("realtime.heartbeat_interval_ms", default_heartbeat_interval_ms())?
            .set_default("realtime.reconnect_delay_ms", default_reconnect_delay_ms())?
            .set_default(
                "realtime.extended_reconnect_delay_ms",
                default_extended_reconnect_delay_ms(),
            )?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // CTF__REALTIME__BASE_URL, CTF__AUTH__TOKEN, CTF__CLIENT__CONTESTS=a,b ...
            .add_source(
                Environment::with_prefix("CTF")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("realtime.extended_close_codes")
                    .with_list_parse_key("client.contests"),
            );

        builder.build()?.try_deserialize()
    }
}

impl RealtimeConfig {
    /// Parsed base address; only `ws`, `wss`, `http` and `https` are accepted
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| RealtimeError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        match url.scheme() {
            "ws" | "wss" | "http" | "https" => Ok(url),
            other => Err(RealtimeError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, self.base_url
            ))),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn extended_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.extended_reconnect_delay_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            extended_reconnect_delay_ms: default_extended_reconnect_delay_ms(),
            reconnect_jitter_ms: 0,
            extended_close_codes: default_extended_close_codes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let realtime = RealtimeConfig::default();
        assert_eq!(realtime.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(realtime.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(realtime.extended_reconnect_delay(), Duration::from_secs(15));
        assert_eq!(realtime.extended_close_codes, vec![4401, 4403, 4429, 1008]);
        assert_eq!(AuthConfig::default().anonymous_contests, AnonymousPolicy::Refuse);
    }

    #[test]
    fn test_base_url_validation() {
        let url = tokio_test::assert_ok!(RealtimeConfig::default().base_url());
        assert_eq!(url.scheme(), "ws");

        let bad = RealtimeConfig {
            base_url: "ftp://example.org".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad.base_url(), Err(RealtimeError::InvalidUrl(_))));

        let garbage = RealtimeConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(garbage.base_url().is_err());
    }

    #[test]
    fn test_anonymous_policy_deserializes_lowercase() {
        let auth: AuthConfig =
            serde_json::from_str(r#"{"anonymous_contests":"connect"}"#).unwrap();
        assert_eq!(auth.anonymous_contests, AnonymousPolicy::Connect);
        assert!(auth.token.is_none());
    }
}
