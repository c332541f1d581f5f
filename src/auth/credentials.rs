use std::sync::RwLock;

use crate::config::AnonymousPolicy;
use crate::error::{RealtimeError, Result};
use crate::websocket::Channel;

/// Supplies the current bearer token.
///
/// Read once per connect attempt and never cached by the client, so a token
/// refreshed by the session layer is picked up on the next reconnect.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// Token slot updated by the session layer (login, refresh, logout)
#[derive(Debug, Default)]
pub struct SharedToken {
    inner: RwLock<Option<String>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = None;
        }
    }
}

impl CredentialSource for SharedToken {
    fn bearer_token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|slot| slot.clone())
    }
}

/// Decide which token (if any) to put on the connect URL for `channel`.
///
/// Notify always needs a token. Contest channels follow `policy` when no
/// token is available.
pub fn resolve_token(
    source: &dyn CredentialSource,
    channel: &Channel,
    policy: AnonymousPolicy,
) -> Result<Option<String>> {
    let token = source.bearer_token().filter(|t| !t.trim().is_empty());

    match (token, channel) {
        (Some(token), _) => Ok(Some(token)),
        (None, Channel::Contest(_)) if policy == AnonymousPolicy::Connect => Ok(None),
        (None, _) => Err(RealtimeError::Credential(channel.to_string())),
    }
}
