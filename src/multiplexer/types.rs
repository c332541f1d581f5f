//! Ownership table entries and statistics

use std::collections::HashMap;

use serde::Serialize;

use crate::websocket::Connection;

/// One live contest channel and the number of consumers holding it
pub struct ContestEntry {
    pub connection: Connection,
    pub refs: usize,
}

/// Multiplexer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiplexerStats {
    pub notify_live: bool,
    /// slug -> reference count
    pub contests: HashMap<String, usize>,
    pub cached_snapshots: usize,
}

impl MultiplexerStats {
    pub fn live_connections(&self) -> usize {
        self.contests.len() + usize::from(self.notify_live)
    }
}
