//! Client-side real-time event distribution for the CTF platform.
//!
//! One [`ChannelMultiplexer`] owns the per-user Notify channel and one
//! reference-counted channel per joined contest. Decoded events fan out
//! through the [`EventBus`]; the latest scoreboard snapshot of every joined
//! contest is kept in the [`SnapshotCache`].

// Shared components
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Event distribution
pub mod bus;
pub mod multiplexer;
pub mod snapshot;
pub mod websocket;

pub use auth::{CredentialSource, SharedToken};
pub use bus::{EventBus, Subscription};
pub use config::{AnonymousPolicy, RealtimeConfig, Settings};
pub use error::{RealtimeError, Result};
pub use multiplexer::{ChannelMultiplexer, MultiplexerBuilder, MultiplexerStats};
pub use snapshot::{Snapshot, SnapshotCache};
pub use websocket::{Channel, ConnectionState, Envelope, Event};
