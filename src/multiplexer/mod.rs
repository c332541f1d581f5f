//! Per-channel connection ownership shared by every consumer
//!
//! At most one Notify connection and at most one connection per contest slug
//! exist at a time. Contest connections are reference counted: the first
//! `join_contest` opens the channel, the last `leave_contest` tears it down
//! and drops its cached snapshot.

mod builder;
mod dispatcher;
mod registry;
mod types;

pub use builder::MultiplexerBuilder;
pub use dispatcher::EventDispatcher;
pub use registry::ChannelMultiplexer;
pub use types::{ContestEntry, MultiplexerStats};
