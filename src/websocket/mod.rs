mod backoff;
mod channel;
mod connection;
mod memory;
mod message;
mod transport;

pub use backoff::{BackoffTier, ReconnectPolicy};
pub use channel::Channel;
pub use connection::{
    CloseHook, Connection, ConnectionContext, ConnectionState, SeqTracker,
};
pub use memory::{ConnectFailure, MemoryPeer, MemoryTransport};
pub use message::{ClientMessage, Envelope, Event, FrameError, MachineEvent};
pub use transport::{Link, LinkEvent, Transport, WsTransport};
