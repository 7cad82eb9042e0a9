//! Peer connections: per-socket state, socket driver and lifecycle listeners.

mod connection;
pub(crate) mod driver;
mod listener;

pub use connection::{ConnectionId, PeerConnection};
pub use listener::{LifecycleListener, LifecycleListenerFactory};
