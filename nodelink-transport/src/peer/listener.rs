//! Lifecycle listener seam.

use nodelink_core::Member;

use super::PeerConnection;
use crate::wire::Frame;

/// Observer of one connection's lifecycle.
///
/// A fresh set of listeners is created from the registered factories for
/// every connection. All methods default to no-ops; errors and panics are
/// caught per call and logged, so a faulty listener never breaks the
/// transport or the other listeners.
pub trait LifecycleListener: Send + Sync {
    /// A raw socket exists, before any handshake.
    fn on_connection_open(&self, _connection: &PeerConnection) -> anyhow::Result<()> {
        Ok(())
    }

    /// A frame arrived on the socket.
    fn on_data_received(&self, _frame: &Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// The Open handshake succeeded and the connection is pooled.
    fn on_opening_handshake_completed(&self, _member: &Member) -> anyhow::Result<()> {
        Ok(())
    }

    /// The peer announced it is closing the connection.
    fn on_closing_handshake_completed(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The socket is gone. Called exactly once per connection.
    fn on_connection_closed(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates the listener instance bound to each new connection.
pub trait LifecycleListenerFactory: Send + Sync + 'static {
    /// Create a listener for one connection.
    fn create(&self) -> Box<dyn LifecycleListener>;
}

impl<F> LifecycleListenerFactory for F
where
    F: Fn() -> Box<dyn LifecycleListener> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn LifecycleListener> {
        self()
    }
}
