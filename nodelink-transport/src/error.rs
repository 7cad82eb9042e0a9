//! Error types for the transport.

use nodelink_core::NodeId;

use crate::config::ConfigError;

/// Errors that can occur while starting, running or stopping the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Binding the listening socket did not finish in time.
    #[error("timed out binding {addr}")]
    BindTimeout {
        /// Address that was being bound.
        addr: String,
    },

    /// Every port of the auto-increment range is taken.
    #[error("no free port on {host} in {first}..={last}")]
    PortRangeExhausted {
        /// Host that was being bound.
        host: String,
        /// First port tried.
        first: u16,
        /// Last port tried.
        last: u16,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport security was requested but the network provider is plain.
    #[error("transport security is enabled but the network provider does not secure streams")]
    SecurityUnavailable,

    /// A keepalive arrived from a node without a pooled connection.
    #[error("keepalive from {node_id} which has no pooled connection")]
    UnknownKeepaliveSender {
        /// The claimed sender.
        node_id: NodeId,
    },

    /// The transport has already been started.
    #[error("transport already started")]
    AlreadyStarted,

    /// The transport has been stopped.
    #[error("transport stopped")]
    Stopped,
}
