//! Unified error type for remote calls.
//!
//! Covers both sides of a call: failures while sending the request
//! (framing, no connection) and failures while waiting for the reply
//! (connection dropped, timeout, remote handler error).

use nodelink_core::NodeId;

use crate::wire::WireError;

/// Errors returned by [`crate::TransportManager::request_response`] and the
/// handshake round trips built on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The connection was disposed before a reply arrived.
    ///
    /// The request may or may not have been delivered.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived within the call's timeout.
    #[error("request timed out")]
    Timeout,

    /// There is no pooled connection to the target node.
    #[error("not connected to {node_id}")]
    NotConnected {
        /// The node the call was addressed to.
        node_id: NodeId,
    },

    /// The remote side answered with an error frame.
    #[error("remote error: {message}")]
    Remote {
        /// Message carried by the error frame.
        message: String,
    },

    /// The reply payload could not be interpreted.
    #[error("invalid response: {message}")]
    InvalidResponse {
        /// What was wrong with the payload.
        message: String,
    },

    /// The request could not be framed.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl RpcError {
    /// Whether the error means the underlying connection is gone.
    ///
    /// Disconnect-class errors are expected while peers shut down and are
    /// not worth logging on their own.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed | RpcError::NotConnected { .. })
    }
}
