//! Handshake messages exchanged once a raw socket exists.
//!
//! ```text
//! Raw ──Open──▶ Pooled ──Close / socket disposed──▶ Terminated
//! ```
//!
//! There is no half-pooled state: a connection enters the pool only when
//! the accepting side answers [`OpenStatus::Success`].
//!
//! | Message   | Request payload        | Response payload        |
//! |-----------|------------------------|-------------------------|
//! | Open      | local node id (UTF-8)  | 1 byte [`OpenStatus`]   |
//! | Close     | 1 byte [`CloseReason`] | 1 byte [`CloseStatus`]  |
//! | Keepalive | empty                  | empty                   |

use bytes::Bytes;
use nodelink_core::NodeId;

use crate::rpc::RpcError;

/// Errors decoding a handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The Open request did not carry a usable node id.
    #[error("invalid node id in open request")]
    InvalidNodeId,

    /// A status or reason payload was not exactly one byte.
    #[error("{message} payload must be 1 byte, got {len}")]
    InvalidLength {
        /// Which message was malformed.
        message: &'static str,
        /// Actual payload length.
        len: usize,
    },

    /// Unrecognised status or reason code.
    #[error("unknown {message} code: {code}")]
    UnknownCode {
        /// Which message carried the code.
        message: &'static str,
        /// The unrecognised byte.
        code: u8,
    },
}

impl From<HandshakeError> for RpcError {
    fn from(err: HandshakeError) -> Self {
        RpcError::InvalidResponse {
            message: err.to_string(),
        }
    }
}

fn single_byte(message: &'static str, payload: &[u8]) -> Result<u8, HandshakeError> {
    match payload {
        [code] => Ok(*code),
        _ => Err(HandshakeError::InvalidLength {
            message,
            len: payload.len(),
        }),
    }
}

/// Outcome of an Open handshake as decided by the accepting side.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenStatus {
    /// The connection was promoted into the pool.
    Success = 0,
    /// The claimed node id is not a known member.
    UnknownMember = 1,
    /// An active connection to the claimed node is already pooled.
    ConnectionAlreadyExists = 2,
    /// The connection (or the whole transport) is already closing.
    ConnectionClosed = 3,
}

impl OpenStatus {
    /// Encode as a response payload.
    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }

    /// Decode a response payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        match single_byte("open status", payload)? {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnknownMember),
            2 => Ok(Self::ConnectionAlreadyExists),
            3 => Ok(Self::ConnectionClosed),
            code => Err(HandshakeError::UnknownCode {
                message: "open status",
                code,
            }),
        }
    }
}

/// Open request: the dialing node introduces itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Node id of the dialing side.
    pub node_id: NodeId,
}

impl OpenRequest {
    /// Encode as a request payload.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.node_id.as_str().as_bytes())
    }

    /// Decode a request payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        let id = std::str::from_utf8(payload).map_err(|_| HandshakeError::InvalidNodeId)?;
        if id.is_empty() {
            return Err(HandshakeError::InvalidNodeId);
        }
        Ok(Self {
            node_id: NodeId::new(id),
        })
    }
}

/// Why the sender is closing the connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The sending node is stopping its transport.
    ServerShuttingDown = 0,
}

impl CloseReason {
    /// Encode as a request payload.
    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }

    /// Decode a request payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        match single_byte("close reason", payload)? {
            0 => Ok(Self::ServerShuttingDown),
            code => Err(HandshakeError::UnknownCode {
                message: "close reason",
                code,
            }),
        }
    }
}

/// Acknowledgement of a Close request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseStatus {
    /// The receiver marked the connection as closing.
    Success = 0,
}

impl CloseStatus {
    /// Encode as a response payload.
    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }

    /// Decode a response payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        match single_byte("close status", payload)? {
            0 => Ok(Self::Success),
            code => Err(HandshakeError::UnknownCode {
                message: "close status",
                code,
            }),
        }
    }
}
