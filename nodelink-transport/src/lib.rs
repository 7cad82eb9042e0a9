//! # nodelink-transport
//!
//! Inter-node transport for a clustered messaging backend.
//!
//! This crate provides:
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//! - **Handshakes**: Open, Close and Keepalive exchanges over the
//!   request/response channel
//! - **Peer connections**: per-socket state, a driver task per socket and
//!   fault-isolated lifecycle listeners
//! - **Transport manager**: a pool holding at most one trusted connection
//!   per peer, duplicate-free dialing, keepalive and reconnection
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nodelink_transport::{
//!     Member, StaticDiscovery, TokioProviders, TransportConfig, TransportManager,
//! };
//!
//! # async fn run() -> Result<(), nodelink_transport::TransportError> {
//! let discovery = Arc::new(StaticDiscovery::with_members(
//!     Member::new("service-1", "127.0.0.1", 7510),
//!     [Member::new("service-2", "127.0.0.1", 7511)],
//! ));
//! let config = TransportConfig::default().with_listen("127.0.0.1", 7510);
//! let manager = TransportManager::new(TokioProviders::new(), config, discovery)?;
//! manager.start().await?;
//! manager.connect_all_known_members();
//! # manager.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use nodelink_core::{
    Discovery, Member, MemberParseError, NetworkProvider, NodeId, Providers, StaticDiscovery,
    TaskProvider, TcpListenerTrait, TimeError, TimeProvider, TokioNetworkProvider,
    TokioProviders, TokioTaskProvider, TokioTimeProvider,
};

// =============================================================================
// Modules
// =============================================================================

/// Configuration loading and validation.
pub mod config;

/// Listening endpoint with port auto-increment.
pub mod endpoint;

/// Error types for transport operations.
pub mod error;

/// Handshake messages.
pub mod handshake;

/// Connection pool, dialing, keepalive and reconnection.
pub mod manager;

/// Per-socket connection state and lifecycle listeners.
pub mod peer;

/// Request/response correlation and the application handler seam.
pub mod rpc;

/// Frame format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{ClientProperties, ConfigError, ConnectionProperties, ServerProperties, TransportConfig};
pub use endpoint::{BoundListener, ListeningEndpoint};
pub use error::TransportError;
pub use handshake::{CloseReason, CloseStatus, HandshakeError, OpenRequest, OpenStatus};
pub use manager::TransportManager;
pub use peer::{ConnectionId, LifecycleListener, LifecycleListenerFactory, PeerConnection};
pub use rpc::{PendingReplies, RejectingHandler, RequestHandler, RpcError};
pub use wire::{
    encode_frame, try_decode_frame, Frame, FrameFlag, FrameKind, WireError, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
