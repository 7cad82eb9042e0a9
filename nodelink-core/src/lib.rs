//! # nodelink-core
//!
//! Core abstractions shared by the nodelink cluster transport.
//!
//! This crate provides:
//!
//! - **Provider traits**: Abstractions for networking, time and task spawning
//!   so the transport logic never talks to the runtime directly
//! - **Member types**: [`NodeId`] and [`Member`], the identity/address record a
//!   peer is known by cluster-wide
//! - **Discovery seam**: the [`Discovery`] trait the transport consults for
//!   membership, plus [`StaticDiscovery`], an in-memory registry
//!
//! ## Provider Traits
//!
//! - [`NetworkProvider`]: TCP connect and bind
//! - [`TimeProvider`]: Monotonic clock, sleep and timeout
//! - [`TaskProvider`]: Named task spawning
//! - [`Providers`]: Bundle of the three above
//!
//! The Tokio implementations ([`TokioProviders`]) are what a node runs with.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod discovery;
mod member;
mod network;
mod providers;
mod task;
mod time;

// Discovery exports
pub use discovery::{Discovery, StaticDiscovery};

// Member exports
pub use member::{Member, MemberParseError, NodeId};

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
