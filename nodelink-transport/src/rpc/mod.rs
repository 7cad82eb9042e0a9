//! Remote-call plumbing: errors, reply correlation and the application
//! request handler seam.

mod handler;
mod pending;
mod rpc_error;

pub use handler::{RejectingHandler, RequestHandler};
pub(crate) use pending::PendingGuard;
pub use pending::PendingReplies;
pub use rpc_error::RpcError;
