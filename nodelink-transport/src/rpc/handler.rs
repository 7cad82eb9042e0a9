//! Application request handling.

use async_trait::async_trait;
use bytes::Bytes;
use nodelink_core::NodeId;

/// Handles ordinary remote calls arriving on pooled connections.
///
/// Handshake and keepalive requests never reach the handler. The returned
/// error string is sent back to the caller as an error frame and surfaces
/// there as [`crate::RpcError::Remote`].
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request from `from` and produce the reply payload.
    async fn handle_request(&self, from: NodeId, payload: Bytes) -> Result<Bytes, String>;
}

/// Handler installed until the application sets its own: rejects every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingHandler;

#[async_trait]
impl RequestHandler for RejectingHandler {
    async fn handle_request(&self, _from: NodeId, _payload: Bytes) -> Result<Bytes, String> {
        Err("no request handler installed".to_string())
    }
}
