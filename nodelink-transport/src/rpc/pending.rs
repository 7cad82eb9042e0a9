//! Per-connection table of requests awaiting a reply.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::RpcError;

type ReplySender = oneshot::Sender<Result<Bytes, RpcError>>;

/// Correlates replies with outstanding requests by request id.
///
/// Ids are scoped to one connection and never reused on it.
#[derive(Debug, Default)]
pub struct PendingReplies {
    next_request_id: AtomicU64,
    slots: DashMap<u64, ReplySender>,
}

impl PendingReplies {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and its reply slot.
    pub fn allocate(&self) -> (u64, oneshot::Receiver<Result<Bytes, RpcError>>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id, tx);
        (request_id, rx)
    }

    /// Deliver a reply. Returns false when nobody waits for `request_id`
    /// (late reply after a timeout, or a bogus id).
    pub fn complete(&self, request_id: u64, result: Result<Bytes, RpcError>) -> bool {
        match self.slots.remove(&request_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Forget a request whose caller gave up.
    pub fn cancel(&self, request_id: u64) {
        self.slots.remove(&request_id);
    }

    /// Fail every outstanding request with [`RpcError::ConnectionClosed`].
    pub fn fail_all(&self) {
        let ids: Vec<u64> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.slots.remove(&id) {
                let _ = tx.send(Err(RpcError::ConnectionClosed));
            }
        }
    }

    /// Number of requests awaiting a reply.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no request is awaiting a reply.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Removes the reply slot when the waiting call is dropped (e.g. on timeout).
pub(crate) struct PendingGuard<'a> {
    pub(crate) pending: &'a PendingReplies,
    pub(crate) request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.request_id);
    }
}
