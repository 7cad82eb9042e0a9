//! Close detection, reconnection and shutdown.

use std::sync::Arc;

use futures::future::join_all;
use nodelink_core::{NodeId, Providers, TaskProvider, TimeProvider};

use super::TransportManager;
use crate::handshake::{CloseReason, CloseStatus};
use crate::peer::driver::DriverExit;
use crate::peer::PeerConnection;
use crate::wire::FrameKind;

/// What close detection does about a closed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconnect {
    Schedule,
    /// Only the dialing side reconnects.
    AcceptingSide,
    Stopping,
    MemberRemoved,
    /// Another pooled connection already serves the member.
    AlreadyConnected,
}

impl<P: Providers> TransportManager<P> {
    /// Runs once per connection, after its socket driver exited.
    ///
    /// This is the single place that decides whether to reconnect: only
    /// the dialing side does, and only while the peer is still known.
    pub(super) fn on_connection_closed(&self, connection: &Arc<PeerConnection>, exit: &DriverExit) {
        self.inner.live.remove(&connection.id());
        if let Some(node_id) = connection.node_id() {
            self.inner
                .pool
                .remove_if(node_id, |_, pooled| pooled.id() == connection.id());
        }

        let peer = connection.peer_node_id().cloned();
        if connection.is_closing() || self.is_stopping() {
            tracing::info!(
                node_id = ?peer,
                connection_id = %connection.id(),
                addr = %connection.remote_addr(),
                reason = %exit,
                "connection closed"
            );
        } else {
            tracing::warn!(
                node_id = ?peer,
                connection_id = %connection.id(),
                addr = %connection.remote_addr(),
                reason = %exit,
                "connection closed unexpectedly"
            );
        }

        connection.notify_listeners("on_connection_closed", |l| l.on_connection_closed());

        if let Some(node_id) = peer {
            match self.reconnect_decision(connection, &node_id) {
                Reconnect::Schedule => self.schedule_reconnect(node_id),
                Reconnect::AcceptingSide => {}
                Reconnect::MemberRemoved => {
                    tracing::info!(node_id = %node_id, "not reconnecting: member removed");
                    self.inner.retries.remove(&node_id);
                }
                skip => {
                    tracing::info!(node_id = %node_id, reason = ?skip, "not reconnecting");
                }
            }
        }

        self.refresh_connected_to_all();
    }

    /// Whether a closed connection to `node_id` should be re-dialed.
    fn reconnect_decision(&self, connection: &PeerConnection, node_id: &NodeId) -> Reconnect {
        if !connection.is_dialing_side() {
            Reconnect::AcceptingSide
        } else if self.is_stopping() {
            Reconnect::Stopping
        } else if !self.inner.discovery.is_known_member(node_id) {
            Reconnect::MemberRemoved
        } else if self.is_member_connected(node_id) {
            Reconnect::AlreadyConnected
        } else {
            Reconnect::Schedule
        }
    }

    fn schedule_reconnect(&self, node_id: NodeId) {
        let manager = self.clone();
        let delay = self.inner.config.reconnect_interval;
        tracing::debug!(node_id = %node_id, ?delay, "scheduling reconnect");

        let task_name = format!("reconnect-{node_id}");
        self.inner.providers.task().spawn_task(&task_name, async move {
            tokio::select! {
                _ = manager.inner.shutdown.cancelled() => return,
                _ = manager.inner.providers.time().sleep(delay) => {}
            }
            match manager.inner.discovery.get_member(&node_id) {
                Some(member) => manager.connect_member_until_succeed_or_removed(&member),
                None => {
                    tracing::info!(node_id = %node_id, "not reconnecting: member removed");
                    manager.inner.retries.remove(&node_id);
                }
            }
        });
    }

    /// Stop the transport. Idempotent.
    ///
    /// Stops accepting, sends a Close handshake to every pooled peer and
    /// disposes every socket. Inbound handshakes are refused from the
    /// moment this is called.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        tracing::info!(node_id = %self.local_node_id(), "stopping transport");
        self.inner.shutdown.cancel();

        let endpoint = self.inner.endpoint.lock().take();
        if let Some(endpoint) = endpoint {
            endpoint
                .dispose(self.inner.providers.time(), self.inner.config.dispose_grace)
                .await;
        }

        let node_ids: Vec<NodeId> = self.inner.pool.iter().map(|e| e.key().clone()).collect();
        let pooled: Vec<(NodeId, Arc<PeerConnection>)> = node_ids
            .into_iter()
            .filter_map(|node_id| self.inner.pool.remove(&node_id))
            .collect();
        join_all(
            pooled
                .into_iter()
                .map(|(node_id, connection)| self.close_gracefully(node_id, connection)),
        )
        .await;

        let remaining: Vec<Arc<PeerConnection>> =
            self.inner.live.iter().map(|e| e.value().clone()).collect();
        for connection in remaining {
            connection.set_closing();
            connection.dispose();
        }

        self.inner.dialing.clear();
        self.inner.retries.clear();
        self.refresh_connected_to_all();
        tracing::info!(node_id = %self.local_node_id(), "transport stopped");
    }

    async fn close_gracefully(&self, node_id: NodeId, connection: Arc<PeerConnection>) {
        connection.set_closing();
        if connection.is_connected() {
            let result = self
                .request_on(
                    &connection,
                    FrameKind::Close,
                    CloseReason::ServerShuttingDown.encode(),
                    self.inner.config.close_handshake_timeout,
                )
                .await;
            match result.map(|payload| CloseStatus::decode(&payload)) {
                Ok(Ok(CloseStatus::Success)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(node_id = %node_id, error = %err, "invalid close handshake response");
                }
                Err(err) if err.is_disconnect() => {}
                Err(err) => {
                    tracing::warn!(node_id = %node_id, error = %err, "close handshake failed");
                }
            }
        }
        connection.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager_for, raw_connection};
    use super::*;

    #[tokio::test]
    async fn test_dialing_side_reconnects_while_member_known() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(Some("b"));
        assert_eq!(
            manager.reconnect_decision(&conn, &NodeId::new("b")),
            Reconnect::Schedule
        );
    }

    #[tokio::test]
    async fn test_accepting_side_never_reconnects() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(None);
        assert!(conn.bind_node_id(NodeId::new("b")));
        assert_eq!(
            manager.reconnect_decision(&conn, &NodeId::new("b")),
            Reconnect::AcceptingSide
        );
    }

    #[tokio::test]
    async fn test_no_reconnect_when_another_connection_is_pooled() {
        let (manager, _) = manager_for("a", &["b"]);
        let pooled = raw_connection(None);
        assert!(pooled.bind_node_id(NodeId::new("b")));
        manager.inner.pool.insert(NodeId::new("b"), pooled);

        // e.g. a handshake that lost the slot to the peer's own dial
        let superseded = raw_connection(Some("b"));
        superseded.dispose();
        assert_eq!(
            manager.reconnect_decision(&superseded, &NodeId::new("b")),
            Reconnect::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn test_no_reconnect_for_removed_member() {
        let (manager, discovery) = manager_for("a", &["b"]);
        discovery.remove_member(&NodeId::new("b"));
        let conn = raw_connection(Some("b"));
        assert_eq!(
            manager.reconnect_decision(&conn, &NodeId::new("b")),
            Reconnect::MemberRemoved
        );
    }

    #[tokio::test]
    async fn test_no_reconnect_after_stop() {
        let (manager, _) = manager_for("a", &["b"]);
        manager.stop().await;
        let conn = raw_connection(Some("b"));
        assert_eq!(
            manager.reconnect_decision(&conn, &NodeId::new("b")),
            Reconnect::Stopping
        );
    }
}
