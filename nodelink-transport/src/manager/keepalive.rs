//! Keepalive loop for dialing-side connections.
//!
//! The loop only inspects the pool and spawns probes; it never waits on the
//! network itself, so one slow peer cannot delay the scan of the others.

use std::sync::Arc;

use bytes::Bytes;
use nodelink_core::{NodeId, Providers, TaskProvider, TimeProvider};

use super::TransportManager;
use crate::peer::PeerConnection;
use crate::wire::FrameKind;

impl<P: Providers> TransportManager<P> {
    pub(super) fn spawn_keepalive_loop(&self) {
        let manager = self.clone();
        self.inner
            .providers
            .task()
            .spawn_task("keepalive-loop", async move {
                manager.run_keepalive_loop().await;
            });
    }

    async fn run_keepalive_loop(&self) {
        let tick = self.inner.config.keepalive_tick;
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.providers.time().sleep(tick) => {}
            }
            self.scan_keepalive();
        }
        tracing::debug!("keepalive loop stopped");
    }

    /// One pass over the pool: prune disposed and silent connections, probe
    /// the ones that have been quiet for at least the keepalive interval.
    pub(super) fn scan_keepalive(&self) {
        let now = self.now_millis();
        let interval = duration_millis(self.inner.config.keepalive_interval);
        let timeout = duration_millis(self.inner.config.keepalive_timeout);

        let mut expired: Vec<(NodeId, Arc<PeerConnection>, u64)> = Vec::new();
        let mut due: Vec<Arc<PeerConnection>> = Vec::new();
        let mut pruned = false;

        self.inner.pool.retain(|node_id, connection| {
            if connection.is_disposed() {
                pruned = true;
                return false;
            }
            if !connection.is_dialing_side() {
                return true;
            }
            let elapsed = now.saturating_sub(connection.last_liveness_millis());
            if elapsed > timeout {
                expired.push((node_id.clone(), connection.clone(), elapsed));
                return false;
            }
            if elapsed >= interval {
                due.push(connection.clone());
            }
            true
        });

        for (node_id, connection, elapsed) in expired {
            tracing::warn!(
                node_id = %node_id,
                connection_id = %connection.id(),
                elapsed_ms = elapsed,
                "keepalive timed out, closing connection"
            );
            connection.dispose();
            pruned = true;
        }
        for connection in due {
            self.spawn_keepalive_probe(connection);
        }
        if pruned {
            self.refresh_connected_to_all();
        }
    }

    fn spawn_keepalive_probe(&self, connection: Arc<PeerConnection>) {
        if !connection.try_begin_keepalive() {
            return;
        }
        let manager = self.clone();
        let task_name = format!("keepalive-{}", connection.id());
        self.inner.providers.task().spawn_task(&task_name, async move {
            let result = manager
                .request_on(
                    &connection,
                    FrameKind::Keepalive,
                    Bytes::new(),
                    manager.inner.config.keepalive_timeout,
                )
                .await;
            match result {
                Ok(_) => connection.refresh_liveness(manager.now_millis()),
                Err(err) => {
                    tracing::warn!(
                        node_id = ?connection.node_id(),
                        connection_id = %connection.id(),
                        error = %err,
                        "keepalive failed"
                    );
                }
            }
            connection.end_keepalive();
        });
    }
}

fn duration_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager_for, raw_connection};
    use super::*;

    #[tokio::test]
    async fn test_scan_prunes_disposed_entries() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(Some("b"));
        manager.inner.pool.insert(NodeId::new("b"), conn.clone());
        conn.dispose();

        manager.scan_keepalive();
        assert!(manager.pooled_node_ids().is_empty());
    }

    #[tokio::test]
    async fn test_scan_expires_silent_dialing_connection() {
        let (manager, _) = manager_for("a", &["b"]);
        // Liveness recorded at time zero; the default timeout is 15s
        let conn = raw_connection(Some("b"));
        manager.inner.pool.insert(NodeId::new("b"), conn.clone());

        tokio::time::pause();
        let timeout = manager.config().keepalive_timeout;
        tokio::time::advance(timeout + std::time::Duration::from_millis(10)).await;

        manager.scan_keepalive();
        assert!(conn.is_disposed());
        assert!(manager.pooled_node_ids().is_empty());
    }

    #[tokio::test]
    async fn test_scan_skips_accepting_side() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(None);
        manager.inner.pool.insert(NodeId::new("b"), conn.clone());

        tokio::time::pause();
        tokio::time::advance(manager.config().keepalive_timeout * 2).await;

        manager.scan_keepalive();
        assert!(conn.is_connected());
        assert_eq!(manager.pooled_node_ids(), vec![NodeId::new("b")]);
    }
}
