//! Outbound side: dialing members, the Open handshake, dial retries.

use nodelink_core::{Member, NetworkProvider, NodeId, Providers, TaskProvider, TimeProvider};

use super::{Promotion, TransportManager};
use crate::handshake::{OpenRequest, OpenStatus};
use crate::peer::PeerConnection;
use crate::rpc::RpcError;
use crate::wire::FrameKind;

impl<P: Providers> TransportManager<P> {
    /// Make sure a connection to `member` gets established, retrying until
    /// it succeeds or the member leaves the cluster.
    ///
    /// No-op for the local node, a member that is already connected or
    /// already being dialed, and after [`Self::stop`].
    pub fn connect_member_until_succeed_or_removed(&self, member: &Member) {
        let node_id = &member.node_id;
        if self.inner.discovery.is_local_node_id(node_id)
            || self.is_stopping()
            || self.is_member_connected(node_id)
        {
            return;
        }
        if !self.inner.dialing.insert(node_id.clone()) {
            tracing::debug!(node_id = %node_id, "already connecting to member");
            return;
        }
        self.spawn_dial(member.clone());
    }

    /// Dial every known member that is not connected yet.
    pub fn connect_all_known_members(&self) {
        for member in self.inner.discovery.all_known_members().into_values() {
            self.connect_member_until_succeed_or_removed(&member);
        }
        self.refresh_connected_to_all();
    }

    fn spawn_dial(&self, member: Member) {
        let manager = self.clone();
        let task_name = format!("dial-{}", member.node_id);
        self.inner.providers.task().spawn_task(&task_name, async move {
            manager.dial(member).await;
        });
    }

    /// One outbound attempt. The member stays in the dialing set until the
    /// handshake settles or retrying stops.
    async fn dial(&self, member: Member) {
        let addr = member.address();
        tracing::info!(node_id = %member.node_id, addr = %addr, "connecting to member");

        let connected = self
            .inner
            .providers
            .time()
            .timeout(
                self.inner.config.connect_timeout,
                self.inner.providers.network().connect(&addr),
            )
            .await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.on_dial_failure(&member, &err.to_string());
                return;
            }
            Err(_) => {
                self.on_dial_failure(&member, "connect timed out");
                return;
            }
        };

        if self.is_stopping() {
            self.inner.dialing.remove(&member.node_id);
            return;
        }
        if self.is_member_connected(&member.node_id) {
            // The peer's own dial won while we were connecting
            tracing::debug!(
                node_id = %member.node_id,
                "member connected meanwhile, dropping outbound socket"
            );
            self.inner.retries.remove(&member.node_id);
            self.inner.dialing.remove(&member.node_id);
            return;
        }

        let connection = self.open_connection(stream, addr, Some(member.node_id.clone()));
        self.open_handshake(&connection, &member).await;
    }

    /// Socket-level failure: back off and retry while the member is known.
    fn on_dial_failure(&self, member: &Member, error: &str) {
        let node_id = &member.node_id;
        if self.is_stopping() || !self.inner.discovery.is_known_member(node_id) {
            tracing::info!(
                node_id = %node_id,
                error,
                "stop connecting to member: member removed or transport stopping"
            );
            self.inner.retries.remove(node_id);
            self.inner.dialing.remove(node_id);
            return;
        }

        let failures = {
            let mut retries = self.inner.retries.entry(node_id.clone()).or_insert(0);
            *retries = retries.saturating_add(1);
            *retries
        };
        let delay = self.inner.config.retry_delay(failures);
        tracing::warn!(
            node_id = %node_id,
            addr = %member.address(),
            retry = failures,
            ?delay,
            error,
            "failed to connect to member, retrying"
        );
        self.schedule_dial_retry(node_id.clone(), delay);
    }

    fn schedule_dial_retry(&self, node_id: NodeId, delay: std::time::Duration) {
        let manager = self.clone();
        let task_name = format!("dial-retry-{node_id}");
        self.inner.providers.task().spawn_task(&task_name, async move {
            tokio::select! {
                _ = manager.inner.shutdown.cancelled() => {
                    manager.inner.dialing.remove(&node_id);
                    return;
                }
                _ = manager.inner.providers.time().sleep(delay) => {}
            }

            match manager.inner.discovery.get_member(&node_id) {
                Some(member) if !manager.is_stopping() && !manager.is_member_connected(&node_id) => {
                    manager.dial(member).await;
                }
                _ => {
                    tracing::info!(node_id = %node_id, "dial retry no longer needed");
                    manager.inner.retries.remove(&node_id);
                    manager.inner.dialing.remove(&node_id);
                }
            }
        });
    }

    /// Send Open on a freshly dialed socket and act on the answer.
    async fn open_handshake(&self, connection: &std::sync::Arc<PeerConnection>, member: &Member) {
        let node_id = &member.node_id;
        let request = OpenRequest {
            node_id: self.local_node_id(),
        };
        let result = self
            .request_on(
                connection,
                FrameKind::Open,
                request.encode(),
                self.inner.config.handshake_timeout,
            )
            .await
            .and_then(|payload| OpenStatus::decode(&payload).map_err(RpcError::from));

        match result {
            Ok(OpenStatus::Success) => self.on_open_accepted(connection, member),
            Ok(status) => {
                tracing::error!(
                    node_id = %node_id,
                    connection_id = %connection.id(),
                    ?status,
                    "open handshake rejected by member"
                );
                self.inner.dialing.remove(node_id);
                connection.dispose();
            }
            Err(err) => {
                tracing::error!(
                    node_id = %node_id,
                    connection_id = %connection.id(),
                    error = %err,
                    "open handshake failed"
                );
                self.inner.dialing.remove(node_id);
                connection.dispose();
            }
        }
    }

    fn on_open_accepted(&self, connection: &std::sync::Arc<PeerConnection>, member: &Member) {
        let node_id = &member.node_id;
        if self.is_stopping() || !self.inner.discovery.is_known_member(node_id) {
            tracing::info!(
                node_id = %node_id,
                "discarding handshake result: member removed or transport stopping"
            );
            self.inner.retries.remove(node_id);
            self.inner.dialing.remove(node_id);
            connection.set_closing();
            connection.dispose();
            return;
        }

        if !connection.bind_node_id(node_id.clone()) {
            tracing::error!(
                node_id = %node_id,
                bound = ?connection.node_id(),
                connection_id = %connection.id(),
                "dialed connection already bound to another member"
            );
            self.inner.dialing.remove(node_id);
            connection.dispose();
            return;
        }
        match self.try_promote(connection, node_id) {
            Promotion::Promoted => {
                connection.refresh_liveness(self.now_millis());
                self.inner.retries.remove(node_id);
                self.inner.dialing.remove(node_id);
                tracing::info!(
                    node_id = %node_id,
                    connection_id = %connection.id(),
                    addr = %connection.remote_addr(),
                    "connected to member"
                );
                connection.notify_listeners("on_opening_handshake_completed", |l| {
                    l.on_opening_handshake_completed(member)
                });
                self.refresh_connected_to_all();
            }
            Promotion::Superseded => {
                // The peer pooled this socket when it answered; leave it be
                tracing::info!(
                    node_id = %node_id,
                    connection_id = %connection.id(),
                    "handshake superseded by the connection already pooled"
                );
                self.inner.retries.remove(node_id);
                self.inner.dialing.remove(node_id);
            }
            Promotion::Closed => {
                tracing::warn!(
                    node_id = %node_id,
                    connection_id = %connection.id(),
                    "connection closed during open handshake"
                );
                self.inner.dialing.remove(node_id);
            }
        }
    }
}
