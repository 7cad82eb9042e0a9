//! Accepting side: inbound sockets and the requests peers send us.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use nodelink_core::{NodeId, Providers, TaskProvider};
use tokio::io::{AsyncRead, AsyncWrite};

use super::TransportManager;
use crate::error::TransportError;
use crate::handshake::{CloseReason, CloseStatus, OpenRequest, OpenStatus};
use crate::peer::driver::{DriverExit, FrameDispatcher};
use crate::peer::PeerConnection;
use crate::wire::{Frame, FrameKind};

impl<P: Providers> TransportManager<P> {
    /// Wrap an accepted socket and wait for the peer's Open.
    pub(super) fn accept_connection<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_stopping() {
            tracing::debug!(addr = %remote_addr, "dropping inbound connection: transport stopping");
            return;
        }
        let connection = self.open_connection(stream, remote_addr, None);
        tracing::debug!(
            connection_id = %connection.id(),
            addr = %connection.remote_addr(),
            "inbound connection awaiting open handshake"
        );
    }

    /// Decide on a peer's Open request for `connection`.
    ///
    /// Promotion into the pool goes through the pool's entry API, so two
    /// concurrent handshakes for the same id cannot both succeed.
    pub fn handle_open_handshake(
        &self,
        connection: &Arc<PeerConnection>,
        node_id: NodeId,
    ) -> OpenStatus {
        if self.is_stopping() {
            return OpenStatus::ConnectionClosed;
        }
        let Some(member) = self.inner.discovery.get_member(&node_id) else {
            tracing::warn!(
                node_id = %node_id,
                addr = %connection.remote_addr(),
                "rejecting open handshake from unknown member"
            );
            return OpenStatus::UnknownMember;
        };
        if connection.is_dialing_side() {
            tracing::warn!(
                node_id = %node_id,
                connection_id = %connection.id(),
                "rejecting open handshake on a connection we dialed"
            );
            return OpenStatus::ConnectionAlreadyExists;
        }
        if connection.node_id().is_some() {
            return OpenStatus::ConnectionAlreadyExists;
        }

        match self.inner.pool.entry(node_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_connected() {
                    tracing::info!(
                        node_id = %node_id,
                        connection_id = %connection.id(),
                        "rejecting open handshake: connection already exists"
                    );
                    return OpenStatus::ConnectionAlreadyExists;
                }
                if connection.is_disposed() {
                    slot.remove();
                    connection.dispose();
                    return OpenStatus::ConnectionClosed;
                }
                connection.bind_node_id(node_id.clone());
                let _stale = slot.insert(connection.clone());
            }
            Entry::Vacant(slot) => {
                if connection.is_disposed() {
                    drop(slot);
                    connection.dispose();
                    return OpenStatus::ConnectionClosed;
                }
                connection.bind_node_id(node_id.clone());
                slot.insert(connection.clone());
            }
        }

        connection.refresh_liveness(self.now_millis());
        tracing::info!(
            node_id = %node_id,
            connection_id = %connection.id(),
            addr = %connection.remote_addr(),
            "member connected"
        );
        connection.notify_listeners("on_opening_handshake_completed", |l| {
            l.on_opening_handshake_completed(&member)
        });
        self.refresh_connected_to_all();
        OpenStatus::Success
    }

    /// The peer announced it is closing `connection`.
    pub fn handle_close_handshake(&self, connection: &Arc<PeerConnection>) -> CloseStatus {
        connection.set_closing();
        tracing::info!(
            node_id = ?connection.node_id(),
            connection_id = %connection.id(),
            "peer is closing the connection"
        );
        connection.notify_listeners("on_closing_handshake_completed", |l| {
            l.on_closing_handshake_completed()
        });
        self.refresh_connected_to_all();
        CloseStatus::Success
    }

    /// A dialing peer proved it is alive.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownKeepaliveSender`] when `node_id` has no
    /// pooled connection.
    pub fn keepalive(&self, node_id: &NodeId) -> Result<(), TransportError> {
        match self.inner.pool.get(node_id) {
            Some(connection) => {
                connection.refresh_liveness(self.now_millis());
                Ok(())
            }
            None => Err(TransportError::UnknownKeepaliveSender {
                node_id: node_id.clone(),
            }),
        }
    }

    fn on_open_request(&self, connection: &Arc<PeerConnection>, frame: &Frame) {
        let reply = match OpenRequest::decode(&frame.payload) {
            Ok(request) => {
                let status = self.handle_open_handshake(connection, request.node_id);
                Frame::response_to(frame, status.encode())
            }
            Err(err) => Frame::error_to(frame, &err.to_string()),
        };
        send_reply(connection, &reply);
    }

    fn on_close_request(&self, connection: &Arc<PeerConnection>, frame: &Frame) {
        let reply = match CloseReason::decode(&frame.payload) {
            Ok(reason) => {
                tracing::debug!(connection_id = %connection.id(), ?reason, "close handshake received");
                Frame::response_to(frame, self.handle_close_handshake(connection).encode())
            }
            Err(err) => Frame::error_to(frame, &err.to_string()),
        };
        send_reply(connection, &reply);
    }

    fn on_keepalive_request(&self, connection: &Arc<PeerConnection>, frame: &Frame) {
        let result = match connection.node_id() {
            Some(node_id) => self.keepalive(node_id).map_err(|err| err.to_string()),
            None => Err("keepalive before open handshake".to_string()),
        };
        let reply = match result {
            Ok(()) => Frame::response_to(frame, Bytes::new()),
            Err(message) => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    addr = %connection.remote_addr(),
                    error = %message,
                    "rejecting keepalive"
                );
                Frame::error_to(frame, &message)
            }
        };
        send_reply(connection, &reply);
    }

    fn on_application_request(&self, connection: &Arc<PeerConnection>, frame: Frame) {
        let Some(from) = connection.node_id().cloned() else {
            send_reply(
                connection,
                &Frame::error_to(&frame, "connection has not completed the open handshake"),
            );
            return;
        };
        let handler = self.inner.request_handler.read().clone();
        let connection = connection.clone();
        let task_name = format!("request-{from}");
        self.inner.providers.task().spawn_task(&task_name, async move {
            let reply = match handler.handle_request(from, frame.payload.clone()).await {
                Ok(payload) => Frame::response_to(&frame, payload),
                Err(message) => Frame::error_to(&frame, &message),
            };
            send_reply(&connection, &reply);
        });
    }
}

fn send_reply(connection: &PeerConnection, reply: &Frame) {
    if let Err(err) = connection.send_frame(reply) {
        tracing::debug!(
            connection_id = %connection.id(),
            request_id = reply.request_id,
            error = %err,
            "failed to send reply"
        );
    }
}

impl<P: Providers> FrameDispatcher for TransportManager<P> {
    fn on_request(&self, connection: &Arc<PeerConnection>, frame: Frame) {
        match frame.kind {
            FrameKind::Open => self.on_open_request(connection, &frame),
            FrameKind::Close => self.on_close_request(connection, &frame),
            FrameKind::Keepalive => self.on_keepalive_request(connection, &frame),
            FrameKind::Application => self.on_application_request(connection, frame),
        }
    }

    fn on_closed(&self, connection: &Arc<PeerConnection>, exit: DriverExit) {
        self.on_connection_closed(connection, &exit);
    }
}
