//! Per-socket connection state.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use nodelink_core::NodeId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::listener::LifecycleListener;
use crate::rpc::{PendingGuard, PendingReplies, RpcError};
use crate::wire::{encode_frame, Frame, FrameFlag, FrameKind};

/// Identity of one socket, unique within its transport manager.
///
/// Two connections to the same node never share an id, which is what pool
/// removal compares so a stale close cannot evict a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// A fresh id for connections built outside a manager.
    #[cfg(test)]
    pub(crate) fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One socket to a peer node and everything the transport tracks about it.
///
/// Created as soon as a raw socket exists (accepted or dialed), before any
/// handshake. The peer's node id is bound only once the Open handshake
/// succeeds; until then the connection is never pooled.
pub struct PeerConnection {
    id: ConnectionId,
    remote_addr: String,
    dial_target: Option<NodeId>,
    node_id: OnceLock<NodeId>,
    closing: AtomicBool,
    last_liveness: AtomicU64,
    keepalive_in_flight: AtomicBool,
    listeners: Vec<Box<dyn LifecycleListener>>,
    disposed: CancellationToken,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: PendingReplies,
}

impl PeerConnection {
    /// Wrap a fresh socket. `dial_target` is set on the dialing side only.
    ///
    /// Returns the connection and the receiving end of its outbound frame
    /// queue, which the socket driver owns.
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: impl Into<String>,
        dial_target: Option<NodeId>,
        listeners: Vec<Box<dyn LifecycleListener>>,
        now_millis: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            remote_addr: remote_addr.into(),
            dial_target,
            node_id: OnceLock::new(),
            closing: AtomicBool::new(false),
            last_liveness: AtomicU64::new(now_millis),
            keepalive_in_flight: AtomicBool::new(false),
            listeners,
            disposed: CancellationToken::new(),
            outbound,
            pending: PendingReplies::new(),
        });
        (connection, outbound_rx)
    }

    /// Connection id, unique within the owning manager.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the other end of the socket.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Peer node id, set once the Open handshake succeeded.
    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.get()
    }

    /// Bind the peer node id. Returns false if a different id is already bound.
    pub(crate) fn bind_node_id(&self, node_id: NodeId) -> bool {
        match self.node_id.set(node_id) {
            Ok(()) => true,
            Err(rejected) => self.node_id.get() == Some(&rejected),
        }
    }

    /// The node the dialing side meant to reach.
    pub fn dial_target(&self) -> Option<&NodeId> {
        self.dial_target.as_ref()
    }

    /// Best known identity of the peer: bound id, else the dial target.
    pub fn peer_node_id(&self) -> Option<&NodeId> {
        self.node_id().or(self.dial_target.as_ref())
    }

    /// Whether the local node initiated this connection.
    pub fn is_dialing_side(&self) -> bool {
        self.dial_target.is_some()
    }

    /// Whether a Close handshake was exchanged or a shutdown is in progress.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Last time the peer proved alive, in milliseconds of the manager clock.
    pub fn last_liveness_millis(&self) -> u64 {
        self.last_liveness.load(Ordering::Acquire)
    }

    pub(crate) fn refresh_liveness(&self, now_millis: u64) {
        self.last_liveness.fetch_max(now_millis, Ordering::AcqRel);
    }

    /// Claim the right to send a keepalive probe. False if one is in flight.
    pub(crate) fn try_begin_keepalive(&self) -> bool {
        !self.keepalive_in_flight.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_keepalive(&self) {
        self.keepalive_in_flight.store(false, Ordering::Release);
    }

    /// Whether the socket has been torn down.
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Whether the socket is still usable.
    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
    }

    /// Tear down the socket. Idempotent.
    ///
    /// Outstanding requests fail with [`RpcError::ConnectionClosed`]; the
    /// socket driver notices and runs close detection exactly once.
    pub fn dispose(&self) {
        self.disposed.cancel();
        self.pending.fail_all();
    }

    pub(crate) fn disposed_token(&self) -> &CancellationToken {
        &self.disposed
    }

    /// Number of requests on this connection still waiting for a reply.
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a frame for the socket driver.
    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<(), RpcError> {
        if self.is_disposed() {
            return Err(RpcError::ConnectionClosed);
        }
        let bytes = encode_frame(frame)?;
        self.outbound
            .send(bytes)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// Unbounded; callers wrap it in the time provider's timeout. Dropping
    /// the future releases the reply slot.
    pub(crate) async fn request(&self, kind: FrameKind, payload: Bytes) -> Result<Bytes, RpcError> {
        let (request_id, reply) = self.pending.allocate();
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };
        self.send_frame(&Frame::request(request_id, kind, payload))?;

        tokio::select! {
            biased;
            result = reply => result.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = self.disposed.cancelled() => Err(RpcError::ConnectionClosed),
        }
    }

    /// Route a response or error frame to its waiting request.
    pub(crate) fn complete_request(&self, frame: Frame) {
        let result = match frame.flag {
            FrameFlag::Response => Ok(frame.payload),
            FrameFlag::Error => Err(RpcError::Remote {
                message: String::from_utf8_lossy(&frame.payload).into_owned(),
            }),
            FrameFlag::Request => return,
        };
        if !self.pending.complete(frame.request_id, result) {
            tracing::debug!(
                connection_id = %self.id,
                request_id = frame.request_id,
                "dropping reply with no waiting request"
            );
        }
    }

    /// Invoke `event` on every listener bound to this connection.
    ///
    /// Each call is isolated: an error or panic in one listener is logged
    /// and the remaining listeners still run.
    pub(crate) fn notify_listeners<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn LifecycleListener) -> anyhow::Result<()>,
    {
        for listener in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(
                        connection_id = %self.id,
                        event,
                        error = %err,
                        "lifecycle listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(connection_id = %self.id, event, "lifecycle listener panicked");
                }
            }
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("node_id", &self.node_id.get())
            .field("dialing_side", &self.is_dialing_side())
            .field("closing", &self.is_closing())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::try_decode_frame;
    use bytes::BytesMut;
    use std::sync::atomic::AtomicUsize;

    fn connection() -> (Arc<PeerConnection>, mpsc::UnboundedReceiver<Bytes>) {
        PeerConnection::new(
            ConnectionId::unique(),
            "127.0.0.1:1",
            Some(NodeId::new("b")),
            Vec::new(),
            0,
        )
    }

    fn decode(bytes: Bytes) -> Frame {
        let mut buf = BytesMut::from(&bytes[..]);
        try_decode_frame(&mut buf).expect("decode").expect("complete")
    }

    #[test]
    fn test_node_id_binds_once() {
        let (conn, _) = connection();
        assert!(conn.node_id().is_none());
        assert_eq!(conn.peer_node_id(), Some(&NodeId::new("b")));

        assert!(conn.bind_node_id(NodeId::new("b")));
        assert!(conn.bind_node_id(NodeId::new("b")));
        assert!(!conn.bind_node_id(NodeId::new("c")));
        assert_eq!(conn.node_id(), Some(&NodeId::new("b")));
    }

    #[test]
    fn test_accepting_side_has_no_dial_target() {
        let (conn, _) =
            PeerConnection::new(ConnectionId::unique(), "127.0.0.1:1", None, Vec::new(), 0);
        assert!(!conn.is_dialing_side());
        assert!(conn.peer_node_id().is_none());
    }

    #[test]
    fn test_liveness_never_moves_backwards() {
        let (conn, _) = connection();
        conn.refresh_liveness(100);
        conn.refresh_liveness(50);
        assert_eq!(conn.last_liveness_millis(), 100);
    }

    #[test]
    fn test_single_keepalive_in_flight() {
        let (conn, _) = connection();
        assert!(conn.try_begin_keepalive());
        assert!(!conn.try_begin_keepalive());
        conn.end_keepalive();
        assert!(conn.try_begin_keepalive());
    }

    #[tokio::test]
    async fn test_request_completes_with_response() {
        let (conn, mut outbound) = connection();
        let requester = conn.clone();
        let call = tokio::spawn(async move {
            requester
                .request(FrameKind::Keepalive, Bytes::new())
                .await
        });

        let request = decode(outbound.recv().await.expect("frame"));
        assert_eq!(request.kind, FrameKind::Keepalive);
        assert_eq!(request.flag, FrameFlag::Request);

        conn.complete_request(Frame::response_to(&request, Bytes::from_static(b"ok")));
        let reply = call.await.expect("join");
        assert_eq!(reply, Ok(Bytes::from_static(b"ok")));
        assert_eq!(conn.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let (conn, mut outbound) = connection();
        let requester = conn.clone();
        let call = tokio::spawn(async move {
            requester
                .request(FrameKind::Application, Bytes::new())
                .await
        });

        let request = decode(outbound.recv().await.expect("frame"));
        conn.complete_request(Frame::error_to(&request, "nope"));
        assert_eq!(
            call.await.expect("join"),
            Err(RpcError::Remote {
                message: "nope".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_requests() {
        let (conn, mut outbound) = connection();
        let requester = conn.clone();
        let call = tokio::spawn(async move {
            requester
                .request(FrameKind::Keepalive, Bytes::new())
                .await
        });
        let _ = outbound.recv().await.expect("frame");

        conn.dispose();
        assert_eq!(call.await.expect("join"), Err(RpcError::ConnectionClosed));
        assert!(conn.is_disposed());
        assert_eq!(
            conn.send_frame(&Frame::request(1, FrameKind::Keepalive, Bytes::new())),
            Err(RpcError::ConnectionClosed)
        );
    }

    struct Counting(Arc<AtomicUsize>);

    impl LifecycleListener for Counting {
        fn on_closing_handshake_completed(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl LifecycleListener for Failing {
        fn on_closing_handshake_completed(&self) -> anyhow::Result<()> {
            anyhow::bail!("listener failure")
        }
    }

    struct Panicking;

    impl LifecycleListener for Panicking {
        fn on_closing_handshake_completed(&self) -> anyhow::Result<()> {
            panic!("listener panic")
        }
    }

    #[test]
    fn test_listener_faults_are_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let listeners: Vec<Box<dyn LifecycleListener>> = vec![
            Box::new(Failing),
            Box::new(Counting(calls.clone())),
            Box::new(Panicking),
            Box::new(Counting(calls.clone())),
        ];
        let (conn, _) =
            PeerConnection::new(ConnectionId::unique(), "127.0.0.1:1", None, listeners, 0);

        conn.notify_listeners("on_closing_handshake_completed", |l| {
            l.on_closing_handshake_completed()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
