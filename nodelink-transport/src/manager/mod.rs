//! Transport manager: owns the connection pool and drives dialing,
//! handshakes, keepalive and reconnection.
//!
//! # State
//!
//! | map         | key          | holds                                          |
//! |-------------|--------------|------------------------------------------------|
//! | pool        | `NodeId`     | the single trusted connection per peer         |
//! | live        | connection id| every socket with a running driver             |
//! | dialing     | `NodeId`     | peers with an outbound attempt in flight       |
//! | retries     | `NodeId`     | consecutive socket-level dial failures         |
//!
//! A connection enters the pool only after a successful Open handshake and
//! leaves it through remove-if-same-connection, so a late close never evicts
//! a newer winner.
//!
//! # Simultaneous dialing
//!
//! Pool-slot occupancy decides: whichever handshake completes first for a
//! peer keeps the slot, on either side. A later Open for the same id is
//! answered `CONNECTION_ALREADY_EXISTS`, and a dialer that gets `SUCCESS`
//! while the slot is already held leaves its socket unpooled. The peer
//! pooled that socket when it answered, so it stays open for the peer.

mod dial;
mod inbound;
mod keepalive;
mod lifecycle;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use nodelink_core::{Discovery, NetworkProvider, NodeId, Providers, TaskProvider, TimeProvider};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::endpoint::ListeningEndpoint;
use crate::error::TransportError;
use crate::peer::driver::drive_connection;
use crate::peer::{ConnectionId, LifecycleListenerFactory, PeerConnection};
use crate::rpc::{RejectingHandler, RequestHandler, RpcError};
use crate::wire::FrameKind;

/// Handle to one node's transport. Cheap to clone; all clones share state.
///
/// Background tasks hold clones, so call [`TransportManager::stop`] to
/// release them.
pub struct TransportManager<P: Providers> {
    inner: Arc<Inner<P>>,
}

impl<P: Providers> Clone for TransportManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<P: Providers> {
    providers: P,
    config: TransportConfig,
    discovery: Arc<dyn Discovery>,

    pool: DashMap<NodeId, Arc<PeerConnection>>,
    live: DashMap<ConnectionId, Arc<PeerConnection>>,
    next_connection_id: AtomicU64,
    dialing: DashSet<NodeId>,
    retries: DashMap<NodeId, u32>,

    listener_factories: RwLock<Vec<Arc<dyn LifecycleListenerFactory>>>,
    request_handler: RwLock<Arc<dyn RequestHandler>>,

    endpoint: Mutex<Option<ListeningEndpoint>>,
    local_port: OnceLock<u16>,
    started: AtomicBool,
    stopping: AtomicBool,
    /// Cancels the keepalive loop and every scheduled retry or reconnect.
    shutdown: CancellationToken,

    connected_to_all_lock: Mutex<()>,
    connected_to_all: AtomicBool,
}

/// Result of trying to put a handshaken connection into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promotion {
    /// The connection now owns the slot.
    Promoted,
    /// An active connection keeps the slot.
    Superseded,
    /// The candidate was disposed before it could be pooled.
    Closed,
}

impl<P: Providers> TransportManager<P> {
    /// Create a manager. Nothing is bound or dialed until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, or when transport security is
    /// requested on top of a plain network provider.
    pub fn new(
        providers: P,
        config: TransportConfig,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        if config.requires_security() && !providers.network().is_secure() {
            return Err(TransportError::SecurityUnavailable);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                providers,
                config,
                discovery,
                pool: DashMap::new(),
                live: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                dialing: DashSet::new(),
                retries: DashMap::new(),
                listener_factories: RwLock::new(Vec::new()),
                request_handler: RwLock::new(Arc::new(RejectingHandler)),
                endpoint: Mutex::new(None),
                local_port: OnceLock::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                connected_to_all_lock: Mutex::new(()),
                connected_to_all: AtomicBool::new(false),
            }),
        })
    }

    /// Bind the listening endpoint and start the keepalive loop.
    ///
    /// Returns the port actually bound, which differs from the configured
    /// one when auto-increment kicked in.
    pub async fn start(&self) -> Result<u16, TransportError> {
        if self.is_stopping() {
            return Err(TransportError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }

        let bound = ListeningEndpoint::bind(
            &self.inner.config,
            self.inner.providers.network(),
            self.inner.providers.time(),
        )
        .await?;
        let port = bound.local_port();
        let _ = self.inner.local_port.set(port);

        let manager = self.clone();
        let endpoint = bound.serve(
            self.inner.providers.task(),
            self.inner.providers.time(),
            move |stream, addr| manager.accept_connection(stream, addr),
        );
        *self.inner.endpoint.lock() = Some(endpoint);

        self.spawn_keepalive_loop();
        tracing::info!(
            node_id = %self.local_node_id(),
            port,
            "transport started"
        );
        Ok(port)
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Port of the listening endpoint, once started.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.local_port.get().copied()
    }

    /// Id of the local node.
    pub fn local_node_id(&self) -> NodeId {
        self.inner.discovery.local_member().node_id
    }

    /// Whether [`Self::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Register a factory whose listeners are bound to every connection
    /// created from now on.
    pub fn register_lifecycle_listener_factory<F>(&self, factory: F)
    where
        F: LifecycleListenerFactory,
    {
        self.inner.listener_factories.write().push(Arc::new(factory));
    }

    /// Install the handler for application requests.
    pub fn set_request_handler<H>(&self, handler: H)
    where
        H: RequestHandler,
    {
        *self.inner.request_handler.write() = Arc::new(handler);
    }

    /// The pooled connection to `node_id`, if it is still usable.
    pub fn member_connection(&self, node_id: &NodeId) -> Option<Arc<PeerConnection>> {
        self.inner
            .pool
            .get(node_id)
            .filter(|connection| connection.is_connected())
            .map(|connection| connection.value().clone())
    }

    /// Whether a pooled, connected and not closing connection to `node_id` exists.
    pub fn is_member_connected(&self, node_id: &NodeId) -> bool {
        self.inner
            .pool
            .get(node_id)
            .is_some_and(|connection| connection.is_connected() && !connection.is_closing())
    }

    /// Ids of every pooled peer, sorted.
    pub fn pooled_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.pool.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of sockets with a running driver, pooled or not.
    pub fn live_connection_count(&self) -> usize {
        self.inner.live.len()
    }

    /// Consecutive socket-level dial failures towards `node_id`.
    pub fn retry_count(&self, node_id: &NodeId) -> u32 {
        self.inner.retries.get(node_id).map(|r| *r).unwrap_or(0)
    }

    /// Whether an outbound attempt towards `node_id` is in flight.
    pub fn is_dialing(&self, node_id: &NodeId) -> bool {
        self.inner.dialing.contains(node_id)
    }

    /// Cached result of the last "connected to every known member" check.
    pub fn has_connected_to_all_members(&self) -> bool {
        self.inner.connected_to_all.load(Ordering::Acquire)
    }

    /// Recompute whether every non-local id in `all_known_ids` has a usable
    /// pooled connection.
    pub fn update_has_connected_to_all_members<'a, I>(&self, all_known_ids: I)
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let _guard = self.inner.connected_to_all_lock.lock();
        let connected = !self.is_stopping()
            && all_known_ids
                .into_iter()
                .filter(|id| !self.inner.discovery.is_local_node_id(id))
                .all(|id| self.is_member_connected(id));
        self.inner.connected_to_all.store(connected, Ordering::Release);
    }

    fn refresh_connected_to_all(&self) {
        let members = self.inner.discovery.all_known_members();
        self.update_has_connected_to_all_members(members.keys());
    }

    /// Send an application request and wait for the reply.
    ///
    /// Goes over `connection` when given, otherwise over the pooled
    /// connection to `node_id`. Bounded by `request_timeout`.
    pub async fn request_response(
        &self,
        node_id: &NodeId,
        payload: Bytes,
        connection: Option<Arc<PeerConnection>>,
    ) -> Result<Bytes, RpcError> {
        let connection = match connection {
            Some(connection) => connection,
            None => self
                .member_connection(node_id)
                .ok_or_else(|| RpcError::NotConnected {
                    node_id: node_id.clone(),
                })?,
        };
        self.request_on(
            &connection,
            FrameKind::Application,
            payload,
            self.inner.config.request_timeout,
        )
        .await
    }

    async fn request_on(
        &self,
        connection: &PeerConnection,
        kind: FrameKind,
        payload: Bytes,
        timeout: std::time::Duration,
    ) -> Result<Bytes, RpcError> {
        self.inner
            .providers
            .time()
            .timeout(timeout, connection.request(kind, payload))
            .await
            .unwrap_or(Err(RpcError::Timeout))
    }

    fn now_millis(&self) -> u64 {
        self.inner.providers.time().now_millis()
    }

    /// Wrap a fresh socket, bind its listeners and start its driver.
    fn open_connection<S>(
        &self,
        stream: S,
        remote_addr: String,
        dial_target: Option<NodeId>,
    ) -> Arc<PeerConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let listeners = self
            .inner
            .listener_factories
            .read()
            .iter()
            .map(|factory| factory.create())
            .collect();
        let id = ConnectionId::new(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (connection, outbound) =
            PeerConnection::new(id, remote_addr, dial_target, listeners, self.now_millis());
        self.inner.live.insert(connection.id(), connection.clone());

        connection.notify_listeners("on_connection_open", |l| l.on_connection_open(&connection));

        let task_name = format!("driver-{}", connection.id());
        self.inner.providers.task().spawn_task(
            &task_name,
            drive_connection(connection.clone(), stream, outbound, self.clone()),
        );
        connection
    }

    /// Pool a dialing-side connection that completed its Open handshake.
    ///
    /// Insert-if-absent-or-stale: an active entry always keeps its slot.
    fn try_promote(&self, connection: &Arc<PeerConnection>, node_id: &NodeId) -> Promotion {
        use dashmap::mapref::entry::Entry;

        match self.inner.pool.entry(node_id.clone()) {
            Entry::Occupied(mut slot) => {
                if connection.is_disposed() {
                    return Promotion::Closed;
                }
                if slot.get().is_connected() {
                    return Promotion::Superseded;
                }
                let _stale = slot.insert(connection.clone());
            }
            Entry::Vacant(slot) => {
                if connection.is_disposed() {
                    return Promotion::Closed;
                }
                slot.insert(connection.clone());
            }
        }
        Promotion::Promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_core::{Member, StaticDiscovery, TokioProviders};

    pub(super) fn manager_for(local: &str, peers: &[&str]) -> (TransportManager<TokioProviders>, Arc<StaticDiscovery>) {
        let discovery = Arc::new(StaticDiscovery::with_members(
            Member::new(local, "127.0.0.1", 0),
            peers.iter().map(|id| Member::new(*id, "127.0.0.1", 1)),
        ));
        let config = TransportConfig::default().with_listen("127.0.0.1", 0);
        let manager = TransportManager::new(TokioProviders::new(), config, discovery.clone())
            .expect("manager");
        (manager, discovery)
    }

    pub(super) fn raw_connection(dial_target: Option<&str>) -> Arc<PeerConnection> {
        let (connection, _outbound) = PeerConnection::new(
            ConnectionId::unique(),
            "127.0.0.1:9",
            dial_target.map(NodeId::new),
            Vec::new(),
            0,
        );
        connection
    }

    #[test]
    fn test_security_requires_secure_provider() {
        let discovery = Arc::new(StaticDiscovery::new(Member::new("a", "127.0.0.1", 0)));
        let config = TransportConfig::default().with_security(false, true);
        let result = TransportManager::new(TokioProviders::new(), config, discovery);
        assert!(matches!(result, Err(TransportError::SecurityUnavailable)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let discovery = Arc::new(StaticDiscovery::new(Member::new("a", "127.0.0.1", 0)));
        let config = TransportConfig::default().with_keepalive(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(1),
        );
        let result = TransportManager::new(TokioProviders::new(), config, discovery);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[tokio::test]
    async fn test_promote_into_empty_slot() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(Some("b"));
        assert!(conn.bind_node_id(NodeId::new("b")));

        assert_eq!(manager.try_promote(&conn, &NodeId::new("b")), Promotion::Promoted);
        assert!(manager.is_member_connected(&NodeId::new("b")));
    }

    #[tokio::test]
    async fn test_stale_entry_is_replaced() {
        let (manager, _) = manager_for("a", &["b"]);
        let stale = raw_connection(Some("b"));
        manager.inner.pool.insert(NodeId::new("b"), stale.clone());
        stale.dispose();

        let fresh = raw_connection(Some("b"));
        assert_eq!(manager.try_promote(&fresh, &NodeId::new("b")), Promotion::Promoted);
        assert_eq!(
            manager.member_connection(&NodeId::new("b")).map(|c| c.id()),
            Some(fresh.id())
        );
    }

    #[tokio::test]
    async fn test_active_entry_keeps_its_slot() {
        let (manager, _) = manager_for("a", &["b"]);
        let inbound = raw_connection(None);
        assert!(inbound.bind_node_id(NodeId::new("b")));
        manager.inner.pool.insert(NodeId::new("b"), inbound.clone());

        let outbound = raw_connection(Some("b"));
        assert!(outbound.bind_node_id(NodeId::new("b")));
        assert_eq!(manager.try_promote(&outbound, &NodeId::new("b")), Promotion::Superseded);

        assert!(inbound.is_connected());
        assert!(!inbound.is_closing());
        assert_eq!(
            manager.member_connection(&NodeId::new("b")).map(|c| c.id()),
            Some(inbound.id())
        );
        // The superseded side is left untouched
        assert!(outbound.is_connected());
        assert!(!outbound.is_closing());
    }

    #[tokio::test]
    async fn test_node_ids_do_not_decide_the_slot() {
        // "z" > "b" and "a" < "b": the occupant wins either way
        for local in ["a", "z"] {
            let (manager, _) = manager_for(local, &["b"]);
            let first = raw_connection(Some("b"));
            assert_eq!(manager.try_promote(&first, &NodeId::new("b")), Promotion::Promoted);

            let inbound = raw_connection(None);
            assert_eq!(
                manager.handle_open_handshake(&inbound, NodeId::new("b")),
                crate::handshake::OpenStatus::ConnectionAlreadyExists
            );
            assert_eq!(
                manager.member_connection(&NodeId::new("b")).map(|c| c.id()),
                Some(first.id())
            );
        }
    }

    #[tokio::test]
    async fn test_disposed_candidate_is_not_pooled() {
        let (manager, _) = manager_for("a", &["b"]);
        let conn = raw_connection(Some("b"));
        conn.dispose();
        assert_eq!(manager.try_promote(&conn, &NodeId::new("b")), Promotion::Closed);
        assert!(manager.pooled_node_ids().is_empty());
    }

    #[tokio::test]
    async fn test_connected_to_all_members() {
        let (manager, discovery) = manager_for("a", &["b", "c"]);
        let ids = [NodeId::new("a"), NodeId::new("b"), NodeId::new("c")];
        manager.update_has_connected_to_all_members(ids.iter());
        assert!(!manager.has_connected_to_all_members());

        for id in ["b", "c"] {
            let conn = raw_connection(Some(id));
            manager.inner.pool.insert(NodeId::new(id), conn);
        }
        manager.update_has_connected_to_all_members(ids.iter());
        assert!(manager.has_connected_to_all_members());

        discovery.add_member(Member::new("d", "127.0.0.1", 1));
        manager.refresh_connected_to_all();
        assert!(!manager.has_connected_to_all_members());
    }

    #[tokio::test]
    async fn test_connection_ids_are_per_manager() {
        let (first, _) = manager_for("a", &["b"]);
        let (second, _) = manager_for("b", &["a"]);

        let (local, _remote) = tokio::io::duplex(64);
        let a1 = first.open_connection(local, "duplex".to_string(), None);
        let (local, _remote) = tokio::io::duplex(64);
        let a2 = first.open_connection(local, "duplex".to_string(), None);
        let (local, _remote) = tokio::io::duplex(64);
        let b1 = second.open_connection(local, "duplex".to_string(), None);

        assert_eq!(a1.id(), ConnectionId::new(1));
        assert_eq!(a2.id(), ConnectionId::new(2));
        assert_eq!(b1.id(), ConnectionId::new(1));
        assert_eq!(first.live_connection_count(), 2);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_request_to_unconnected_member() {
        let (manager, _) = manager_for("a", &["b"]);
        let result = manager
            .request_response(&NodeId::new("b"), Bytes::new(), None)
            .await;
        assert_eq!(
            result,
            Err(RpcError::NotConnected {
                node_id: NodeId::new("b")
            })
        );
    }
}
