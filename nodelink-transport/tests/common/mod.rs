//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use nodelink_transport::{
    LifecycleListener, Member, NodeId, PeerConnection, StaticDiscovery, TokioProviders,
    TransportConfig, TransportManager,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Millisecond timings so a whole scenario runs in well under a second.
pub fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_listen("127.0.0.1", 0)
        .with_keepalive(ms(100), ms(400))
        .with_keepalive_tick(ms(20))
        .with_reconnect_interval(ms(50))
        .with_retry_backoff(ms(50), ms(200))
        .with_round_trip_timeouts(ms(500))
        .with_request_timeout(ms(1000))
}

pub struct TestNode {
    pub manager: TransportManager<TokioProviders>,
    pub discovery: Arc<StaticDiscovery>,
    pub member: Member,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.member.node_id.clone()
    }

    pub fn knows(&self, other: &TestNode) {
        self.discovery.add_member(other.member.clone());
    }

    pub fn connection_to(&self, other: &TestNode) -> Option<Arc<PeerConnection>> {
        self.manager.member_connection(&other.id())
    }

    pub fn is_connected_to(&self, other: &TestNode) -> bool {
        self.manager.is_member_connected(&other.id())
    }
}

/// Start a node listening on an ephemeral loopback port.
pub async fn start_node(id: &str, config: TransportConfig) -> TestNode {
    let discovery = Arc::new(StaticDiscovery::new(Member::new(id, "127.0.0.1", config.port)));
    let manager =
        TransportManager::new(TokioProviders::new(), config, discovery.clone()).expect("manager");
    let port = manager.start().await.expect("start");
    TestNode {
        manager,
        discovery,
        member: Member::new(id, "127.0.0.1", port),
    }
}

/// Make both nodes known to each other.
pub fn introduce(a: &TestNode, b: &TestNode) {
    a.knows(b);
    b.knows(a);
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(ms(10)).await;
    }
}

/// Reserve a loopback port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Records lifecycle events by name. Data events are left out.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.as_str() == name).count()
    }

    pub fn factory(&self) -> impl Fn() -> Box<dyn LifecycleListener> + Send + Sync + 'static {
        let log = self.clone();
        move || Box::new(log.clone()) as Box<dyn LifecycleListener>
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl LifecycleListener for EventLog {
    fn on_connection_open(&self, _connection: &PeerConnection) -> anyhow::Result<()> {
        self.push("open".to_string());
        Ok(())
    }

    fn on_opening_handshake_completed(&self, member: &Member) -> anyhow::Result<()> {
        self.push(format!("handshake:{}", member.node_id));
        Ok(())
    }

    fn on_closing_handshake_completed(&self) -> anyhow::Result<()> {
        self.push("closing".to_string());
        Ok(())
    }

    fn on_connection_closed(&self) -> anyhow::Result<()> {
        self.push("closed".to_string());
        Ok(())
    }
}
