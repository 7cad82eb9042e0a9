//! Graceful shutdown with the closing handshake.

mod common;

use common::*;
use nodelink_transport::TransportError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_runs_closing_handshake() {
    init_tracing();
    let a = start_node("a", fast_config()).await;
    let b = start_node("b", fast_config()).await;
    let events = EventLog::default();
    b.manager.register_lifecycle_listener_factory(events.factory());
    introduce(&a, &b);
    a.manager.connect_all_known_members();
    assert!(wait_until(ms(2000), || b.is_connected_to(&a)).await);

    a.manager.stop().await;
    assert!(a.manager.is_stopping());
    assert!(a.manager.pooled_node_ids().is_empty());
    assert!(!a.manager.has_connected_to_all_members());

    assert!(wait_until(ms(2000), || events.count("closed") == 1).await);
    let log = events.events();
    let closing = log.iter().position(|e| e == "closing").expect("closing event");
    let closed = log.iter().position(|e| e == "closed").expect("closed event");
    assert!(closing < closed);
    assert!(wait_until(ms(1000), || b.manager.live_connection_count() == 0).await);
    assert_eq!(a.manager.live_connection_count(), 0);

    b.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_node_refuses_connections() {
    init_tracing();
    let a = start_node("a", fast_config()).await;
    let b = start_node("b", fast_config()).await;
    introduce(&a, &b);
    a.manager.stop().await;

    let mut refused = false;
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", a.member.port))
            .await
            .is_err()
        {
            refused = true;
            break;
        }
        tokio::time::sleep(ms(20)).await;
    }
    assert!(refused);

    b.manager.connect_all_known_members();
    assert!(wait_until(ms(2000), || b.manager.retry_count(&a.id()) >= 1).await);
    assert!(!b.is_connected_to(&a));

    b.manager.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    init_tracing();
    let a = start_node("a", fast_config()).await;
    a.manager.stop().await;
    a.manager.stop().await;
    assert!(a.manager.is_stopping());
    assert!(matches!(a.manager.start().await, Err(TransportError::Stopped)));
}

#[tokio::test]
async fn test_stopping_manager_ignores_dial_requests() {
    init_tracing();
    let a = start_node("a", fast_config()).await;
    let b_port = unused_port();
    a.discovery
        .add_member(nodelink_transport::Member::new("b", "127.0.0.1", b_port));
    a.manager.stop().await;

    a.manager.connect_all_known_members();
    assert!(!a.manager.is_dialing(&nodelink_transport::NodeId::new("b")));
}
