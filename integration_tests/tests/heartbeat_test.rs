use std::time::Duration;

use integration_tests::{init_test_logging, mock_node::MockNode, sim_bus::SimBus};
use opencan_client::bus::SharedReceiver;
use opencan_client::{HeartbeatEvent, HeartbeatMonitor};
use opencan_common::messages::NmtState;
use opencan_common::NodeId;
use tokio::sync::broadcast;

fn node(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

async fn next_event(
    events: &mut broadcast::Receiver<HeartbeatEvent>,
    within: Duration,
) -> Option<HeartbeatEvent> {
    tokio::time::timeout(within, events.recv()).await.ok()?.ok()
}

#[tokio::test]
#[serial_test::serial]
async fn test_heartbeat_lifecycle() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(3), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = HeartbeatMonitor::with_check_interval(shared.create_rx(), Duration::from_millis(50));
    monitor.monitor(node(3), Duration::from_millis(200));
    let mut events = monitor.subscribe();

    // First heartbeat: received event, watch goes alive
    server.emit_heartbeat(NmtState::Operational).await;
    match next_event(&mut events, Duration::from_millis(500)).await {
        Some(HeartbeatEvent::Received { node, state, .. }) => {
            assert_eq!(3, node);
            assert_eq!(NmtState::Operational, state);
        }
        other => panic!("Expected Received event, got {other:?}"),
    }
    let watch = monitor.watch(node(3)).unwrap();
    assert!(watch.alive);
    assert_eq!(NmtState::Operational, watch.last_state);

    // Silence: exactly one timeout event per alive-to-dead transition
    match next_event(&mut events, Duration::from_millis(600)).await {
        Some(HeartbeatEvent::Timeout {
            node,
            last_state,
            elapsed,
        }) => {
            assert_eq!(3, node);
            assert_eq!(NmtState::Operational, last_state);
            assert!(elapsed >= Duration::from_millis(200));
        }
        other => panic!("Expected Timeout event, got {other:?}"),
    }
    assert!(!monitor.watch(node(3)).unwrap().alive);
    assert!(
        next_event(&mut events, Duration::from_millis(300)).await.is_none(),
        "A dead node must not produce further timeout events"
    );

    // A new heartbeat re-arms the watch
    server.emit_heartbeat(NmtState::PreOperational).await;
    match next_event(&mut events, Duration::from_millis(500)).await {
        Some(HeartbeatEvent::Received { state, .. }) => {
            assert_eq!(NmtState::PreOperational, state);
        }
        other => panic!("Expected Received event, got {other:?}"),
    }
    assert!(monitor.watch(node(3)).unwrap().alive);

    // And a second dormant period produces a second timeout
    match next_event(&mut events, Duration::from_millis(600)).await {
        Some(HeartbeatEvent::Timeout { last_state, .. }) => {
            assert_eq!(NmtState::PreOperational, last_state);
        }
        other => panic!("Expected second Timeout event, got {other:?}"),
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_unwatched_nodes_are_ignored() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(5), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = HeartbeatMonitor::with_check_interval(shared.create_rx(), Duration::from_millis(50));
    monitor.monitor(node(3), Duration::from_millis(200));
    let mut events = monitor.subscribe();

    server.emit_heartbeat(NmtState::Operational).await;
    assert!(next_event(&mut events, Duration::from_millis(200)).await.is_none());
    assert!(monitor.watch(node(5)).is_none());
}

#[tokio::test]
#[serial_test::serial]
async fn test_stop_removes_watch() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(3), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = HeartbeatMonitor::with_check_interval(shared.create_rx(), Duration::from_millis(50));
    monitor.monitor(node(3), Duration::from_millis(100));
    let mut events = monitor.subscribe();

    server.emit_heartbeat(NmtState::Operational).await;
    assert!(next_event(&mut events, Duration::from_millis(500)).await.is_some());

    monitor.stop(node(3));
    assert!(monitor.watch(node(3)).is_none());
    // No timeout fires for a removed watch
    assert!(next_event(&mut events, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
#[serial_test::serial]
async fn test_monitor_replaces_watch() {
    init_test_logging();
    let bus = SimBus::new();
    let _server = MockNode::spawn(node(3), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = HeartbeatMonitor::with_check_interval(shared.create_rx(), Duration::from_millis(50));
    monitor.monitor(node(3), Duration::from_millis(100));
    monitor.monitor(node(3), Duration::from_millis(900));

    let watch = monitor.watch(node(3)).unwrap();
    assert_eq!(Duration::from_millis(900), watch.timeout);
    assert!(!watch.alive);
    assert!(watch.last_rx.is_none());
}
