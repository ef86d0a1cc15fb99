use std::time::Duration;

use integration_tests::{init_test_logging, mock_node::MockNode, sim_bus::SimBus};
use opencan_client::bus::SharedReceiver;
use opencan_client::EmcyMonitor;
use opencan_common::messages::SyncMessage;
use opencan_common::{AsyncCanSender, NodeId};

fn node(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

#[tokio::test]
async fn test_emcy_decoding_and_retention() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(2), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = EmcyMonitor::new(shared.create_rx());
    let mut events = monitor.subscribe();

    server.emit_emcy(0x1110, 0x04, [1, 2, 3, 4, 5]).await;

    let record = tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .expect("no EMCY event")
        .unwrap();
    assert_eq!(2, record.node);
    assert_eq!(0x1110, record.error_code);
    assert!(record.error_register.temperature());
    assert!(!record.error_register.communication());
    assert_eq!([1, 2, 3, 4, 5], record.manufacturer);

    let latest = monitor.latest(node(2)).unwrap();
    assert_eq!(record, latest);
}

#[tokio::test]
async fn test_latest_record_is_replaced() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(2), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = EmcyMonitor::new(shared.create_rx());

    server.emit_emcy(0x1000, 0x01, [0; 5]).await;
    server.emit_emcy(0x2310, 0x02, [9; 5]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let latest = monitor.latest(node(2)).unwrap();
    assert_eq!(0x2310, latest.error_code);
    assert!(latest.error_register.current());
    assert_eq!(1, monitor.all().len());
}

#[tokio::test]
async fn test_clear_does_not_affect_subscribers() {
    init_test_logging();
    let bus = SimBus::new();
    let server2 = MockNode::spawn(node(2), &bus);
    let server3 = MockNode::spawn(node(3), &bus);

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = EmcyMonitor::new(shared.create_rx());
    let mut events = monitor.subscribe();

    server2.emit_emcy(0x1000, 0x01, [0; 5]).await;
    server3.emit_emcy(0x5000, 0x80, [0; 5]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(2, monitor.all().len());

    monitor.clear(node(2));
    assert!(monitor.latest(node(2)).is_none());
    assert!(monitor.latest(node(3)).is_some());

    monitor.clear_all();
    assert!(monitor.all().is_empty());

    // Subscribers still see everything that was received
    assert_eq!(0x1000, events.recv().await.unwrap().error_code);
    assert_eq!(0x5000, events.recv().await.unwrap().error_code);
}

#[tokio::test]
async fn test_sync_frame_is_not_an_emergency() {
    init_test_logging();
    let bus = SimBus::new();

    let shared = SharedReceiver::new(bus.new_receiver());
    let monitor = EmcyMonitor::new(shared.create_rx());

    // Bare 0x080 is SYNC and must be ignored by the emergency monitor
    let mut sender = bus.new_sender();
    sender.send(SyncMessage { counter: None }.into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(monitor.all().is_empty());
}
