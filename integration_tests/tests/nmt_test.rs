use integration_tests::{init_test_logging, sim_bus::SimBus};
use opencan_client::bus::SharedSender;
use opencan_client::NmtMaster;
use opencan_common::{AsyncCanReceiver, NodeId};

fn node(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

#[tokio::test]
async fn test_nmt_commands_encode_on_the_wire() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let master = NmtMaster::new(SharedSender::new(bus.new_sender()));

    master.start(node(1)).await.unwrap();
    master.stop(node(2)).await.unwrap();
    master.enter_preoperational(node(3)).await.unwrap();
    master.reset_node(node(4)).await.unwrap();
    master.reset_communication(node(5)).await.unwrap();

    let expected: [&[u8]; 5] = [
        &[0x01, 0x01],
        &[0x02, 0x02],
        &[0x80, 0x03],
        &[0x81, 0x04],
        &[0x82, 0x05],
    ];
    for payload in expected {
        let frame = tap.recv().await.unwrap();
        assert_eq!(0x000, frame.id().raw());
        assert_eq!(payload, frame.data());
    }
}

#[tokio::test]
async fn test_nmt_broadcast_targets_node_zero() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let master = NmtMaster::new(SharedSender::new(bus.new_sender()));

    master.start_all().await.unwrap();
    master.stop_all().await.unwrap();
    master.enter_preoperational_all().await.unwrap();
    master.reset_all().await.unwrap();

    let expected: [&[u8]; 4] = [&[0x01, 0x00], &[0x02, 0x00], &[0x80, 0x00], &[0x81, 0x00]];
    for payload in expected {
        let frame = tap.recv().await.unwrap();
        assert_eq!(0x000, frame.id().raw());
        assert_eq!(payload, frame.data());
    }
}
