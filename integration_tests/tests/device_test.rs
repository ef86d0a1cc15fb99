use std::time::Duration;

use integration_tests::{init_test_logging, mock_node::MockNode, sim_bus::SimBus};
use opencan_client::{Device, DeviceConfig, NodeConfig};
use opencan_common::messages::NmtState;
use opencan_common::{AsyncCanReceiver, NodeId};

fn node(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

fn fast_config() -> DeviceConfig {
    DeviceConfig {
        sdo_timeout: Duration::from_millis(300),
        heartbeat_check_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_read_u16() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);
    server.set(0x6041, 0, &[0x37, 0x06]);

    let mut tap = bus.new_receiver();
    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    assert_eq!(0x0637, device.read_u16(0x6041, 0).await.unwrap());

    // The request went out on 0x601 with the upload specifier
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut saw_request = false;
    while let Some(frame) = tap.try_recv() {
        if frame.id().raw() == 0x601 {
            assert_eq!(&[0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0], frame.data());
            saw_request = true;
        }
    }
    assert!(saw_request);
}

#[tokio::test]
async fn test_write_u8() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);

    let mut tap = bus.new_receiver();
    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    device.write_u8(0x6040, 0, 0x0F).await.unwrap();
    assert_eq!(Some(vec![0x0F]), server.get(0x6040, 0));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut saw_request = false;
    while let Some(frame) = tap.try_recv() {
        if frame.id().raw() == 0x601 {
            assert_eq!(&[0x2F, 0x40, 0x60, 0x00, 0x0F, 0, 0, 0], frame.data());
            saw_request = true;
        }
    }
    assert!(saw_request);
}

#[tokio::test]
async fn test_sized_reads_tolerate_short_payloads() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);
    server.set(0x3000, 1, &[0xFF]);
    server.set(0x3000, 2, &[0x34, 0x12]);

    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    // Unsigned reads zero-extend, signed reads sign-extend from the bytes
    // the server actually sent
    assert_eq!(0x1234, device.read_u32(0x3000, 2).await.unwrap());
    assert_eq!(-1, device.read_i16(0x3000, 1).await.unwrap());
    assert_eq!(0xFF, device.read_u16(0x3000, 1).await.unwrap());
}

#[tokio::test]
async fn test_nmt_state_tracking() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);
    let mut tap = bus.new_receiver();
    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    assert_eq!(NmtState::PreOperational, device.nmt_state());

    device.start().await.unwrap();
    assert_eq!(NmtState::Operational, device.nmt_state());
    let frame = tap.recv().await.unwrap();
    assert_eq!(0x000, frame.id().raw());
    assert_eq!(&[0x01, 0x01], frame.data());

    device.stop().await.unwrap();
    assert_eq!(NmtState::Stopped, device.nmt_state());

    device.enter_preoperational().await.unwrap();
    assert_eq!(NmtState::PreOperational, device.nmt_state());

    // Resets leave the cached state alone
    device.reset_node().await.unwrap();
    assert_eq!(NmtState::PreOperational, device.nmt_state());

    // The node's own heartbeat writes through to the cached state
    server.emit_heartbeat(NmtState::Stopped).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(NmtState::Stopped, device.nmt_state());
}

#[tokio::test]
async fn test_ping() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);
    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    // The object is unknown to the mock, so the server aborts, which still
    // proves it is present
    assert!(device.ping().await);

    server.set_silent(true);
    assert!(!device.ping().await);
}

#[tokio::test]
async fn test_setup_standard_pdos() {
    init_test_logging();
    let bus = SimBus::new();
    let device = Device::with_config(node(5), bus.new_sender(), bus.new_receiver(), fast_config());

    device.setup_standard_tpdos().unwrap();
    device.setup_standard_rpdos().unwrap();

    for (pdo_number, tpdo_cob, rpdo_cob) in [
        (1u8, 0x185u16, 0x205u16),
        (2, 0x285, 0x305),
        (3, 0x385, 0x405),
        (4, 0x485, 0x505),
    ] {
        assert_eq!(tpdo_cob, device.pdo().tpdo_config(pdo_number).unwrap().cob_id);
        assert_eq!(rpdo_cob, device.pdo().rpdo_config(pdo_number).unwrap().cob_id);
    }
}

#[tokio::test]
async fn test_apply_config() {
    init_test_logging();
    let bus = SimBus::new();
    let server = MockNode::spawn(node(1), &bus);
    let device = Device::with_config(node(1), bus.new_sender(), bus.new_receiver(), fast_config());

    let config = NodeConfig::load_from_str(
        r#"
        [tpdo.1]
        cob = 0x181
        transmission_type = 254
        mappings = [
            { index = 0x6041, sub = 0, bit_length = 16 },
            { index = 0x606C, sub = 0, bit_length = 32 },
        ]

        [rpdo.1]
        cob = 0x201
        mappings = [
            { index = 0x6040, sub = 0, bit_length = 16 },
        ]
        "#,
    )
    .unwrap();

    device.apply_config(&config).await.unwrap();

    // TPDO1 communication parameters landed at 0x1800
    assert_eq!(
        Some(vec![0x81, 0x01, 0x00, 0x00]),
        server.get(0x1800, 1)
    );
    assert_eq!(Some(vec![254]), server.get(0x1800, 2));
    // Mapping values and final count landed at 0x1A00
    assert_eq!(
        Some(0x6041_0010_u32.to_le_bytes().to_vec()),
        server.get(0x1A00, 1)
    );
    assert_eq!(
        Some(0x606C_0020_u32.to_le_bytes().to_vec()),
        server.get(0x1A00, 2)
    );
    assert_eq!(Some(vec![2]), server.get(0x1A00, 0));
    // RPDO1 parameters landed at 0x1400/0x1600
    assert_eq!(
        Some(vec![0x01, 0x02, 0x00, 0x00]),
        server.get(0x1400, 1)
    );
    assert_eq!(Some(vec![1]), server.get(0x1600, 0));

    // The local registries now dispatch and send with the same setup
    assert!(device.pdo().tpdo_config(1).is_some());
    assert!(device.pdo().rpdo_config(1).is_some());
    device.pdo().send_rpdo(1, &[0x0F, 0x00]).await.unwrap();
}
