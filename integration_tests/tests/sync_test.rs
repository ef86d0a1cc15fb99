use std::time::Duration;

use integration_tests::{init_test_logging, sim_bus::SimBus};
use opencan_client::bus::SharedSender;
use opencan_client::SyncProducer;
use opencan_common::{AsyncCanReceiver, CanFrame};

fn sync_frames(tap: &mut integration_tests::sim_bus::SimBusReceiver) -> Vec<CanFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = tap.try_recv() {
        if frame.id().raw() == 0x080 {
            frames.push(frame);
        }
    }
    frames
}

#[tokio::test]
#[serial_test::serial]
async fn test_counterless_sync_is_empty() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let mut producer = SyncProducer::new(SharedSender::new(bus.new_sender()), Duration::from_millis(50));

    producer.start();
    assert!(producer.is_running());
    tokio::time::sleep(Duration::from_millis(180)).await;
    producer.stop();

    let frames = sync_frames(&mut tap);
    assert!(frames.len() >= 3, "expected at least 3 SYNCs, got {}", frames.len());
    assert!(frames.iter().all(|f| f.data().is_empty()));
}

#[tokio::test]
#[serial_test::serial]
async fn test_sync_counter_sequence() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let mut producer =
        SyncProducer::with_counter(SharedSender::new(bus.new_sender()), Duration::from_millis(50));

    producer.start();
    tokio::time::sleep(Duration::from_millis(180)).await;
    producer.stop();

    let frames = sync_frames(&mut tap);
    assert!(frames.len() >= 3);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(&[(i + 1) as u8], frame.data());
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_restart_resets_counter() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let mut producer =
        SyncProducer::with_counter(SharedSender::new(bus.new_sender()), Duration::from_millis(50));

    producer.start();
    tokio::time::sleep(Duration::from_millis(130)).await;

    // Start while running is a restart: stop, zero, start
    producer.start();
    tokio::time::sleep(Duration::from_millis(80)).await;
    producer.stop();

    let frames = sync_frames(&mut tap);
    assert!(frames.len() >= 3);
    // The counter went back to 1 somewhere after the restart
    let restarted = frames
        .windows(2)
        .any(|pair| pair[0].data()[0] > 1 && pair[1].data() == [1]);
    assert!(restarted, "expected the counter to reset to 1 after restart");
}

#[tokio::test]
#[serial_test::serial]
async fn test_send_failure_does_not_stop_the_timer() {
    init_test_logging();
    let bus = SimBus::new();
    let mut tap = bus.new_receiver();
    let mut producer = SyncProducer::new(SharedSender::new(bus.new_sender()), Duration::from_millis(50));

    bus.disconnect();
    producer.start();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Nothing went out while disconnected, but the timer kept running
    assert!(sync_frames(&mut tap).is_empty());
    bus.connect();
    tokio::time::sleep(Duration::from_millis(150)).await;
    producer.stop();

    assert!(!sync_frames(&mut tap).is_empty());
}
