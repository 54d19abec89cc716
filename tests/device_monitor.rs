mod common;

use std::time::Duration;

use common::{hardware, WAIT};
use daqroc_runner_lib::beacon::StatusBeacon;
use daqroc_runner_lib::device::DeviceMonitor;
use serde_json::json;
use tokio::time::timeout;

#[tokio::test]
async fn test_status_check_is_answered() {
    let (protocol, mut firmware) = hardware();
    let monitor = DeviceMonitor::start(protocol);

    firmware.send(json!({"type": "status_check"})).await;
    assert_eq!(firmware.next_command().await, "SERVER_ONLINE");

    let mut state = monitor.state_receiver();
    timeout(WAIT, state.wait_for(|s| s.last_status_check.is_some()))
        .await
        .unwrap()
        .unwrap();
    monitor.stop().await;
}

#[tokio::test]
async fn test_heartbeat_and_chip_registry() {
    let (protocol, mut firmware) = hardware();
    let monitor = DeviceMonitor::start(protocol);

    firmware.send(json!({"type": "heartbeat"})).await;
    firmware
        .send(json!({"type": "chip_status", "chips": [{"id": "LDPC1", "status": "ready"}, {"id": "LDPC2", "status": "busy"}]}))
        .await;
    firmware.send(json!({"type": "chip_status", "chips": [{"id": "LDPC2", "status": "ready"}]})).await;
    firmware.send_raw("garbage").await;

    let mut state = monitor.state_receiver();
    timeout(WAIT, state.wait_for(|s| s.unparseable_lines == 1))
        .await
        .unwrap()
        .unwrap();

    let snapshot = monitor.state();
    assert!(snapshot.last_heartbeat.is_some());
    assert_eq!(snapshot.chip_status("LDPC1"), Some("ready"));
    assert_eq!(snapshot.chip_status("LDPC2"), Some("ready"));
    assert_eq!(snapshot.chip_status("LDPC3"), None);
    monitor.stop().await;
}

#[tokio::test]
async fn test_beacon_announces_periodically() {
    let (protocol, mut firmware) = hardware();
    let beacon = StatusBeacon::start(protocol, Duration::from_millis(50));

    for _ in 0..3 {
        assert_eq!(firmware.next_command().await, "SERVER_ONLINE");
    }

    beacon.stop().await;
    // Drain anything already in flight, then silence
    while firmware.try_next_command(Duration::from_millis(150)).await.is_some() {}
    assert_eq!(firmware.try_next_command(Duration::from_millis(200)).await, None);
}
