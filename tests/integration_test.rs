//! Integration tests for the full socket and discovery flow.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use rfcomm_sockets::bluetooth::fake::FakePlatform;
use rfcomm_sockets::bluetooth::{BluetoothManager, Device, NativeRadioState, SocketState};
use rfcomm_sockets::{CloseReason, Config, RadioState, ServerSocketEvent, SocketEvent, SocketKey};

async fn manager_with_radio_on(fake: &FakePlatform) -> BluetoothManager {
    fake.set_radio(Some(NativeRadioState::On));
    let manager = BluetoothManager::new(fake.platform(), Config::default());
    manager.refresh_adapter().await.unwrap();
    assert_eq!(manager.get_state(), RadioState::On);
    manager
}

async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(value) = rx.try_recv() {
        out.push(value);
    }
    out
}

#[tokio::test]
async fn test_paired_device_reported_once() {
    let fake = FakePlatform::new();
    fake.set_paired(vec![Device::new("A", Some("X".into()))]);
    let manager = manager_with_radio_on(&fake).await;
    let mut discovered = manager.subscribe_discovered();
    let mut gone = manager.subscribe_gone();

    manager.start_discovery().await.unwrap();
    assert!(fake.wait_for_starts(1).await);
    manager.cancel_discovery().await.unwrap();

    let devices = drain(&mut discovered);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, "A");
    assert_eq!(devices[0].name, "X");
    assert!(devices[0].paired);
    assert!(drain(&mut gone).is_empty());
}

#[tokio::test]
async fn test_discovery_start_and_cancel_guards() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;

    let err = manager.cancel_discovery().await.unwrap_err();
    assert_eq!(err.to_string(), "Not discovering");

    manager.start_discovery().await.unwrap();
    let err = manager.start_discovery().await.unwrap_err();
    assert_eq!(err.to_string(), "Already discovering");
    assert!(manager.is_discovering());

    manager.cancel_discovery().await.unwrap();
    assert!(!manager.is_discovering());
}

#[tokio::test]
async fn test_disjoint_cycles_report_gone() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;
    let mut discovered = manager.subscribe_discovered();
    let mut gone = manager.subscribe_gone();

    manager.start_discovery().await.unwrap();
    assert!(fake.wait_for_starts(1).await);
    assert!(fake.sight(Device::new("S1a", Some("one".into()))));
    assert!(fake.sight(Device::new("S1b", Some("two".into()))));
    assert!(fake.complete_enumeration());

    assert!(fake.wait_for_starts(2).await);
    assert!(fake.sight(Device::new("S2a", Some("three".into()))));
    assert!(fake.complete_enumeration());
    assert!(fake.wait_for_starts(3).await);

    let mut seen: Vec<String> = Vec::new();
    for _ in 0..3 {
        seen.push(recv(&mut discovered).await.address);
    }
    assert_eq!(seen, vec!["S1a", "S1b", "S2a"]);

    let mut lost = vec![recv(&mut gone).await.address, recv(&mut gone).await.address];
    lost.sort();
    assert_eq!(lost, vec!["S1a", "S1b"]);
    assert!(drain(&mut gone).is_empty());

    manager.cancel_discovery().await.unwrap();
}

#[tokio::test]
async fn test_sighting_from_previous_cycle() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;
    let mut discovered = manager.subscribe_discovered();
    let mut gone = manager.subscribe_gone();

    manager.start_discovery().await.unwrap();
    assert!(fake.wait_for_starts(1).await);
    assert!(fake.sight(Device::new("A", Some("X".into()))));
    assert!(fake.complete_enumeration());
    assert_eq!(recv(&mut discovered).await.name, "X");

    // Same name again: nothing to report.
    assert!(fake.wait_for_starts(2).await);
    assert!(fake.sight(Device::new("A", Some("X".into()))));
    assert!(fake.complete_enumeration());

    // Renamed: gone under the old name, then discovered under the new one.
    assert!(fake.wait_for_starts(3).await);
    assert!(fake.sight(Device::new("A", Some("Y".into()))));
    let lost = recv(&mut gone).await;
    assert_eq!((lost.address.as_str(), lost.name.as_str()), ("A", "X"));
    let found = recv(&mut discovered).await;
    assert_eq!((found.address.as_str(), found.name.as_str()), ("A", "Y"));

    manager.cancel_discovery().await.unwrap();
    assert!(drain(&mut discovered).is_empty());
    assert!(drain(&mut gone).is_empty());
}

#[tokio::test]
async fn test_radio_loss_resets_discovery_without_gone() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;
    let mut discovered = manager.subscribe_discovered();
    let mut gone = manager.subscribe_gone();
    let mut discovering = manager.subscribe_discovering();

    manager.start_discovery().await.unwrap();
    assert!(recv(&mut discovering).await);
    assert!(fake.wait_for_starts(1).await);
    assert!(fake.sight(Device::new("A", Some("X".into()))));
    assert_eq!(recv(&mut discovered).await.address, "A");

    fake.set_radio(Some(NativeRadioState::Off));
    manager.refresh_adapter().await.unwrap();
    assert!(!recv(&mut discovering).await);

    // Still wanted while the radio is off.
    manager.start_discovery().await.unwrap();

    fake.set_radio(Some(NativeRadioState::On));
    manager.refresh_adapter().await.unwrap();
    assert!(recv(&mut discovering).await);
    assert!(fake.wait_for_starts(2).await);

    // Hard reset: A is new again.
    assert!(fake.sight(Device::new("A", Some("X".into()))));
    assert_eq!(recv(&mut discovered).await.address, "A");
    assert!(drain(&mut gone).is_empty());

    manager.cancel_discovery().await.unwrap();
}

#[tokio::test]
async fn test_open_on_opened_socket_is_rejected() {
    let fake = FakePlatform::new();
    fake.add_service("A");
    let manager = manager_with_radio_on(&fake).await;
    let key = SocketKey::from("k1");

    manager.open(&key, "A").await.unwrap();
    let calls = fake.transport_calls();

    let err = manager.open(&key, "A").await.unwrap_err();
    assert!(err.is_invalid_state());
    assert!(err.to_string().contains("OPENED"));
    assert_eq!(manager.socket_state(&key), SocketState::Opened);
    assert_eq!(fake.transport_calls(), calls);
}

#[tokio::test]
async fn test_socket_lifecycle_with_peer() {
    let fake = FakePlatform::new();
    fake.add_device("A", true, true);
    let manager = manager_with_radio_on(&fake).await;
    let socket = manager.socket("k1");
    let mut events = socket.subscribe();

    socket.open("A").await.unwrap();
    assert_eq!(
        events.recv().await,
        Some(SocketEvent::Connected {
            socket_key: SocketKey::from("k1"),
            address: "A".into()
        })
    );

    let mut peer = fake.take_peer("A").unwrap();
    peer.write_all(b"hello").await.unwrap();
    match events.recv().await {
        Some(SocketEvent::DataReceived { data, .. }) => assert_eq!(data, b"hello"),
        other => panic!("unexpected event: {:?}", other),
    }

    socket.write(b"world").await.unwrap();
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    socket.close().await.unwrap();
    assert_eq!(socket.state(), SocketState::Closed);
    match events.recv().await {
        Some(SocketEvent::Closed { reason, .. }) => assert_eq!(reason, CloseReason::Requested),
        other => panic!("unexpected event: {:?}", other),
    }

    let err = socket.write(b"late").await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid operation for this socket state: CLOSED");
}

#[tokio::test]
async fn test_server_accepts_opened_child() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;
    let server = manager.server_socket("s1");
    let mut events = server.subscribe();

    server.start(&rfcomm_sockets::bluetooth::ListenOptions::from_config(manager.config()))
        .await
        .unwrap();
    let mut peer = fake.incoming("C").unwrap();

    let child = match events.recv().await {
        Some(ServerSocketEvent::Connected {
            socket,
            address,
            name,
            ..
        }) => {
            assert_eq!(address, "C");
            assert_eq!(name, "Unknown");
            socket
        }
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(child.state(), SocketState::Opened);

    child.write(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    manager.stop_server(server.key()).await.unwrap();
    match events.recv().await {
        Some(event @ ServerSocketEvent::Stopped { .. }) => {
            assert_eq!(event.to_json()["hasError"], false);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Accepted sockets outlive the server.
    assert_eq!(child.state(), SocketState::Opened);
}

#[tokio::test]
async fn test_adapter_removal_forces_off() {
    let fake = FakePlatform::new();
    let manager = manager_with_radio_on(&fake).await;
    let mut supported = manager.subscribe_supported();
    let mut states = manager.subscribe_state();

    fake.set_radio(None);
    manager.refresh_adapter().await.unwrap();

    assert!(!recv(&mut supported).await);
    assert_eq!(recv(&mut states).await, RadioState::Off);
    assert!(!manager.get_supported());
}
