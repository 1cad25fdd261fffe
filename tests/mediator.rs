//! End-to-end mediator flows, driven through the public API against the
//! in-memory platform. Each test plays the platform's callback side by hand.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gattling::btuuid::{bluetooth_uuid_from_u16, descriptors};
use gattling::error::{AttError, AttErrorCode, ErrorKind};
use gattling::mock::{MockAdapter, MockCall};
use gattling::platform::{CharacteristicDef, ServiceDef};
use gattling::{
    Characteristic, CharacteristicProperties, ClientConfig, Event, GattClient, SessionState,
    Subscription, Uuid, WriteType,
};

const PEER: &str = "AA:BB:CC:DD:EE:FF";
const SERVICE: Uuid = bluetooth_uuid_from_u16(0xffe0);
const DATA: Uuid = bluetooth_uuid_from_u16(0xffe1);
const BARE: Uuid = bluetooth_uuid_from_u16(0xffe2);

const EVENT_WAIT: Duration = Duration::from_secs(1);
const CALL_WAIT: Duration = Duration::from_secs(5);

/// One service; `DATA` carries a CCCD, `BARE` does not.
fn peer_database() -> Vec<ServiceDef> {
    vec![ServiceDef::new(SERVICE)
        .with_characteristic(
            CharacteristicDef::new(DATA, CharacteristicProperties::from_bits(0x3a)).with_cccd(),
        )
        .with_characteristic(CharacteristicDef::new(
            BARE,
            CharacteristicProperties::from_bits(0x0a),
        ))]
}

fn expect_event(events: &Subscription) -> Event {
    events.recv_timeout(EVENT_WAIT).expect("no event within a second")
}

/// Connects and walks the session to Ready, draining the two lifecycle
/// events on the way.
fn bring_ready(mock: &MockAdapter, client: &GattClient) -> Subscription {
    let events = client.events();
    client.connect(PEER).unwrap();
    mock.fire_connected();
    mock.fire_services_discovered(0);
    assert!(matches!(expect_event(&events), Event::Connected));
    assert!(matches!(expect_event(&events), Event::ServicesDiscovered(_)));
    assert_eq!(client.state(), SessionState::Ready);
    events
}

fn ready_client(mock: &MockAdapter) -> (GattClient, Subscription) {
    let client = GattClient::new(Arc::new(mock.clone()));
    let events = bring_ready(mock, &client);
    (client, events)
}

fn data_characteristic(client: &GattClient) -> Characteristic {
    client
        .service(SERVICE)
        .expect("service missing")
        .characteristic(DATA)
        .expect("characteristic missing")
}

fn count_writes(log: &[MockCall]) -> usize {
    log.iter()
        .filter(|call| matches!(call, MockCall::WriteCharacteristic { .. }))
        .count()
}

fn count_descriptor_writes(log: &[MockCall]) -> usize {
    log.iter()
        .filter(|call| matches!(call, MockCall::WriteDescriptor { .. }))
        .count()
}

#[test]
fn a_session_walks_connecting_discovering_ready() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let client = GattClient::new(Arc::new(mock.clone()));
    let events = client.events();

    client.connect(PEER).unwrap();
    assert_eq!(client.state(), SessionState::Connecting);
    assert_eq!(
        mock.calls(),
        vec![MockCall::Connect { address: PEER.into() }]
    );

    mock.fire_connected();
    assert_eq!(client.state(), SessionState::Discovering);
    assert!(matches!(expect_event(&events), Event::Connected));
    assert!(mock.calls().contains(&MockCall::DiscoverServices));

    mock.fire_services_discovered(0);
    assert_eq!(client.state(), SessionState::Ready);
    let Event::ServicesDiscovered(services) = expect_event(&events) else {
        panic!("expected a discovery event");
    };
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid(), SERVICE);
    assert_eq!(services[0].characteristics().len(), 2);
    assert_eq!(client.peer_address().as_deref(), Some(PEER));
}

#[test]
fn failed_discovery_leaves_the_session_discovering() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let client = GattClient::new(Arc::new(mock.clone()));
    let events = client.events();

    client.connect(PEER).unwrap();
    mock.fire_connected();
    assert!(matches!(expect_event(&events), Event::Connected));

    mock.fire_services_discovered(0x81);
    assert_eq!(client.state(), SessionState::Discovering);
    assert!(events.try_recv().is_none());

    // the platform may still come back with a good result later
    mock.fire_services_discovered(0);
    assert_eq!(client.state(), SessionState::Ready);
    assert!(matches!(expect_event(&events), Event::ServicesDiscovered(_)));
}

#[test]
fn an_empty_database_still_reaches_ready() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, Vec::new());
    let (client, _events) = ready_client(&mock);
    assert!(client.services().is_empty());
}

#[test]
fn verified_writes_block_until_acknowledged() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let writer = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[0x2a, 0x01], true)
    });

    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 1));
    assert!(!writer.is_finished());
    mock.ack_characteristic_write(0);
    writer.join().unwrap().unwrap();

    let calls = mock.calls();
    let (value, write_type) = calls
        .iter()
        .find_map(|call| match call {
            MockCall::WriteCharacteristic { value, write_type, .. } => {
                Some((value.clone(), *write_type))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(value, [0x2a, 0x01]);
    assert_eq!(write_type, WriteType::WithResponse);
}

#[test]
fn write_rejections_surface_as_protocol_errors() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    for verify in [true, false] {
        let writer = thread::spawn({
            let client = client.clone();
            let characteristic = characteristic.clone();
            move || client.write_characteristic(&characteristic, &[1], verify)
        });
        let wanted = if verify { 1 } else { 2 };
        assert!(mock.wait_for(CALL_WAIT, move |log| count_writes(log) >= wanted));
        mock.ack_characteristic_write(0x03);

        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Protocol(AttError::Known(AttErrorCode::WriteNotPermitted))
        );
    }

    // The unverified attempt went out as a write command.
    let calls = mock.calls();
    let types: Vec<WriteType> = calls
        .iter()
        .filter_map(|call| match call {
            MockCall::WriteCharacteristic { write_type, .. } => Some(*write_type),
            _ => None,
        })
        .collect();
    assert_eq!(types, [WriteType::WithResponse, WriteType::NoResponse]);
}

#[test]
fn string_writes_return_at_submission_but_hold_the_slot() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    // returns without any acknowledgement in sight
    client.write_characteristic_str(&characteristic, "ping").unwrap();

    let second = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[1], true)
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        count_writes(&mock.calls()),
        1,
        "a second write was admitted before the first completed"
    );

    mock.ack_characteristic_write(0);
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 2));
    mock.ack_characteristic_write(0);
    second.join().unwrap().unwrap();

    let calls = mock.calls();
    let (value, write_type) = calls
        .iter()
        .find_map(|call| match call {
            MockCall::WriteCharacteristic { value, write_type, .. } => {
                Some((value.clone(), *write_type))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(value, *b"ping");
    assert_eq!(write_type, WriteType::WithResponse);
}

#[test]
fn read_completions_update_the_handle_and_publish() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    client.read_characteristic(&characteristic).unwrap();
    assert!(mock
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::ReadCharacteristic { .. })));

    mock.fire_characteristic_read(SERVICE, DATA, &[0x07, 0x2a], 0);
    let Event::DataAvailable { characteristic: uuid, value } = expect_event(&events) else {
        panic!("expected a data event");
    };
    assert_eq!(uuid, DATA);
    assert_eq!(value, [0x07, 0x2a]);
    assert_eq!(characteristic.value(), Some(vec![0x07, 0x2a]));
}

#[test]
fn failed_reads_keep_the_old_value_and_publish_nothing() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    client.read_characteristic(&characteristic).unwrap();
    mock.fire_characteristic_read(SERVICE, DATA, &[9], 0);
    assert!(matches!(expect_event(&events), Event::DataAvailable { .. }));

    client.read_characteristic(&characteristic).unwrap();
    mock.fire_characteristic_read(SERVICE, DATA, &[], 0x02);
    assert!(events.try_recv().is_none());
    assert_eq!(characteristic.value(), Some(vec![9]));

    // the failed completion freed the slot
    client.read_characteristic(&characteristic).unwrap();
}

#[test]
fn notifications_arm_the_cccd_and_deliver_pushes() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let subscriber = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.set_characteristic_notification(&characteristic, true)
    });

    assert!(mock.wait_for(CALL_WAIT, |log| count_descriptor_writes(log) >= 1));
    let calls = mock.calls();
    let routing = calls
        .iter()
        .position(|call| matches!(call, MockCall::SetNotification { enabled: true, .. }))
        .expect("notification routing was never switched on");
    let cccd_write = calls
        .iter()
        .position(|call| matches!(call, MockCall::WriteDescriptor { .. }))
        .unwrap();
    assert!(routing < cccd_write);
    let MockCall::WriteDescriptor { descriptor, value, .. } = &calls[cccd_write] else {
        unreachable!();
    };
    assert_eq!(*descriptor, descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION);
    assert_eq!(*value, [0x01, 0x00]);

    assert!(!subscriber.is_finished());
    mock.ack_descriptor_write(0);
    subscriber.join().unwrap().unwrap();

    // the peer now pushes without any read in flight
    mock.fire_characteristic_changed(SERVICE, DATA, &[0x11]);
    let Event::DataAvailable { characteristic: uuid, value } = expect_event(&events) else {
        panic!("expected a data event");
    };
    assert_eq!(uuid, DATA);
    assert_eq!(value, [0x11]);
    assert_eq!(characteristic.value(), Some(vec![0x11]));

    let cccd = characteristic
        .descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
        .unwrap();
    assert_eq!(cccd.value(), Some(vec![0x01, 0x00]));
}

#[test]
fn indications_write_the_indication_bits() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let subscriber = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.set_characteristic_indication(&characteristic, true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_descriptor_writes(log) >= 1));
    mock.ack_descriptor_write(0);
    subscriber.join().unwrap().unwrap();

    let calls = mock.calls();
    let value = calls
        .iter()
        .find_map(|call| match call {
            MockCall::WriteDescriptor { value, .. } => Some(value.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(value, [0x02, 0x00]);
}

#[test]
fn disabling_writes_the_all_off_value() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let enable = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.set_characteristic_notification(&characteristic, true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_descriptor_writes(log) >= 1));
    mock.ack_descriptor_write(0);
    enable.join().unwrap().unwrap();

    let disable = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.set_characteristic_notification(&characteristic, false)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_descriptor_writes(log) >= 2));
    mock.ack_descriptor_write(0);
    disable.join().unwrap().unwrap();

    let calls = mock.calls();
    let last_value = calls
        .iter()
        .rev()
        .find_map(|call| match call {
            MockCall::WriteDescriptor { value, .. } => Some(value.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_value, [0x00, 0x00]);
    assert!(calls
        .iter()
        .any(|call| matches!(call, MockCall::SetNotification { enabled: false, .. })));

    let cccd = characteristic
        .descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
        .unwrap();
    assert_eq!(cccd.value(), Some(vec![0x00, 0x00]));
}

#[test]
fn a_stale_read_back_keeps_the_subscriber_waiting() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let subscriber = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.set_characteristic_notification(&characteristic, true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_descriptor_writes(log) >= 1));

    // the peer answers with the descriptor still all-off
    mock.ack_descriptor_write_with_value(0, &[0x00, 0x00]);
    thread::sleep(Duration::from_millis(100));
    assert!(!subscriber.is_finished());

    // a later completion carries the value we asked for
    mock.ack_descriptor_write(0);
    subscriber.join().unwrap().unwrap();
}

#[test]
fn subscribing_without_a_cccd_fails_cleanly() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let bare = client
        .service(SERVICE)
        .unwrap()
        .characteristic(BARE)
        .unwrap();

    let err = client.set_characteristic_notification(&bare, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DescriptorNotFound);
    assert!(!mock.calls().iter().any(|call| {
        matches!(
            call,
            MockCall::SetNotification { .. } | MockCall::WriteDescriptor { .. }
        )
    }));
}

#[test]
fn stalled_operations_time_out_instead_of_wedging() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let client = GattClient::with_config(
        Arc::new(mock.clone()),
        ClientConfig {
            operation_timeout: Some(Duration::from_millis(150)),
        },
    );
    let _events = bring_ready(&mock, &client);
    let characteristic = data_characteristic(&client);

    let started = Instant::now();
    let err = client
        .write_characteristic(&characteristic, &[1], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let err = client
        .set_characteristic_notification(&characteristic, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);

    // both gave the slot back
    let writer = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[2], true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 2));
    mock.ack_characteristic_write(0);
    writer.join().unwrap().unwrap();
}

#[test]
fn teardown_wakes_blocked_operations_and_closes_once() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let writer = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[5], true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 1));

    client.disconnect();
    assert_eq!(client.state(), SessionState::TearingDown);
    assert!(mock.calls().contains(&MockCall::Disconnect));
    mock.fire_disconnected();

    let err = writer.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(matches!(expect_event(&events), Event::Disconnected));

    let closes = |calls: &[MockCall]| {
        calls
            .iter()
            .filter(|call| matches!(call, MockCall::Close))
            .count()
    };
    assert_eq!(closes(&mock.calls()), 1);

    // handles died with the session
    assert!(characteristic.value().is_none());
    let err = client
        .write_characteristic(&characteristic, &[1], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);

    // closing again neither touches the platform nor publishes
    client.close();
    client.disconnect();
    assert_eq!(closes(&mock.calls()), 1);
    assert!(events.try_recv().is_none());
}

#[test]
fn close_ends_the_session_without_waiting_for_the_platform() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    let writer = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[5], true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 1));

    client.close();
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(matches!(expect_event(&events), Event::Disconnected));
    assert_eq!(
        writer.join().unwrap().unwrap_err().kind(),
        ErrorKind::Disconnected
    );
    assert!(mock.calls().contains(&MockCall::Close));
}

#[test]
fn reconnecting_builds_a_fresh_tree() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, events) = ready_client(&mock);
    let stale = data_characteristic(&client);

    client.close();
    assert!(matches!(expect_event(&events), Event::Disconnected));
    assert_eq!(client.peer_address().as_deref(), Some(PEER));

    let _events = bring_ready(&mock, &client);
    let fresh = data_characteristic(&client);
    assert!(stale.value().is_none());
    assert_eq!(fresh.value(), Some(Vec::new()));

    let writer = thread::spawn({
        let client = client.clone();
        let fresh = fresh.clone();
        move || client.write_characteristic(&fresh, &[7], true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 1));
    mock.ack_characteristic_write(0);
    writer.join().unwrap().unwrap();
}

#[test]
fn refused_submissions_surface_as_rejected() {
    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    mock.set_submissions_accepted(false);
    let err = client
        .write_characteristic(&characteristic, &[1], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);

    // the refusal freed the slot
    mock.set_submissions_accepted(true);
    let writer = thread::spawn({
        let client = client.clone();
        let characteristic = characteristic.clone();
        move || client.write_characteristic(&characteristic, &[2], true)
    });
    assert!(mock.wait_for(CALL_WAIT, |log| count_writes(log) >= 1));
    mock.ack_characteristic_write(0);
    writer.join().unwrap().unwrap();
}

#[test]
fn concurrent_writers_are_serialized() {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 8;
    let total = WRITERS * ROUNDS;

    let mock = MockAdapter::new();
    mock.add_peer(PEER, peer_database());
    let (client, _events) = ready_client(&mock);
    let characteristic = data_characteristic(&client);

    // Acknowledge one write at a time. Submission n + 1 cannot appear until
    // writer n was woken, so "last write" is always the pending one, and an
    // overshoot here means two writes were in flight at once.
    let acker = thread::spawn({
        let mock = mock.clone();
        move || {
            for n in 1..=total {
                assert!(mock.wait_for(CALL_WAIT, move |log| count_writes(log) >= n));
                assert_eq!(count_writes(&mock.calls()), n);
                mock.ack_characteristic_write(0);
            }
        }
    });

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            thread::spawn({
                let client = client.clone();
                let characteristic = characteristic.clone();
                move || {
                    for round in 0..ROUNDS {
                        client
                            .write_characteristic(&characteristic, &[writer as u8, round as u8], true)
                            .unwrap();
                    }
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    acker.join().unwrap();
    assert_eq!(count_writes(&mock.calls()), total);
}
