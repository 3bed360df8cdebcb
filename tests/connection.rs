mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{opener, wait_until, WAIT};
use umh_link::frame::Command;
use umh_link::sim::{Peer, SimulatedDevice, SimulatedPorts};
use umh_link::{ConnectionEvent, ConnectionManager, ConnectionState, LinkConfig};

fn pings(port: &umh_link::sim::SimPort) -> usize {
    port.received()
        .iter()
        .filter(|f| f.code == Command::Ping as u8)
        .count()
}

#[test]
fn scan_connects_to_the_only_responder() {
    let ports = Arc::new(SimulatedPorts::new());
    let silent = ports.add_silent("ttyS0");
    let device = ports.add_device("ttyACM0");
    let confused = ports.add(
        "ttyACM1",
        Peer::Device(SimulatedDevice {
            ping_offset: 1,
            ..SimulatedDevice::default()
        }),
    );
    let bluetooth = ports.add_device("/dev/tty.Bluetooth-Incoming-Port");

    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    let events = manager.events().channel();
    assert!(manager.scan_and_connect());

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());
    let transport = manager.transport().unwrap();
    assert_eq!(transport.port_name(), "ttyACM0");
    match events.recv_timeout(WAIT).unwrap() {
        ConnectionEvent::Connected(t) => assert_eq!(t.id(), transport.id()),
        other => panic!("unexpected {other:?}"),
    }

    assert!(device.is_open());
    assert!(wait_until(WAIT, || !silent.is_open() && !confused.is_open()));
    assert_eq!(pings(&silent), 1);
    assert_eq!(pings(&confused), 1);
    assert!(bluetooth.received().is_empty());
    assert!(!bluetooth.is_open());
}

#[test]
fn scan_without_responders_ends_disconnected() {
    let ports = Arc::new(SimulatedPorts::new());
    let a = ports.add_silent("A");
    let b = ports.add(
        "B",
        Peer::Device(SimulatedDevice {
            answers_ping: false,
            ..SimulatedDevice::default()
        }),
    );
    let c = ports.add_device("C");
    c.set_openable(false);

    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(!manager.scan_and_connect());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.transport().is_none());
    assert!(wait_until(WAIT, || !a.is_open() && !b.is_open() && !c.is_open()));
}

#[test]
fn scan_with_no_ports_ends_disconnected() {
    let ports = Arc::new(SimulatedPorts::new());
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(!manager.scan_and_connect());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn scan_while_connected_does_not_ping_again() {
    let ports = Arc::new(SimulatedPorts::new());
    let device = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());
    assert!(manager.scan_and_connect());
    assert_eq!(pings(&device), 1);
}

#[test]
fn manual_connect_skips_verification() {
    let ports = Arc::new(SimulatedPorts::new());
    let port = ports.add_silent("not-a-device");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());

    assert!(manager.manual_connect("not-a-device", 9600));
    assert!(manager.is_connected());
    assert_eq!(manager.transport().unwrap().baud_rate(), 9600);
    assert!(port.received().is_empty());

    assert!(!manager.manual_connect("missing", 9600));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(wait_until(WAIT, || !port.is_open()));
}

#[test]
fn lost_link_drops_to_disconnected() {
    let ports = Arc::new(SimulatedPorts::new());
    let device = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());
    let events = manager.events().channel();

    device.unplug();
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert!(manager.transport().is_none());
    assert!(!device.is_open());
}

#[test]
fn scan_after_a_lost_link_reaches_the_replacement() {
    let ports = Arc::new(SimulatedPorts::new());
    let first = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());
    let events = manager.events().channel();

    first.unplug();
    first.set_openable(false);
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    ));

    let second = ports.add_device("DEV2");
    assert!(manager.scan_and_connect());
    assert_eq!(manager.transport().unwrap().port_name(), "DEV2");
    assert!(second.is_open());
    assert_eq!(first.open_handles(), 0);
}

#[test]
fn failed_write_drops_to_disconnected() {
    let ports = Arc::new(SimulatedPorts::new());
    let device = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());
    let transport = manager.transport().unwrap();
    let events = manager.events().channel();

    device.stall_writes(true);
    assert!(!transport.send_frame(Command::GetStatus, &[]));
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.transport().is_none());
    assert!(!device.is_open());
    assert!(events.recv_timeout(Duration::from_millis(150)).is_err());
}

#[test]
fn reconnect_tears_down_and_scans_again() {
    let ports = Arc::new(SimulatedPorts::new());
    let device = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());
    let first = manager.transport().unwrap().id();
    let events = manager.events().channel();

    assert!(manager.reconnect());
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    ));
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Connected(_)
    ));
    assert_ne!(manager.transport().unwrap().id(), first);
    assert_eq!(pings(&device), 2);
    assert!(manager.is_connected());
}

#[test]
fn stale_transport_failure_is_ignored() {
    let ports = Arc::new(SimulatedPorts::new());
    let old = ports.add_silent("OLD");
    ports.add_silent("NEW");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());

    assert!(manager.manual_connect("OLD", 115200));
    assert!(manager.manual_connect("NEW", 115200));
    let events = manager.events().channel();

    old.unplug();
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(manager.is_connected());
    assert_eq!(manager.transport().unwrap().port_name(), "NEW");
}

#[test]
fn disconnect_closes_the_port() {
    let ports = Arc::new(SimulatedPorts::new());
    let device = ports.add_device("DEV");
    let manager = ConnectionManager::new(opener(&ports), LinkConfig::default());
    assert!(manager.scan_and_connect());

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.transport().is_none());
    assert!(wait_until(WAIT, || !device.is_open()));
}
