mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, WAIT};
use umh_link::device::MAX_PHASES;
use umh_link::frame::{self, Command, Response};
use umh_link::sim::{SimPort, SimulatedDevice, SimulatedPorts};
use umh_link::{
    AckKind, DeviceEvent, DeviceStatus, EventBus, LinkConfig, LinkError, ProtocolHandler,
    Stimulation, StimulationKind, Transport, Vec3,
};

fn handler_on_device() -> (SimulatedPorts, SimPort, ProtocolHandler) {
    let ports = SimulatedPorts::new();
    let port = ports.add_device("DEV");
    let transport = Transport::connect(&ports, "DEV", &LinkConfig::default()).unwrap();
    let handler = ProtocolHandler::new(Arc::new(transport), EventBus::new());
    (ports, port, handler)
}

/// Pump until at least one decoded event shows up.
fn pump_some(handler: &ProtocolHandler) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    wait_until(WAIT, || {
        events.extend(handler.pump());
        !events.is_empty()
    });
    events
}

#[test]
fn sixty_four_phases_are_rejected_without_sending() {
    let (_ports, port, handler) = handler_on_device();
    let phases = vec![0.5f32; MAX_PHASES + 1];
    assert!(matches!(
        handler.set_phases(&phases),
        Err(LinkError::Validation(_))
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert!(port.received().is_empty());
}

#[test]
fn sixty_three_phases_fill_the_payload() {
    let (_ports, port, handler) = handler_on_device();
    let phases: Vec<f32> = (0..MAX_PHASES).map(|i| i as f32 * 0.1).collect();
    assert!(handler.set_phases(&phases).unwrap());

    assert!(wait_until(WAIT, || !port.received().is_empty()));
    let sent = &port.received()[0];
    assert_eq!(sent.code, Command::SetPhases as u8);
    assert_eq!(sent.payload.len(), 252);
    assert_eq!(&sent.payload[4..8], &0.1f32.to_le_bytes());

    assert_eq!(
        pump_some(&handler),
        vec![DeviceEvent::Acknowledged(AckKind::Ack)]
    );
}

#[test]
fn empty_phase_set_sends_nothing() {
    let (_ports, port, handler) = handler_on_device();
    assert!(!handler.set_phases(&[]).unwrap());
    assert!(port.received().is_empty());
}

#[test]
fn stimulation_is_reported_when_written() {
    let (_ports, port, handler) = handler_on_device();
    let events = handler.events().channel();
    let stimulation = Stimulation::circular(
        Vec3::new(0.0, 0.0, 0.15),
        Vec3::new(0.0, 0.0, 1.0),
        0.02,
    );

    assert!(handler.set_stimulation(&stimulation));
    assert_eq!(
        events.try_recv().unwrap(),
        DeviceEvent::StimulationSent(stimulation)
    );

    assert!(wait_until(WAIT, || !port.received().is_empty()));
    let sent = &port.received()[0];
    assert_eq!(sent.code, Command::SetStimulation as u8);
    assert_eq!(sent.payload, stimulation.to_payload());
    assert_eq!(sent.payload[0], StimulationKind::Circular as u8);

    assert_eq!(
        pump_some(&handler),
        vec![DeviceEvent::Acknowledged(AckKind::Sack)]
    );
    assert_eq!(
        port.with_device(|d| d.status.active_stimulation_type),
        Some(StimulationKind::Circular as u8)
    );
}

#[test]
fn status_and_config_replies_are_decoded_on_pump() {
    let (_ports, port, handler) = handler_on_device();
    let expected = SimulatedDevice::default();

    assert!(handler.get_status());
    assert_eq!(
        pump_some(&handler),
        vec![DeviceEvent::StatusReceived(expected.status)]
    );

    assert!(handler.get_config());
    assert_eq!(
        pump_some(&handler),
        vec![DeviceEvent::ConfigReceived(expected.config)]
    );
    assert_eq!(port.received().len(), 2);
}

#[test]
fn frames_wait_in_the_queue_until_pumped() {
    let (_ports, _port, handler) = handler_on_device();
    let events = handler.events().channel();

    assert!(handler.get_status());
    assert!(wait_until(WAIT, || handler.pending() == 1));
    assert!(events.try_recv().is_err());

    assert_eq!(handler.pump().len(), 1);
    assert!(matches!(events.try_recv().unwrap(), DeviceEvent::FrameReceived(_)));
    assert!(matches!(events.try_recv().unwrap(), DeviceEvent::StatusReceived(_)));
}

#[test]
fn known_status_bytes_decode_to_known_values() {
    let (_ports, port, handler) = handler_on_device();
    let status = DeviceStatus {
        voltage_vdda: 3.30,
        voltage_3v3: 3.29,
        voltage_5v0: 5.01,
        temperature: 36.50,
        refresh_delta_time: 1.0 / 30.0,
        loop_freq: 30.0,
        active_stimulation_type: 0,
        calibration_mode: 1,
        phase_set_mode: 0,
    };
    let payload = status.to_payload();
    assert_eq!(payload.len(), 37);
    port.inject(&frame::encode(Response::ReturnStatus as u8, &payload).unwrap());

    match pump_some(&handler).as_slice() {
        [DeviceEvent::StatusReceived(got)] => {
            assert_eq!(got.voltage_vdda, 3.30);
            assert_eq!(got.voltage_3v3, 3.29);
            assert_eq!(got.voltage_5v0, 5.01);
            assert_eq!(got.temperature, 36.50);
            assert!((got.refresh_delta_time - 0.033333).abs() < 1e-5);
            assert_eq!(got.loop_freq, 30.0);
            assert_eq!(got.active_stimulation(), Some(StimulationKind::Point));
            assert_eq!(got.calibration_mode, 1);
            assert_eq!(got.phase_set_mode, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn short_status_is_a_decode_failure() {
    let (_ports, port, handler) = handler_on_device();
    port.inject(&frame::encode(Response::ReturnStatus as u8, &[0u8; 36]).unwrap());
    assert!(matches!(
        pump_some(&handler).as_slice(),
        [DeviceEvent::DecodeFailed { .. }]
    ));
}

#[test]
fn device_errors_and_nacks_are_forwarded() {
    let (_ports, port, handler) = handler_on_device();
    port.inject(&frame::encode(Response::Error as u8, &[0x05]).unwrap());
    assert_eq!(pump_some(&handler), vec![DeviceEvent::ErrorReceived(0x05)]);

    port.inject(&frame::encode(Response::Nack as u8, &[]).unwrap());
    assert_eq!(
        pump_some(&handler),
        vec![DeviceEvent::Acknowledged(AckKind::Nack)]
    );
}

#[test]
fn stray_ping_ack_and_unknown_codes_are_dropped() {
    let (_ports, port, handler) = handler_on_device();
    port.inject(&frame::encode(Response::PingAck as u8, &[7]).unwrap());
    port.inject(&frame::encode(0x42, &[1]).unwrap());
    assert!(wait_until(WAIT, || handler.pending() == 2));
    assert!(handler.pump().is_empty());
}

#[test]
fn enable_sends_a_flag_byte() {
    let (_ports, port, handler) = handler_on_device();
    assert!(handler.set_enable(true));
    assert!(wait_until(WAIT, || port.with_device(|d| d.enabled) == Some(true)));
    assert!(handler.set_enable(false));
    assert!(wait_until(WAIT, || port.with_device(|d| d.enabled) == Some(false)));

    let payloads: Vec<Vec<u8>> = port.received().into_iter().map(|f| f.payload).collect();
    assert_eq!(payloads, vec![vec![1], vec![0]]);
}

#[test]
fn dropping_the_handler_unsubscribes() {
    let (_ports, _port, handler) = handler_on_device();
    let transport = Arc::clone(handler.transport());
    assert_eq!(transport.frames().listener_count(), 1);
    drop(handler);
    assert_eq!(transport.frames().listener_count(), 0);
}
