//! Typed requests and responses on top of a [`Transport`].
//!
//! Outbound helpers encode commands and write them immediately. Inbound frames
//! are raised on the reader thread; the handler only queues them there and
//! decodes them when [`ProtocolHandler::pump`] is called, so every
//! [`DeviceEvent`] is emitted on the thread that owns the handler.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{debug, error, warn};

use crate::device::{self, DeviceConfig, DeviceStatus, Stimulation};
use crate::errors::Result;
use crate::events::{EventBus, ListenerId};
use crate::frame::{Command, Frame, Response};
use crate::transport::Transport;

/// Which acknowledgement the device sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
    /// Stimulation accepted.
    Sack,
}

/// Notifications raised by the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ConfigReceived(DeviceConfig),
    StatusReceived(DeviceStatus),
    /// The stimulation was written to the port. The device has not confirmed it.
    StimulationSent(Stimulation),
    /// Device-reported error code.
    ErrorReceived(u8),
    Acknowledged(AckKind),
    /// A config or status payload could not be decoded.
    DecodeFailed { code: u8, reason: String },
    /// Every received frame, re-encoded, for diagnostics.
    FrameReceived(Vec<u8>),
}

/// Decode one inbound frame into the event it carries, if any.
///
/// `PingAck` belongs to port probing and unknown codes are dropped; both
/// yield `None`.
pub fn decode_response(frame: &Frame) -> Option<DeviceEvent> {
    let response = match frame.response() {
        Some(response) => response,
        None => {
            debug!("Dropping frame with unknown code {:#04X}", frame.code);
            return None;
        }
    };
    match response {
        Response::Ack => Some(DeviceEvent::Acknowledged(AckKind::Ack)),
        Response::Nack => {
            warn!("Device answered NACK");
            Some(DeviceEvent::Acknowledged(AckKind::Nack))
        }
        Response::Sack => Some(DeviceEvent::Acknowledged(AckKind::Sack)),
        Response::PingAck => None,
        Response::ReturnConfig => Some(
            DeviceConfig::from_payload(&frame.payload)
                .map(DeviceEvent::ConfigReceived)
                .unwrap_or_else(|e| decode_failed(frame.code, e.to_string())),
        ),
        Response::ReturnStatus => Some(
            DeviceStatus::from_payload(&frame.payload)
                .map(DeviceEvent::StatusReceived)
                .unwrap_or_else(|e| decode_failed(frame.code, e.to_string())),
        ),
        Response::Error => match frame.payload.first() {
            Some(&code) => {
                error!("Device reported error {:#04X}", code);
                Some(DeviceEvent::ErrorReceived(code))
            }
            None => {
                warn!("Device sent an Error frame without a code");
                None
            }
        },
    }
}

fn decode_failed(code: u8, reason: String) -> DeviceEvent {
    warn!("Could not decode response {:#04X}: {}", code, reason);
    DeviceEvent::DecodeFailed { code, reason }
}

/// Speaks the device protocol over one transport.
pub struct ProtocolHandler {
    transport: Arc<Transport>,
    inbox: Receiver<Frame>,
    listener: ListenerId,
    events: EventBus<DeviceEvent>,
}

impl ProtocolHandler {
    /// Bind to `transport`, publishing decoded events on `events`.
    pub fn new(transport: Arc<Transport>, events: EventBus<DeviceEvent>) -> Self {
        let (tx, inbox) = crossbeam_channel::unbounded();
        let listener = transport.frames().subscribe(move |frame: &Frame| {
            let _ = tx.send(frame.clone());
        });
        Self {
            transport,
            inbox,
            listener,
            events,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn events(&self) -> &EventBus<DeviceEvent> {
        &self.events
    }

    /// Frames received but not yet pumped.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Decode every queued frame and emit its events on the calling thread.
    ///
    /// Returns the emitted events, raw `FrameReceived` entries excluded.
    pub fn pump(&self) -> Vec<DeviceEvent> {
        let mut decoded = Vec::new();
        for frame in self.inbox.try_iter() {
            if let Ok(raw) = frame.to_bytes() {
                self.events.emit(&DeviceEvent::FrameReceived(raw));
            }
            if let Some(event) = decode_response(&frame) {
                self.events.emit(&event);
                decoded.push(event);
            }
        }
        decoded
    }

    pub fn get_config(&self) -> bool {
        self.transport.send_frame(Command::GetConfig, &[])
    }

    pub fn get_status(&self) -> bool {
        self.transport.send_frame(Command::GetStatus, &[])
    }

    pub fn set_enable(&self, enable: bool) -> bool {
        self.transport
            .send_frame(Command::EnableDisable, &[u8::from(enable)])
    }

    /// Send a stimulation and raise `StimulationSent` once it is written.
    pub fn set_stimulation(&self, stimulation: &Stimulation) -> bool {
        let sent = self
            .transport
            .send_frame(Command::SetStimulation, &stimulation.to_payload());
        if sent {
            self.events
                .emit(&DeviceEvent::StimulationSent(*stimulation));
        }
        sent
    }

    /// Send per-transducer phases.
    ///
    /// More than [`device::MAX_PHASES`] is a validation error and nothing is
    /// sent. An empty slice sends nothing and returns `Ok(false)`.
    pub fn set_phases(&self, phases: &[f32]) -> Result<bool> {
        let payload = device::phases_payload(phases)?;
        if payload.is_empty() {
            debug!("Ignoring empty phase set");
            return Ok(false);
        }
        Ok(self.transport.send_frame(Command::SetPhases, &payload))
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        self.transport.frames().unsubscribe(self.listener);
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("transport", &self.transport)
            .field("pending", &self.inbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ArrayType;

    fn status() -> DeviceStatus {
        DeviceStatus {
            voltage_vdda: 3.3,
            voltage_3v3: 3.29,
            voltage_5v0: 5.01,
            temperature: 36.5,
            refresh_delta_time: 1.0 / 30.0,
            loop_freq: 30.0,
            active_stimulation_type: 0,
            calibration_mode: 1,
            phase_set_mode: 0,
        }
    }

    #[test]
    fn acknowledgements() {
        let ack = |code: Response| decode_response(&Frame::new(code as u8, Vec::new()));
        assert_eq!(ack(Response::Ack), Some(DeviceEvent::Acknowledged(AckKind::Ack)));
        assert_eq!(ack(Response::Nack), Some(DeviceEvent::Acknowledged(AckKind::Nack)));
        assert_eq!(ack(Response::Sack), Some(DeviceEvent::Acknowledged(AckKind::Sack)));
    }

    #[test]
    fn status_and_config_are_decoded() {
        let frame = Frame::new(Response::ReturnStatus as u8, status().to_payload());
        assert_eq!(decode_response(&frame), Some(DeviceEvent::StatusReceived(status())));

        let config = DeviceConfig {
            version: 2,
            array_type: ArrayType::Rect,
            array_edge_size: 16,
            transducer_count: 256,
            transducer_size: 0.01,
            transducer_spacing: 0.0105,
        };
        let frame = Frame::new(Response::ReturnConfig as u8, config.to_payload());
        assert_eq!(decode_response(&frame), Some(DeviceEvent::ConfigReceived(config)));
    }

    #[test]
    fn short_payload_is_a_decode_failure() {
        let frame = Frame::new(Response::ReturnStatus as u8, vec![0u8; 20]);
        match decode_response(&frame) {
            Some(DeviceEvent::DecodeFailed { code, .. }) => {
                assert_eq!(code, Response::ReturnStatus as u8)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_ping_ack_and_unknown() {
        let frame = Frame::new(Response::Error as u8, vec![0x07]);
        assert_eq!(decode_response(&frame), Some(DeviceEvent::ErrorReceived(0x07)));
        assert_eq!(decode_response(&Frame::new(Response::Error as u8, Vec::new())), None);
        assert_eq!(decode_response(&Frame::new(Response::PingAck as u8, vec![9])), None);
        assert_eq!(decode_response(&Frame::new(0x42, vec![1, 2])), None);
    }
}
