//! In-memory serial ports with a simulated array controller behind them.
//!
//! Used by the test suite and by `umh-link --simulate` to exercise the full
//! stack (reader thread, parser, port scan, protocol decoding) without hardware.
//! The simulated device parses host frames with the same codec as the host and
//! answers the way the firmware does.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::device::{ArrayType, DeviceConfig, DeviceStatus};
use crate::errors::{LinkError, Result};
use crate::frame::{self, Command, Frame, Response};
use crate::port::{PortOpener, SerialLink};
use crate::ring::RingBuffer;

/// Error code the simulated device sends back for unknown commands.
pub const SIM_ERROR_UNKNOWN_COMMAND: u8 = 0x01;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How the thing on the far end of a simulated port behaves.
#[derive(Debug, Clone)]
pub enum Peer {
    /// A controller speaking the protocol.
    Device(SimulatedDevice),
    /// Accepts bytes and never answers.
    Silent,
}

/// State of a simulated array controller.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub config: DeviceConfig,
    pub status: DeviceStatus,
    pub enabled: bool,
    /// When false, pings are swallowed.
    pub answers_ping: bool,
    /// Added to the echoed ping nonce; non-zero simulates a confused peer.
    pub ping_offset: u8,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            config: DeviceConfig {
                version: 5,
                array_type: ArrayType::Hex,
                array_edge_size: 8,
                transducer_count: 60,
                transducer_size: 0.01,
                transducer_spacing: 0.01,
            },
            status: DeviceStatus {
                voltage_vdda: 3.30,
                voltage_3v3: 3.29,
                voltage_5v0: 5.01,
                temperature: 36.5,
                refresh_delta_time: 1.0 / 30.0,
                loop_freq: 30.0,
                active_stimulation_type: 0,
                calibration_mode: 1,
                phase_set_mode: 0,
            },
            enabled: false,
            answers_ping: true,
            ping_offset: 0,
        }
    }
}

impl SimulatedDevice {
    fn respond(&mut self, request: &Frame) -> Option<Frame> {
        let reply = |code: Response, payload: Vec<u8>| Some(Frame::new(code as u8, payload));
        match Command::try_from(request.code) {
            Ok(Command::Ping) => {
                if !self.answers_ping {
                    return None;
                }
                let nonce = request.payload.first().copied().unwrap_or(0);
                reply(Response::PingAck, vec![nonce.wrapping_add(self.ping_offset)])
            }
            Ok(Command::GetStatus) => reply(Response::ReturnStatus, self.status.to_payload()),
            Ok(Command::GetConfig) => reply(Response::ReturnConfig, self.config.to_payload()),
            Ok(Command::SetStimulation) => {
                if let Some(&kind) = request.payload.first() {
                    self.status.active_stimulation_type = kind;
                }
                reply(Response::Sack, Vec::new())
            }
            Ok(Command::SetPhases) => reply(Response::Ack, Vec::new()),
            Ok(Command::EnableDisable) => match request.payload.as_slice() {
                [flag] => {
                    self.enabled = *flag != 0;
                    reply(Response::Ack, Vec::new())
                }
                _ => reply(Response::Nack, Vec::new()),
            },
            Err(_) => reply(Response::Error, vec![SIM_ERROR_UNKNOWN_COMMAND]),
        }
    }
}

struct PortState {
    name: String,
    peer: Mutex<Peer>,
    /// Bytes travelling device -> host.
    to_host: Mutex<VecDeque<u8>>,
    readable: Condvar,
    /// Device-side receive buffer.
    from_host: RingBuffer,
    received: Mutex<Vec<Frame>>,
    handles: AtomicUsize,
    unplugged: AtomicBool,
    openable: AtomicBool,
    /// Writes time out while reads keep working.
    write_stalled: AtomicBool,
}

impl PortState {
    fn push_to_host(&self, bytes: &[u8]) {
        lock(&self.to_host).extend(bytes.iter().copied());
        self.readable.notify_all();
    }

    fn deliver_from_host(&self, bytes: &[u8]) {
        self.from_host.write(bytes);
        for request in frame::parse_all(&self.from_host) {
            lock(&self.received).push(request.clone());
            let response = match &mut *lock(&self.peer) {
                Peer::Device(device) => device.respond(&request),
                Peer::Silent => None,
            };
            if let Some(response) = response {
                if let Ok(bytes) = response.to_bytes() {
                    self.push_to_host(&bytes);
                }
            }
        }
    }
}

/// Host-side handle to a simulated port.
struct SimLink {
    state: Arc<PortState>,
    timeout: Duration,
}

impl SimLink {
    fn new(state: Arc<PortState>, timeout: Duration) -> Self {
        state.handles.fetch_add(1, Ordering::SeqCst);
        Self { state, timeout }
    }

    fn broken(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("{} was unplugged", self.state.name),
        )
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.state.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut queue = lock(&self.state.to_host);
        loop {
            if self.state.unplugged.load(Ordering::SeqCst) {
                return Err(self.broken());
            }
            if !queue.is_empty() {
                let n = buf.len().min(queue.len());
                for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            queue = self
                .state
                .readable
                .wait_timeout(queue, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(self.broken());
        }
        if self.state.write_stalled.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        self.state.deliver_from_host(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimLink {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(SimLink::new(Arc::clone(&self.state), self.timeout)))
    }

    fn set_link_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// Test-side view of one simulated port.
#[derive(Clone)]
pub struct SimPort {
    state: Arc<PortState>,
}

impl SimPort {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether any host handle to this port is still open.
    pub fn is_open(&self) -> bool {
        self.open_handles() > 0
    }

    pub fn open_handles(&self) -> usize {
        self.state.handles.load(Ordering::SeqCst)
    }

    /// Every frame the device has received from the host, oldest first.
    pub fn received(&self) -> Vec<Frame> {
        lock(&self.state.received).clone()
    }

    /// Push raw bytes towards the host, bypassing the device.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.push_to_host(bytes);
    }

    /// Make every subsequent read and write on open handles fail.
    pub fn unplug(&self) {
        self.state.unplugged.store(true, Ordering::SeqCst);
        self.state.readable.notify_all();
    }

    /// Make every subsequent write time out without disturbing reads.
    pub fn stall_writes(&self, stalled: bool) {
        self.state.write_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Make future `open` calls on this port fail.
    pub fn set_openable(&self, openable: bool) {
        self.state.openable.store(openable, Ordering::SeqCst);
    }

    /// Mutate the simulated device, if this port has one.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SimulatedDevice) -> R) -> Option<R> {
        match &mut *lock(&self.state.peer) {
            Peer::Device(device) => Some(f(device)),
            Peer::Silent => None,
        }
    }
}

/// A set of named simulated ports acting as the system's serial ports.
#[derive(Default)]
pub struct SimulatedPorts {
    ports: Mutex<Vec<Arc<PortState>>>,
}

impl SimulatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, peer: Peer) -> SimPort {
        let state = Arc::new(PortState {
            name: name.to_string(),
            peer: Mutex::new(peer),
            to_host: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            from_host: RingBuffer::new(crate::ring::DEFAULT_CAPACITY),
            received: Mutex::new(Vec::new()),
            handles: AtomicUsize::new(0),
            unplugged: AtomicBool::new(false),
            openable: AtomicBool::new(true),
            write_stalled: AtomicBool::new(false),
        });
        lock(&self.ports).push(Arc::clone(&state));
        SimPort { state }
    }

    pub fn add_device(&self, name: &str) -> SimPort {
        self.add(name, Peer::Device(SimulatedDevice::default()))
    }

    pub fn add_silent(&self, name: &str) -> SimPort {
        self.add(name, Peer::Silent)
    }

    fn find(&self, name: &str) -> Option<Arc<PortState>> {
        lock(&self.ports).iter().find(|p| p.name == name).cloned()
    }
}

impl PortOpener for SimulatedPorts {
    fn available_ports(&self) -> Result<Vec<String>> {
        Ok(lock(&self.ports).iter().map(|p| p.name.clone()).collect())
    }

    fn open(&self, name: &str, _baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialLink>> {
        let state = self.find(name).ok_or_else(|| {
            LinkError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port: {name}"),
            ))
        })?;
        if !state.openable.load(Ordering::SeqCst) {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{name} is busy"),
            )));
        }
        Ok(Box::new(SimLink::new(state, timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_answers_ping_with_nonce() {
        let ports = SimulatedPorts::new();
        let port = ports.add_device("sim0");
        let mut link = ports.open("sim0", 115200, Duration::from_millis(50)).unwrap();

        link.write_all(&frame::encode(Command::Ping as u8, &[0x5A]).unwrap())
            .unwrap();
        let mut buf = [0u8; 16];
        let n = link.read(&mut buf).unwrap();
        let reply = Frame::decode(&buf[..n]).unwrap();
        assert_eq!(reply.response(), Some(Response::PingAck));
        assert_eq!(reply.payload, vec![0x5A]);
        assert_eq!(port.received().len(), 1);
    }

    #[test]
    fn handles_are_counted() {
        let ports = SimulatedPorts::new();
        let port = ports.add_silent("sim1");
        let link = ports.open("sim1", 115200, Duration::from_millis(10)).unwrap();
        let clone = link.try_clone_link().unwrap();
        assert_eq!(port.open_handles(), 2);
        drop(link);
        drop(clone);
        assert!(!port.is_open());
    }

    #[test]
    fn silent_port_times_out() {
        let ports = SimulatedPorts::new();
        ports.add_silent("sim2");
        let mut link = ports.open("sim2", 115200, Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 4];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn unknown_port_fails_to_open() {
        let ports = SimulatedPorts::new();
        assert!(ports.open("nope", 115200, Duration::from_millis(10)).is_err());
    }
}
