//! Port discovery and the lifecycle of the active transport.
//!
//! Only one transport is active at a time. A scan opens every candidate port
//! concurrently, pings it with a random nonce and keeps the first port that
//! echoes the nonce back. Losing probes are not interrupted; each one finishes
//! its own wait and closes its port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::errors::{LinkError, Result};
use crate::events::EventBus;
use crate::frame::{Command, Frame, Response};
use crate::port::{self, PortOpener, SystemPorts};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connected,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(Arc<Transport>),
    Disconnected,
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<Transport>>,
    /// Closes a transport that failed underneath us.
    retiring: Option<JoinHandle<()>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the active [`Transport`] and decides which port it talks to.
pub struct ConnectionManager {
    opener: Arc<dyn PortOpener>,
    config: LinkConfig,
    inner: Arc<Mutex<Inner>>,
    events: EventBus<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(opener: Arc<dyn PortOpener>, config: LinkConfig) -> Self {
        Self {
            opener,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                retiring: None,
            })),
            events: EventBus::new(),
        }
    }

    /// Manager over the operating system's serial ports.
    pub fn system(config: LinkConfig) -> Self {
        Self::new(Arc::new(SystemPorts), config)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        let inner = lock(&self.inner);
        inner.state == ConnectionState::Connected
            && inner.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// The active transport, if any.
    pub fn transport(&self) -> Option<Arc<Transport>> {
        lock(&self.inner).transport.clone()
    }

    pub fn available_ports(&self) -> Result<Vec<String>> {
        self.opener.available_ports()
    }

    /// Enumerated ports minus the denylisted ones.
    pub fn candidate_ports(&self) -> Result<Vec<String>> {
        let ports = self.opener.available_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| {
                let denied = port::is_denied(p, &self.config.port_denylist);
                if denied {
                    debug!("Skipping denylisted port {}", p);
                }
                !denied
            })
            .collect())
    }

    /// Open `port_name` directly.
    ///
    /// No ping is exchanged, so this reports connected even if the peer is not
    /// an array controller.
    pub fn manual_connect(&self, port_name: &str, baud_rate: u32) -> bool {
        if self.transport().is_some() {
            self.disconnect();
        }
        self.finish_teardown();
        match Transport::connect_with_baud(self.opener.as_ref(), port_name, baud_rate, &self.config)
        {
            Ok(transport) => {
                info!("Manually connected to {}", port_name);
                self.install(transport);
                true
            }
            Err(e) => {
                warn!("Failed to open {}: {}", port_name, e);
                lock(&self.inner).state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Close the active transport, if any, and raise `Disconnected`.
    pub fn disconnect(&self) {
        let previous = {
            let mut inner = lock(&self.inner);
            if inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Disconnected;
            }
            inner.transport.take()
        };
        if let Some(transport) = previous {
            transport.disconnect();
            self.events.emit(&ConnectionEvent::Disconnected);
        }
    }

    /// Tear the current session down and scan again.
    pub fn reconnect(&self) -> bool {
        self.disconnect();
        self.scan_and_connect()
    }

    /// Race a ping probe on every candidate port and connect to the first that answers.
    ///
    /// Returns immediately if a scan is already running or a live connection
    /// exists. A dead transport still installed is closed before any port is
    /// probed. Blocks until every probe has finished.
    pub fn scan_and_connect(&self) -> bool {
        let stale = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ConnectionState::Scanning => {
                    debug!("Scan already in progress");
                    return false;
                }
                ConnectionState::Connected
                    if inner.transport.as_ref().is_some_and(|t| t.is_connected()) =>
                {
                    return true;
                }
                _ => inner.state = ConnectionState::Scanning,
            }
            inner.transport.take()
        };
        if let Some(stale) = stale {
            debug!("Closing stale transport on {} before scanning", stale.port_name());
            stale.disconnect();
        }
        self.finish_teardown();

        let ports = match self.candidate_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Could not enumerate serial ports: {}", e);
                Vec::new()
            }
        };
        if ports.is_empty() {
            info!("No candidate serial ports found");
            lock(&self.inner).state = ConnectionState::Disconnected;
            return false;
        }
        info!("Scanning ports: {}", ports.join(", "));

        let (winner, probes) = self.race(&ports);
        let connected = match winner {
            Some(transport) => {
                info!("Device connected on {}", transport.port_name());
                self.install(transport);
                true
            }
            None => {
                info!("No device answered on {} port(s)", ports.len());
                lock(&self.inner).state = ConnectionState::Disconnected;
                false
            }
        };

        for probe in probes {
            if probe.join().is_err() {
                warn!("A port probe thread panicked");
            }
        }
        connected
    }

    /// Start one probe thread per port; return the first winner (if any) as
    /// soon as it is known, together with the probe handles.
    fn race(&self, ports: &[String]) -> (Option<Transport>, Vec<JoinHandle<()>>) {
        let (winner_tx, winner_rx) = crossbeam_channel::bounded::<Transport>(1);
        let claimed = Arc::new(AtomicBool::new(false));
        let mut probes = Vec::with_capacity(ports.len());

        for port_name in ports {
            let opener = Arc::clone(&self.opener);
            let config = self.config.clone();
            let claimed = Arc::clone(&claimed);
            let winner_tx = winner_tx.clone();
            let name = port_name.clone();
            let spawned = thread::Builder::new()
                .name(format!("umh-probe {port_name}"))
                .spawn(move || match probe(opener.as_ref(), &name, &config) {
                    Ok(transport) => {
                        if claimed.swap(true, Ordering::AcqRel) {
                            debug!("{} answered after another port won; closing", name);
                            transport.disconnect();
                        } else if let Err(e) = winner_tx.send(transport) {
                            e.into_inner().disconnect();
                        }
                    }
                    Err(e) => debug!("Probe of {} failed: {}", name, e),
                });
            match spawned {
                Ok(handle) => probes.push(handle),
                Err(e) => warn!("Could not spawn probe for {}: {}", port_name, e),
            }
        }
        drop(winner_tx);

        // Ends with the winner, or with an error once every probe has dropped its sender.
        (winner_rx.recv().ok(), probes)
    }

    /// Wait for a failed transport to finish closing.
    fn finish_teardown(&self) {
        let retiring = lock(&self.inner).retiring.take();
        if let Some(handle) = retiring {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Transport teardown thread panicked");
            }
        }
    }

    /// Make `transport` the active connection, replacing any previous one.
    fn install(&self, transport: Transport) {
        let transport = Arc::new(transport);
        self.watch(&transport);
        let previous = {
            let mut inner = lock(&self.inner);
            inner.state = ConnectionState::Connected;
            inner.transport.replace(Arc::clone(&transport))
        };
        if let Some(previous) = previous {
            previous.disconnect();
        }
        self.events.emit(&ConnectionEvent::Connected(transport));
    }

    /// Tear the connection down when `transport` fails underneath us.
    ///
    /// The failed transport is removed at once and closed on a teardown
    /// thread, since the failure is usually reported on the reader thread,
    /// which cannot join itself. `Disconnected` is raised once the port is
    /// closed; scans and manual connects wait for the teardown first.
    fn watch(&self, transport: &Arc<Transport>) {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        let id = transport.id();
        transport.link_lost().subscribe(move |lost| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let failed = {
                let mut inner = lock(&inner);
                let current = inner.transport.as_ref().is_some_and(|t| t.id() == id);
                if current {
                    if inner.state == ConnectionState::Connected {
                        inner.state = ConnectionState::Disconnected;
                    }
                    inner.transport.take()
                } else {
                    None
                }
            };
            let Some(failed) = failed else {
                return;
            };
            warn!("Connection to {} dropped: {}", lost.port_name, lost.reason);
            let events = events.clone();
            let spawned = thread::Builder::new()
                .name(format!("umh-teardown {}", lost.port_name))
                .spawn(move || {
                    failed.disconnect();
                    events.emit(&ConnectionEvent::Disconnected);
                });
            match spawned {
                Ok(handle) => {
                    let previous = lock(&inner).retiring.replace(handle);
                    if let Some(previous) = previous {
                        let _ = previous.join();
                    }
                }
                Err(e) => warn!("Could not spawn teardown for {}: {}", lost.port_name, e),
            }
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
        self.finish_teardown();
    }
}

/// Open `port_name`, ping it and wait for the matching `Ping_ACK`.
///
/// Returns the open transport if the device answered. Otherwise the port is
/// closed again and the error says why (`Timeout` for no reply).
fn probe(opener: &dyn PortOpener, port_name: &str, config: &LinkConfig) -> Result<Transport> {
    let transport = Transport::connect(opener, port_name, config)?;
    let nonce: u8 = rand::random();
    let (hit_tx, hit_rx) = crossbeam_channel::bounded::<()>(1);
    let listener = transport.frames().subscribe(move |frame: &Frame| {
        if frame.response() == Some(Response::PingAck) && frame.payload.first() == Some(&nonce) {
            let _ = hit_tx.try_send(());
        }
    });

    let outcome = transport
        .try_send(Command::Ping as u8, &[nonce])
        .and_then(|()| {
            hit_rx.recv_timeout(config.probe_timeout).map_err(|_| {
                LinkError::Timeout(format!(
                    "no ping reply from {} within {:?}",
                    port_name, config.probe_timeout
                ))
            })
        });
    transport.frames().unsubscribe(listener);

    match outcome {
        Ok(()) => Ok(transport),
        Err(e) => {
            transport.disconnect();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPort, SimulatedPorts};
    use std::time::{Duration, Instant};

    fn closes_within(port: &SimPort, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while port.is_open() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn silent_port_ping_times_out_and_closes_it() {
        let ports = SimulatedPorts::new();
        let port = ports.add_silent("quiet");
        let result = probe(&ports, "quiet", &LinkConfig::default());
        assert!(matches!(result, Err(LinkError::Timeout(_))));
        assert!(closes_within(&port, Duration::from_secs(2)));
    }

    #[test]
    fn answering_device_keeps_the_port_open() {
        let ports = SimulatedPorts::new();
        let port = ports.add_device("dev");
        let transport = probe(&ports, "dev", &LinkConfig::default()).unwrap();
        assert!(transport.is_connected());
        assert!(port.is_open());
    }

    #[test]
    fn failing_ping_write_reports_the_io_error() {
        let ports = SimulatedPorts::new();
        let port = ports.add_device("dev");
        port.stall_writes(true);
        let result = probe(&ports, "dev", &LinkConfig::default());
        assert!(matches!(result, Err(LinkError::Io(_))));
        assert!(closes_within(&port, Duration::from_secs(2)));
    }
}
