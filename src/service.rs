//! The application-facing link service.
//!
//! A [`HapticsLink`] is constructed explicitly and handed to whoever needs the
//! device. It owns the [`ConnectionManager`], binds a fresh [`ProtocolHandler`]
//! to every new connection and keeps the last decoded config and status.
//! Incoming frames are decoded only inside [`HapticsLink::pump`], so the
//! snapshot and all [`DeviceEvent`] callbacks are updated on the pumping
//! thread. Stimulations written from other threads are queued and folded into
//! the snapshot on the next pump as well.
//!
//! When the config has a non-zero `status_poll_hz`, a background poller sends
//! `GetStatus` at that rate from construction until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::LinkConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::device::{DeviceConfig, DeviceStatus, Stimulation};
use crate::errors::{LinkError, Result};
use crate::events::{EventBus, ListenerId};
use crate::port::{PortOpener, SystemPorts};
use crate::protocol::{DeviceEvent, ProtocolHandler};

/// How often an idle poller rechecks whether polling was re-enabled.
const IDLE_POLL_CHECK: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Last known-good device state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub config: Option<DeviceConfig>,
    pub status: Option<DeviceStatus>,
    pub last_stimulation: Option<Stimulation>,
    pub last_error: Option<u8>,
}

impl DeviceSnapshot {
    fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::ConfigReceived(config) => self.config = Some(*config),
            DeviceEvent::StatusReceived(status) => self.status = Some(*status),
            DeviceEvent::StimulationSent(stimulation) => {
                self.last_stimulation = Some(*stimulation)
            }
            DeviceEvent::ErrorReceived(code) => self.last_error = Some(*code),
            _ => {}
        }
    }
}

type HandlerSlot = Arc<Mutex<Option<Arc<ProtocolHandler>>>>;

struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// One device session: connection lifecycle, protocol and status polling.
pub struct HapticsLink {
    manager: Arc<ConnectionManager>,
    events: EventBus<DeviceEvent>,
    handler: HandlerSlot,
    snapshot: Mutex<DeviceSnapshot>,
    sent_stimulations: (Sender<Stimulation>, Receiver<Stimulation>),
    connection_listener: ListenerId,
    poll_interval: Arc<Mutex<Option<Duration>>>,
    poller: Mutex<Option<Poller>>,
    shut_down: AtomicBool,
}

impl HapticsLink {
    /// Build a service over `opener`. Nothing is opened until a connect or scan.
    ///
    /// The status poller starts here when the config asks for polling.
    pub fn new(opener: Arc<dyn PortOpener>, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let poll_interval = config.status_poll_interval();
        let manager = Arc::new(ConnectionManager::new(opener, config));
        let events = EventBus::new();
        let handler: HandlerSlot = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&handler);
        let handler_events = events.clone();
        let connection_listener = manager.events().subscribe(move |event: &ConnectionEvent| {
            let next = match event {
                ConnectionEvent::Connected(transport) => Some(Arc::new(ProtocolHandler::new(
                    Arc::clone(transport),
                    handler_events.clone(),
                ))),
                ConnectionEvent::Disconnected => None,
            };
            let previous = std::mem::replace(&mut *lock(&slot), next);
            drop(previous);
        });

        let link = Self {
            manager,
            events,
            handler,
            snapshot: Mutex::new(DeviceSnapshot::default()),
            sent_stimulations: crossbeam_channel::unbounded(),
            connection_listener,
            poll_interval: Arc::new(Mutex::new(poll_interval)),
            poller: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        };
        if poll_interval.is_some() {
            link.start_polling()?;
        }
        Ok(link)
    }

    /// Service over the operating system's serial ports.
    pub fn system(config: LinkConfig) -> Result<Self> {
        Self::new(Arc::new(SystemPorts), config)
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Decoded device events, emitted from [`HapticsLink::pump`] and the send helpers.
    pub fn events(&self) -> &EventBus<DeviceEvent> {
        &self.events
    }

    pub fn connection_events(&self) -> &EventBus<ConnectionEvent> {
        self.manager.events()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn port_name(&self) -> Option<String> {
        self.manager
            .transport()
            .filter(|t| t.is_connected())
            .map(|t| t.port_name().to_string())
    }

    pub fn available_ports(&self) -> Result<Vec<String>> {
        self.manager.available_ports()
    }

    /// Probe every candidate port and connect to the first device that answers.
    pub fn scan(&self) -> bool {
        self.manager.scan_and_connect()
    }

    pub fn manual_connect(&self, port_name: &str, baud_rate: u32) -> bool {
        self.manager.manual_connect(port_name, baud_rate)
    }

    pub fn reconnect(&self) -> bool {
        self.manager.reconnect()
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    fn handler(&self) -> Option<Arc<ProtocolHandler>> {
        lock(&self.handler).clone()
    }

    fn with_handler(&self, what: &str, f: impl FnOnce(&ProtocolHandler) -> bool) -> bool {
        match self.handler() {
            Some(handler) => f(handler.as_ref()),
            None => {
                debug!("{} dropped: not connected", what);
                false
            }
        }
    }

    pub fn get_config(&self) -> bool {
        self.with_handler("GetConfig", ProtocolHandler::get_config)
    }

    pub fn get_status(&self) -> bool {
        self.with_handler("GetStatus", ProtocolHandler::get_status)
    }

    pub fn set_enable(&self, enable: bool) -> bool {
        self.with_handler("SetEnable", |h| h.set_enable(enable))
    }

    /// Send a stimulation. It shows up in the snapshot after the next pump.
    pub fn set_stimulation(&self, stimulation: &Stimulation) -> bool {
        let sent = self.with_handler("SetStimulation", |h| h.set_stimulation(stimulation));
        if sent {
            let _ = self.sent_stimulations.0.send(*stimulation);
        }
        sent
    }

    /// Send phases. Validation runs even while disconnected.
    pub fn set_phases(&self, phases: &[f32]) -> Result<bool> {
        match self.handler() {
            Some(handler) => handler.set_phases(phases),
            None => {
                crate::device::phases_payload(phases)?;
                Err(LinkError::NotConnected)
            }
        }
    }

    /// Decode queued frames, update the snapshot and emit their events.
    pub fn pump(&self) -> Vec<DeviceEvent> {
        let latest = self.sent_stimulations.1.try_iter().last();
        if let Some(stimulation) = latest {
            lock(&self.snapshot).last_stimulation = Some(stimulation);
        }
        let Some(handler) = self.handler() else {
            return Vec::new();
        };
        let events = handler.pump();
        if !events.is_empty() {
            let mut snapshot = lock(&self.snapshot);
            for event in &events {
                snapshot.apply(event);
            }
        }
        events
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        lock(&self.snapshot).status
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        lock(&self.snapshot).config
    }

    /// Change the status poll rate, starting the poller if it is not running.
    /// A running poller picks up the new rate after its current wait.
    pub fn set_refresh_rate(&self, hz: f32) -> Result<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(LinkError::Validation(format!(
                "refresh rate must be positive, got {hz}"
            )));
        }
        *lock(&self.poll_interval) = Some(Duration::from_secs_f64(1.0 / f64::from(hz)));
        debug!("Status poll rate set to {} Hz", hz);
        self.start_polling()
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        *lock(&self.poll_interval)
    }

    /// Start the background status poller. Does nothing if it already runs.
    ///
    /// The poller only sends `GetStatus`; replies are applied by [`HapticsLink::pump`].
    pub fn start_polling(&self) -> Result<()> {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return Ok(());
        }
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let slot = Arc::clone(&self.handler);
        let interval = Arc::clone(&self.poll_interval);
        let handle = thread::Builder::new()
            .name("umh-status-poll".to_string())
            .spawn(move || loop {
                let wait = lock(&interval).unwrap_or(IDLE_POLL_CHECK);
                match stopped.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if lock(&interval).is_none() {
                    continue;
                }
                let handler = lock(&slot).clone();
                if let Some(handler) = handler {
                    if handler.transport().is_connected() {
                        handler.get_status();
                    }
                }
            })?;
        *poller = Some(Poller { stop, handle });
        debug!("Status poller started");
        Ok(())
    }

    pub fn stop_polling(&self) {
        let poller = lock(&self.poller).take();
        if let Some(poller) = poller {
            let _ = poller.stop.send(());
            if poller.handle.join().is_err() {
                warn!("Status poller panicked");
            }
            debug!("Status poller stopped");
        }
    }

    /// Stop polling and close the connection. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_polling();
        self.manager.events().unsubscribe(self.connection_listener);
        self.manager.disconnect();
        lock(&self.handler).take();
        info!("Haptics link shut down");
    }
}

impl Drop for HapticsLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
