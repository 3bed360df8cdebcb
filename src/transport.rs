//! One open serial connection and its reader thread.
//!
//! The reader thread blocks on the port with a short timeout, appends whatever
//! arrives to the receive ring, runs the frame parser and raises a frame event
//! for every validated frame. Frame callbacks therefore run on the reader
//! thread; consumers that need to apply them elsewhere should queue them (see
//! [`EventBus::channel`]).

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::errors::{LinkError, Result};
use crate::events::EventBus;
use crate::frame::{self, Command, Frame};
use crate::port::{PortOpener, SerialLink};
use crate::ring::RingBuffer;

const READ_CHUNK_SIZE: usize = 1024;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Raised once when the port fails underneath an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLost {
    pub transport_id: u64,
    pub port_name: String,
    pub reason: String,
}

struct ReaderHandle {
    handle: JoinHandle<()>,
    /// Disconnects when the reader thread exits.
    done: Receiver<()>,
}

/// State shared between the transport and its reader thread.
struct Shared {
    id: u64,
    port_name: String,
    running: AtomicBool,
    buffer: RingBuffer,
    frames: EventBus<Frame>,
    lost: EventBus<LinkLost>,
}

impl Shared {
    /// Mark the link dead. Only the first caller raises the event.
    fn fail(&self, reason: String) {
        if self.running.swap(false, Ordering::AcqRel) {
            warn!("Serial link {} lost: {}", self.port_name, reason);
            self.buffer.clear();
            self.lost.emit(&LinkLost {
                transport_id: self.id,
                port_name: self.port_name.clone(),
                reason,
            });
        }
    }
}

/// An open connection to one serial port.
///
/// Dropping the transport disconnects it.
pub struct Transport {
    shared: Arc<Shared>,
    baud_rate: u32,
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    reader: Mutex<Option<ReaderHandle>>,
    reader_join_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport {
    /// Open `port_name` (8-N-1) and start the reader thread.
    pub fn connect(opener: &dyn PortOpener, port_name: &str, config: &LinkConfig) -> Result<Self> {
        Self::connect_with_baud(opener, port_name, config.baud_rate, config)
    }

    /// Like [`Transport::connect`] with an explicit baud rate.
    pub fn connect_with_baud(
        opener: &dyn PortOpener,
        port_name: &str,
        baud_rate: u32,
        config: &LinkConfig,
    ) -> Result<Self> {
        let read_link = opener.open(port_name, baud_rate, config.read_timeout)?;
        let mut writer = read_link.try_clone_link()?;
        writer.set_link_timeout(config.write_timeout)?;

        let shared = Arc::new(Shared {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            port_name: port_name.to_string(),
            running: AtomicBool::new(true),
            buffer: RingBuffer::new(config.ring_capacity),
            frames: EventBus::new(),
            lost: EventBus::new(),
        });

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("umh-reader {port_name}"))
            .spawn(move || {
                let _done = done_tx;
                read_loop(read_link, &thread_shared);
            })?;

        debug!(
            "Transport #{} connected to {} at {} baud",
            shared.id, port_name, baud_rate
        );

        Ok(Self {
            shared,
            baud_rate,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(ReaderHandle {
                handle,
                done: done_rx,
            })),
            reader_join_timeout: config.reader_join_timeout,
        })
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && lock(&self.writer).is_some()
    }

    /// Validated frames, raised on the reader thread.
    pub fn frames(&self) -> &EventBus<Frame> {
        &self.shared.frames
    }

    /// Raised when a read or write fails and the link is torn down.
    pub fn link_lost(&self) -> &EventBus<LinkLost> {
        &self.shared.lost
    }

    /// Bytes waiting in the receive ring for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Whether the reader thread is still running.
    pub fn reader_alive(&self) -> bool {
        lock(&self.reader)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Encode and write one command frame. Failures are logged and reported as `false`.
    pub fn send_frame(&self, command: Command, payload: &[u8]) -> bool {
        match self.try_send(command as u8, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "Send {:?} on {} failed: {}",
                    command, self.shared.port_name, e
                );
                false
            }
        }
    }

    /// Write a frame with an arbitrary code.
    ///
    /// A write error (including the write timeout) tears the link down.
    pub fn try_send(&self, code: u8, payload: &[u8]) -> Result<()> {
        let bytes = frame::encode(code, payload)?;
        let outcome = {
            let mut writer = lock(&self.writer);
            let link = match writer.as_mut() {
                Some(link) if self.shared.running.load(Ordering::Acquire) => link,
                _ => return Err(LinkError::NotConnected),
            };
            write_frame(&mut **link, &bytes)
        };
        match outcome {
            Ok(()) => {
                debug!("-> {:02X?}", bytes);
                Ok(())
            }
            Err(e) => {
                self.shared.fail(format!("write failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Stop the reader, close the port and drop buffered bytes. Idempotent.
    ///
    /// Waits up to the configured join timeout for the reader thread; a reader
    /// that does not stop in time is detached and exits on its next read timeout.
    pub fn disconnect(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);

        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            if reader.handle.thread().id() == thread::current().id() {
                debug!("disconnect() called from the reader thread; not joining");
            } else {
                match reader.done.recv_timeout(self.reader_join_timeout) {
                    Err(RecvTimeoutError::Timeout) => warn!(
                        "Reader thread for {} did not stop within {:?}; detaching",
                        self.shared.port_name, self.reader_join_timeout
                    ),
                    _ => {
                        if reader.handle.join().is_err() {
                            warn!("Reader thread for {} panicked", self.shared.port_name);
                        }
                    }
                }
            }
        }

        lock(&self.writer).take();
        self.shared.buffer.clear();

        if was_running {
            info!("Disconnected from {}", self.shared.port_name);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.shared.id)
            .field("port_name", &self.shared.port_name)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn write_frame(link: &mut dyn SerialLink, bytes: &[u8]) -> io::Result<()> {
    link.write_all(bytes)?;
    link.flush()
}

fn read_loop(mut link: Box<dyn SerialLink>, shared: &Shared) {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while shared.running.load(Ordering::Acquire) {
        match link.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                shared.buffer.write(&chunk[..n]);
                for frame in frame::parse_all(&shared.buffer) {
                    debug!(
                        "<- code {:#04X}, {} payload bytes",
                        frame.code,
                        frame.payload.len()
                    );
                    shared.frames.emit(&frame);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                shared.fail(format!("read failed: {e}"));
                break;
            }
        }
    }
    debug!("Reader thread for {} exiting", shared.port_name);
}
