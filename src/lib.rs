//! Host-side driver for ultrasonic mid-air haptics arrays on a serial link.
//!
//! The layers, bottom up:
//!
//! 1. [`ring::RingBuffer`] holds raw bytes from the port.
//! 2. [`frame`] encodes commands and pulls checksum-valid frames out of the
//!    ring, resynchronising byte by byte after garbage.
//! 3. [`transport::Transport`] owns one open port and a reader thread that
//!    raises a frame event per validated frame.
//! 4. [`connection::ConnectionManager`] finds the device by racing a ping probe
//!    on every port and keeps exactly one transport alive.
//! 5. [`protocol::ProtocolHandler`] turns frames into typed [`DeviceEvent`]s and
//!    typed requests into frames.
//! 6. [`service::HapticsLink`] ties it together for an application: explicit
//!    construction and shutdown, a frame queue drained by `pump()`, a last
//!    known-good snapshot and periodic status polling.
//!
//! # Wire format
//!
//! ```text
//! AA 55 | code | len | payload[len] | checksum | 0D 0A
//! checksum = (code + len + sum(payload)) mod 256
//! ```
//!
//! # Example
//!
//! ```no_run
//! use umh_link::{HapticsLink, LinkConfig, Stimulation, Vec3};
//!
//! let link = HapticsLink::system(LinkConfig::default())?;
//! if link.scan() {
//!     link.set_stimulation(&Stimulation::point(Vec3::new(0.0, 0.0, 0.12)));
//!     link.get_status();
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//!     link.pump();
//!     println!("{:?}", link.status());
//! }
//! # Ok::<(), umh_link::LinkError>(())
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod errors;
pub mod events;
pub mod frame;
pub mod logging;
pub mod port;
pub mod protocol;
pub mod ring;
pub mod service;
pub mod sim;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use config::LinkConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use device::{
    ArrayType, DeviceConfig, DeviceStatus, Shape, Stimulation, StimulationKind, Vec3,
};
pub use errors::*;
pub use events::{EventBus, ListenerId};
pub use frame::{Command, Frame, Response};
pub use port::{PortOpener, SerialLink, SystemPorts};
pub use protocol::{AckKind, DeviceEvent, ProtocolHandler};
pub use ring::RingBuffer;
pub use service::{DeviceSnapshot, HapticsLink};
pub use transport::{LinkLost, Transport};
