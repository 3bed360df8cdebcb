//! Serial port abstraction.
//!
//! The transport only needs three things from a port: byte I/O, a timeout it can
//! change, and a second handle so reads and writes can happen on different
//! threads. [`SystemPorts`] provides these over the `serialport` crate; the
//! simulator in [`crate::sim`] provides them in memory.

use std::io::{Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::Result;

/// An open, bidirectional serial handle.
pub trait SerialLink: Read + Write + Send {
    /// Open a second handle to the same port.
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>>;

    /// Timeout applied to subsequent blocking reads and writes on this handle.
    fn set_link_timeout(&mut self, timeout: Duration) -> Result<()>;
}

/// Enumerates and opens ports by name.
pub trait PortOpener: Send + Sync {
    fn available_ports(&self) -> Result<Vec<String>>;

    /// Open `name` at `baud_rate`, 8-N-1, with `timeout` for blocking I/O.
    fn open(&self, name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialLink>>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        let clone = self.try_clone()?;
        Ok(Box::new(clone))
    }

    fn set_link_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }
}

/// Ports provided by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn available_ports(&self) -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open(&self, name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;
        debug!("Opened {} at {} baud", name, baud_rate);
        Ok(Box::new(port))
    }
}

/// Whether `port` matches any denylisted substring, ignoring case.
pub fn is_denied(port: &str, denylist: &[String]) -> bool {
    let lower = port.to_lowercase();
    denylist
        .iter()
        .any(|deny| !deny.is_empty() && lower.contains(&deny.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_is_case_insensitive_substring() {
        let deny = vec!["Bluetooth".to_string()];
        assert!(is_denied("/dev/tty.Bluetooth-Incoming-Port", &deny));
        assert!(is_denied("/dev/cu.BLUETOOTH", &deny));
        assert!(!is_denied("/dev/ttyACM0", &deny));
        assert!(!is_denied("COM3", &[String::new()]));
    }
}
