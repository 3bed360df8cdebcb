//! Link settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::ring;

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate of the array controller.
pub const BAUD_RATE: u32 = 115200;

/// Blocking read timeout; bounds how long the reader thread takes to notice shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a scan probe waits for its ping to be echoed.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// How long `disconnect` waits for the reader thread before detaching it.
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Status requests per second while connected.
pub const STATUS_POLL_HZ: f32 = 30.0;

/// Settings shared by the transport, the connection manager and the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub probe_timeout: Duration,
    pub reader_join_timeout: Duration,
    /// Receive ring size in bytes.
    pub ring_capacity: usize,
    /// Port names containing any of these (case-insensitive) are never probed.
    pub port_denylist: Vec<String>,
    /// `0.0` disables status polling.
    pub status_poll_hz: f32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            reader_join_timeout: READER_JOIN_TIMEOUT,
            ring_capacity: ring::DEFAULT_CAPACITY,
            port_denylist: vec!["Bluetooth".to_string()],
            status_poll_hz: STATUS_POLL_HZ,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(LinkError::Validation(msg.to_string()));
        if self.baud_rate == 0 {
            return fail("baud_rate must be non-zero");
        }
        if self.ring_capacity < crate::frame::FRAME_OVERHEAD + crate::frame::MAX_PAYLOAD {
            return fail("ring_capacity must hold at least one maximum-size frame");
        }
        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("probe_timeout", self.probe_timeout),
        ] {
            if value.is_zero() {
                return Err(LinkError::Validation(format!("{name} must be non-zero")));
            }
        }
        if !self.status_poll_hz.is_finite() || self.status_poll_hz < 0.0 {
            return fail("status_poll_hz must be a finite, non-negative rate");
        }
        Ok(())
    }

    /// Interval between status polls, `None` when polling is disabled.
    pub fn status_poll_interval(&self) -> Option<Duration> {
        if self.status_poll_hz > 0.0 {
            Some(Duration::from_secs_f64(1.0 / f64::from(self.status_poll_hz)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.read_timeout, Duration::from_millis(100));
        assert_eq!(config.write_timeout, Duration::from_millis(500));
        assert_eq!(config.probe_timeout, Duration::from_millis(200));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = LinkConfig {
            ring_capacity: 16,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());

        config = LinkConfig {
            probe_timeout: Duration::ZERO,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());

        config = LinkConfig {
            status_poll_hz: f32::NAN,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn poll_interval_follows_rate() {
        let mut config = LinkConfig {
            status_poll_hz: 10.0,
            ..LinkConfig::default()
        };
        assert_eq!(config.status_poll_interval(), Some(Duration::from_millis(100)));
        config.status_poll_hz = 0.0;
        assert_eq!(config.status_poll_interval(), None);
    }
}
