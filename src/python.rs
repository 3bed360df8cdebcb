//! Python bindings (`umh_link._core`).

use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::LinkConfig;
use crate::device::{ArrayType, DeviceConfig, DeviceStatus, Stimulation, Vec3};
use crate::errors::LinkError;
use crate::logging;
use crate::port::{PortOpener, SystemPorts};
use crate::service::HapticsLink;
use crate::sim::SimulatedPorts;

fn to_py_err(e: LinkError) -> PyErr {
    match e {
        LinkError::Validation(msg) => PyErr::new::<pyo3::exceptions::PyValueError, _>(msg),
        LinkError::NotConnected => {
            PyErr::new::<pyo3::exceptions::PyConnectionError, _>(e.to_string())
        }
        LinkError::Timeout(msg) => PyErr::new::<pyo3::exceptions::PyTimeoutError, _>(msg),
        other => PyErr::new::<pyo3::exceptions::PyIOError, _>(other.to_string()),
    }
}

/// Telemetry reported by the array controller.
///
/// Attributes:
///     voltage_vdda, voltage_3v3, voltage_5v0: Supply rails in Volts.
///     temperature: Board temperature in °C.
///     refresh_delta_time: Seconds between stimulation refreshes.
///     loop_freq: Firmware main loop rate in Hz.
///     stimulation_type: Raw discriminant of the running stimulation.
///     calibration_mode, phase_set_mode: Firmware mode flags.
#[pyclass(name = "DeviceStatus", frozen)]
#[derive(Clone)]
struct PyDeviceStatus {
    #[pyo3(get)]
    voltage_vdda: f32,
    #[pyo3(get)]
    voltage_3v3: f32,
    #[pyo3(get)]
    voltage_5v0: f32,
    #[pyo3(get)]
    temperature: f32,
    #[pyo3(get)]
    refresh_delta_time: f64,
    #[pyo3(get)]
    loop_freq: f32,
    #[pyo3(get)]
    stimulation_type: u8,
    #[pyo3(get)]
    calibration_mode: i32,
    #[pyo3(get)]
    phase_set_mode: i32,
}

#[pymethods]
impl PyDeviceStatus {
    fn __repr__(&self) -> String {
        format!(
            "DeviceStatus(vdda={:.2}V, 3v3={:.2}V, 5v0={:.2}V, temp={:.1}C, loop={:.1}Hz)",
            self.voltage_vdda, self.voltage_3v3, self.voltage_5v0, self.temperature, self.loop_freq
        )
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("voltage_vdda", self.voltage_vdda)?;
        dict.set_item("voltage_3v3", self.voltage_3v3)?;
        dict.set_item("voltage_5v0", self.voltage_5v0)?;
        dict.set_item("temperature", self.temperature)?;
        dict.set_item("refresh_delta_time", self.refresh_delta_time)?;
        dict.set_item("loop_freq", self.loop_freq)?;
        dict.set_item("stimulation_type", self.stimulation_type)?;
        dict.set_item("calibration_mode", self.calibration_mode)?;
        dict.set_item("phase_set_mode", self.phase_set_mode)?;
        Ok(dict)
    }
}

impl From<DeviceStatus> for PyDeviceStatus {
    fn from(s: DeviceStatus) -> Self {
        PyDeviceStatus {
            voltage_vdda: s.voltage_vdda,
            voltage_3v3: s.voltage_3v3,
            voltage_5v0: s.voltage_5v0,
            temperature: s.temperature,
            refresh_delta_time: s.refresh_delta_time,
            loop_freq: s.loop_freq,
            stimulation_type: s.active_stimulation_type,
            calibration_mode: s.calibration_mode,
            phase_set_mode: s.phase_set_mode,
        }
    }
}

/// Static description of the connected array.
#[pyclass(name = "DeviceConfig", frozen)]
#[derive(Clone)]
struct PyDeviceConfig {
    #[pyo3(get)]
    version: i32,
    /// "rect", "hex" or "unknown(N)".
    #[pyo3(get)]
    array_type: String,
    #[pyo3(get)]
    array_edge_size: i32,
    #[pyo3(get)]
    transducer_count: i32,
    #[pyo3(get)]
    transducer_size: f32,
    #[pyo3(get)]
    transducer_spacing: f32,
}

#[pymethods]
impl PyDeviceConfig {
    fn __repr__(&self) -> String {
        format!(
            "DeviceConfig(version={}, array_type={}, transducers={})",
            self.version, self.array_type, self.transducer_count
        )
    }
}

impl From<DeviceConfig> for PyDeviceConfig {
    fn from(c: DeviceConfig) -> Self {
        let array_type = match c.array_type {
            ArrayType::Rect => "rect".to_string(),
            ArrayType::Hex => "hex".to_string(),
            ArrayType::Unknown(raw) => format!("unknown({raw})"),
        };
        PyDeviceConfig {
            version: c.version,
            array_type,
            array_edge_size: c.array_edge_size,
            transducer_count: c.transducer_count,
            transducer_size: c.transducer_size,
            transducer_spacing: c.transducer_spacing,
        }
    }
}

/// Connection to an ultrasonic haptics array.
///
/// Example:
///     >>> link = HapticsLink()
///     >>> link.scan()
///     >>> link.set_point(0.0, 0.0, 0.12)
///     >>> link.pump()
///     >>> print(link.get_status())
#[pyclass(name = "HapticsLink", unsendable)]
struct PyHapticsLink {
    inner: HapticsLink,
}

#[pymethods]
impl PyHapticsLink {
    /// Args:
    ///     simulate: Talk to an in-process simulated array on port "SIM0".
    ///     poll_hz: Status requests per second while connected (0 disables).
    #[new]
    #[pyo3(signature = (simulate=false, poll_hz=None))]
    fn new(simulate: bool, poll_hz: Option<f32>) -> PyResult<Self> {
        let mut config = LinkConfig::default();
        if let Some(hz) = poll_hz {
            config.status_poll_hz = hz;
        }
        let opener: Arc<dyn PortOpener> = if simulate {
            let ports = SimulatedPorts::new();
            ports.add_device("SIM0");
            Arc::new(ports)
        } else {
            Arc::new(SystemPorts)
        };
        let inner = HapticsLink::new(opener, config).map_err(to_py_err)?;
        Ok(PyHapticsLink { inner })
    }

    /// Open a port directly, without checking that a device answers.
    #[pyo3(signature = (port, baud=crate::config::BAUD_RATE))]
    fn connect(&self, port: &str, baud: u32) -> bool {
        self.inner.manual_connect(port, baud)
    }

    /// Probe every port and connect to the first device that answers a ping.
    fn scan(&self) -> bool {
        self.inner.scan()
    }

    fn reconnect(&self) -> bool {
        self.inner.reconnect()
    }

    fn disconnect(&self) {
        self.inner.disconnect()
    }

    #[getter]
    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    #[getter]
    fn port(&self) -> Option<String> {
        self.inner.port_name()
    }

    /// Ask the device for its status; the reply is applied by `pump()`.
    fn request_status(&self) -> bool {
        self.inner.get_status()
    }

    /// Ask the device for its config; the reply is applied by `pump()`.
    fn request_config(&self) -> bool {
        self.inner.get_config()
    }

    /// Latest status received, or None.
    fn get_status(&self) -> Option<PyDeviceStatus> {
        self.inner.status().map(PyDeviceStatus::from)
    }

    /// Latest config received, or None.
    fn get_config(&self) -> Option<PyDeviceConfig> {
        self.inner.config().map(PyDeviceConfig::from)
    }

    /// Send a point stimulation. Coordinates are in meters.
    #[pyo3(signature = (x, y, z, strength=crate::device::DEFAULT_STRENGTH, frequency=crate::device::DEFAULT_FREQUENCY_HZ))]
    fn set_point(&self, x: f32, y: f32, z: f32, strength: f32, frequency: f32) -> bool {
        let stimulation = Stimulation::point(Vec3::new(x, y, z))
            .with_strength(strength)
            .with_frequency(frequency);
        self.inner.set_stimulation(&stimulation)
    }

    /// Send per-transducer phases (at most 63).
    ///
    /// Raises:
    ///     ValueError: If more than 63 phases are given.
    ///     ConnectionError: If no device is connected.
    fn set_phases(&self, phases: Vec<f32>) -> PyResult<bool> {
        self.inner.set_phases(&phases).map_err(to_py_err)
    }

    fn set_enable(&self, enable: bool) -> bool {
        self.inner.set_enable(enable)
    }

    fn set_refresh_rate(&self, hz: f32) -> PyResult<()> {
        self.inner.set_refresh_rate(hz).map_err(to_py_err)
    }

    /// Apply received frames. Returns how many events were decoded.
    fn pump(&self) -> usize {
        self.inner.pump().len()
    }

    /// Stop polling and close the port.
    fn close(&self) {
        self.inner.shutdown()
    }

    fn __repr__(&self) -> String {
        match self.inner.port_name() {
            Some(port) => format!("HapticsLink(port={port})"),
            None => "HapticsLink(disconnected)".to_string(),
        }
    }
}

/// List serial ports known to the operating system.
#[pyfunction]
fn available_ports() -> PyResult<Vec<String>> {
    SystemPorts.available_ports().map_err(to_py_err)
}

/// Install the stderr logger. `level` overrides `UMH_LOG`/`RUST_LOG`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) {
    match level.and_then(logging::parse_level) {
        Some(level) => logging::init_with_level(level),
        None => logging::init_rust_logging(),
    }
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyHapticsLink>()?;
    m.add_class::<PyDeviceStatus>()?;
    m.add_class::<PyDeviceConfig>()?;
    m.add_function(wrap_pyfunction!(available_ports, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("DEFAULT_BAUD_RATE", crate::config::BAUD_RATE)?;
    m.add("MAX_PHASES", crate::device::MAX_PHASES)?;

    Ok(())
}
