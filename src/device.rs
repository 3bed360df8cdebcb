//! Typed device messages and their payload layouts.
//!
//! All multi-byte fields are little-endian and packed without padding.
//!
//! # Axis order
//!
//! Host vectors are `(x, y, z)`, but every vector goes on the wire as
//! `(x, z, y)`. The firmware has always received it this way; whether that
//! compensates for a coordinate convention or hides a bug is unconfirmed, so
//! the swap in `Vec3::write_wire` stays until the device side is checked.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::frame::MAX_PAYLOAD;

/// Size of a `ReturnConfig` payload.
pub const CONFIG_PAYLOAD_LEN: usize = 21;

/// Size of a `ReturnStatus` payload.
pub const STATUS_PAYLOAD_LEN: usize = 37;

/// Most phases a single `SetPhases` frame can carry (4 bytes each).
pub const MAX_PHASES: usize = MAX_PAYLOAD / 4;

pub const DEFAULT_STRENGTH: f32 = 1.0;
pub const DEFAULT_FREQUENCY_HZ: f32 = 200.0;

// ============================================================================
// Vectors
// ============================================================================

/// A position or direction in host coordinates, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Append as `(x, z, y)`.
    fn write_wire(&self, out: &mut Vec<u8>) {
        for v in [self.x, self.z, self.y] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

// ============================================================================
// Stimulation
// ============================================================================

/// Discriminant byte of a stimulation on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StimulationKind {
    Point = 0,
    Vibration = 1,
    Linear = 2,
    Circular = 3,
}

impl TryFrom<u8> for StimulationKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(StimulationKind::Point),
            1 => Ok(StimulationKind::Vibration),
            2 => Ok(StimulationKind::Linear),
            3 => Ok(StimulationKind::Circular),
            other => Err(other),
        }
    }
}

/// Focus-point trajectory shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Static focus point.
    Point { position: Vec3 },
    /// Focus oscillating between two points.
    Vibration { start: Vec3, end: Vec3 },
    /// Linear spatio-temporal modulation from `start` to `end`.
    Linear { start: Vec3, end: Vec3 },
    /// Circular spatio-temporal modulation.
    Circular {
        center: Vec3,
        normal: Vec3,
        radius: f32,
    },
}

impl Shape {
    pub fn kind(&self) -> StimulationKind {
        match self {
            Shape::Point { .. } => StimulationKind::Point,
            Shape::Vibration { .. } => StimulationKind::Vibration,
            Shape::Linear { .. } => StimulationKind::Linear,
            Shape::Circular { .. } => StimulationKind::Circular,
        }
    }

    /// Bytes this shape occupies after the discriminant.
    pub fn data_len(&self) -> usize {
        match self {
            Shape::Point { .. } => 12,
            Shape::Vibration { .. } | Shape::Linear { .. } => 24,
            Shape::Circular { .. } => 28,
        }
    }

    fn write_data(&self, out: &mut Vec<u8>) {
        match self {
            Shape::Point { position } => position.write_wire(out),
            Shape::Vibration { start, end } | Shape::Linear { start, end } => {
                start.write_wire(out);
                end.write_wire(out);
            }
            Shape::Circular {
                center,
                normal,
                radius,
            } => {
                center.write_wire(out);
                normal.write_wire(out);
                out.extend_from_slice(&radius.to_le_bytes());
            }
        }
    }
}

/// A stimulation command: shape plus intensity and modulation frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stimulation {
    pub shape: Shape,
    /// Relative output strength, 0.0 to 1.0.
    pub strength: f32,
    /// Modulation frequency in Hz.
    pub frequency: f32,
}

impl Stimulation {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            strength: DEFAULT_STRENGTH,
            frequency: DEFAULT_FREQUENCY_HZ,
        }
    }

    pub fn point(position: Vec3) -> Self {
        Self::new(Shape::Point { position })
    }

    pub fn vibration(start: Vec3, end: Vec3) -> Self {
        Self::new(Shape::Vibration { start, end })
    }

    pub fn linear(start: Vec3, end: Vec3) -> Self {
        Self::new(Shape::Linear { start, end })
    }

    pub fn circular(center: Vec3, normal: Vec3, radius: f32) -> Self {
        Self::new(Shape::Circular {
            center,
            normal,
            radius,
        })
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn kind(&self) -> StimulationKind {
        self.shape.kind()
    }

    /// `SetStimulation` payload: kind, shape data, strength, frequency.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.shape.data_len() + 8);
        out.push(self.kind() as u8);
        self.shape.write_data(&mut out);
        out.extend_from_slice(&self.strength.to_le_bytes());
        out.extend_from_slice(&self.frequency.to_le_bytes());
        out
    }
}

/// Pack phases for `SetPhases`, rejecting more than [`MAX_PHASES`].
pub fn phases_payload(phases: &[f32]) -> Result<Vec<u8>> {
    if phases.len() > MAX_PHASES {
        return Err(LinkError::Validation(format!(
            "too many phases ({}); a frame carries at most {MAX_PHASES}",
            phases.len()
        )));
    }
    let mut out = Vec::with_capacity(phases.len() * 4);
    for phase in phases {
        out.extend_from_slice(&phase.to_le_bytes());
    }
    Ok(out)
}

// ============================================================================
// Device config
// ============================================================================

/// Transducer layout reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayType {
    Rect,
    Hex,
    Unknown(u8),
}

impl From<u8> for ArrayType {
    fn from(value: u8) -> Self {
        match value {
            0 => ArrayType::Rect,
            1 => ArrayType::Hex,
            other => ArrayType::Unknown(other),
        }
    }
}

/// Static description of the connected array (`ReturnConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub version: i32,
    pub array_type: ArrayType,
    /// Transducers along one edge of the array.
    pub array_edge_size: i32,
    pub transducer_count: i32,
    /// Transducer diameter in meters.
    pub transducer_size: f32,
    /// Center-to-center pitch in meters.
    pub transducer_spacing: f32,
}

impl DeviceConfig {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut r = payload;
        read_config(&mut r).map_err(|_| short_payload("config", payload.len(), CONFIG_PAYLOAD_LEN))
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONFIG_PAYLOAD_LEN);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(match self.array_type {
            ArrayType::Rect => 0,
            ArrayType::Hex => 1,
            ArrayType::Unknown(b) => b,
        });
        out.extend_from_slice(&self.array_edge_size.to_le_bytes());
        out.extend_from_slice(&self.transducer_count.to_le_bytes());
        out.extend_from_slice(&self.transducer_size.to_le_bytes());
        out.extend_from_slice(&self.transducer_spacing.to_le_bytes());
        out
    }
}

// ============================================================================
// Device status
// ============================================================================

/// Periodic telemetry (`ReturnStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub voltage_vdda: f32,
    pub voltage_3v3: f32,
    pub voltage_5v0: f32,
    /// Board temperature in °C.
    pub temperature: f32,
    /// Seconds between stimulation refreshes.
    pub refresh_delta_time: f64,
    /// Firmware main loop rate in Hz.
    pub loop_freq: f32,
    /// Raw discriminant of the running stimulation, see [`DeviceStatus::active_stimulation`].
    pub active_stimulation_type: u8,
    pub calibration_mode: i32,
    pub phase_set_mode: i32,
}

impl DeviceStatus {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut r = payload;
        read_status(&mut r).map_err(|_| short_payload("status", payload.len(), STATUS_PAYLOAD_LEN))
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATUS_PAYLOAD_LEN);
        out.extend_from_slice(&self.voltage_vdda.to_le_bytes());
        out.extend_from_slice(&self.voltage_3v3.to_le_bytes());
        out.extend_from_slice(&self.voltage_5v0.to_le_bytes());
        out.extend_from_slice(&self.temperature.to_le_bytes());
        out.extend_from_slice(&self.refresh_delta_time.to_le_bytes());
        out.extend_from_slice(&self.loop_freq.to_le_bytes());
        out.push(self.active_stimulation_type);
        out.extend_from_slice(&self.calibration_mode.to_le_bytes());
        out.extend_from_slice(&self.phase_set_mode.to_le_bytes());
        out
    }

    pub fn active_stimulation(&self) -> Option<StimulationKind> {
        StimulationKind::try_from(self.active_stimulation_type).ok()
    }
}

fn read_config<R: Read>(r: &mut R) -> io::Result<DeviceConfig> {
    Ok(DeviceConfig {
        version: r.read_i32::<LittleEndian>()?,
        array_type: ArrayType::from(r.read_u8()?),
        array_edge_size: r.read_i32::<LittleEndian>()?,
        transducer_count: r.read_i32::<LittleEndian>()?,
        transducer_size: r.read_f32::<LittleEndian>()?,
        transducer_spacing: r.read_f32::<LittleEndian>()?,
    })
}

fn read_status<R: Read>(r: &mut R) -> io::Result<DeviceStatus> {
    Ok(DeviceStatus {
        voltage_vdda: r.read_f32::<LittleEndian>()?,
        voltage_3v3: r.read_f32::<LittleEndian>()?,
        voltage_5v0: r.read_f32::<LittleEndian>()?,
        temperature: r.read_f32::<LittleEndian>()?,
        refresh_delta_time: r.read_f64::<LittleEndian>()?,
        loop_freq: r.read_f32::<LittleEndian>()?,
        active_stimulation_type: r.read_u8()?,
        calibration_mode: r.read_i32::<LittleEndian>()?,
        phase_set_mode: r.read_i32::<LittleEndian>()?,
    })
}

fn short_payload(what: &str, got: usize, want: usize) -> LinkError {
    LinkError::Decode(format!("{what} payload is {got} bytes, expected {want}"))
}
