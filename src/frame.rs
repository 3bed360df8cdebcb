//! Wire framing for the haptics link.
//!
//! ```text
//! 0xAA 0x55 | code | len | payload[len] | checksum | 0x0D 0x0A
//! ```
//!
//! The checksum is `(code + len + sum(payload)) mod 256`. It is a plain additive
//! sum: it catches any single corrupted byte but not reorderings or corruptions
//! that cancel out modulo 256.

use log::debug;

use crate::errors::FrameError;
use crate::ring::RingBuffer;

// ============================================================================
// Constants
// ============================================================================

pub const HEADER: [u8; 2] = [0xAA, 0x55];
pub const TAIL: [u8; 2] = [0x0D, 0x0A];

/// Header, code, length, checksum and tail.
pub const FRAME_OVERHEAD: usize = 7;

/// Largest payload a single length byte can describe.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

// ============================================================================
// Codes
// ============================================================================

/// Host to device command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    EnableDisable = 0x01,
    Ping = 0x02,
    GetStatus = 0x03,
    SetStimulation = 0x04,
    SetPhases = 0x05,
    GetConfig = 0x06,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::EnableDisable),
            0x02 => Ok(Command::Ping),
            0x03 => Ok(Command::GetStatus),
            0x04 => Ok(Command::SetStimulation),
            0x05 => Ok(Command::SetPhases),
            0x06 => Ok(Command::GetConfig),
            other => Err(other),
        }
    }
}

/// Device to host response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Response {
    Ack = 0x80,
    Nack = 0x81,
    PingAck = 0x82,
    ReturnStatus = 0x83,
    /// Stimulation accepted.
    Sack = 0x84,
    ReturnConfig = 0x85,
    Error = 0xFF,
}

impl TryFrom<u8> for Response {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x80 => Ok(Response::Ack),
            0x81 => Ok(Response::Nack),
            0x82 => Ok(Response::PingAck),
            0x83 => Ok(Response::ReturnStatus),
            0x84 => Ok(Response::Sack),
            0x85 => Ok(Response::ReturnConfig),
            0xFF => Ok(Response::Error),
            other => Err(other),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One checksum-validated wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// The response code, if this is a known device response.
    pub fn response(&self) -> Option<Response> {
        Response::try_from(self.code).ok()
    }

    /// Total encoded size.
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serialize back to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.code, &self.payload)
    }

    /// Parse exactly one frame occupying the whole of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[..2] != HEADER {
            return Err(FrameError::BadHeader(bytes[0], bytes[1]));
        }
        let code = bytes[2];
        let len = bytes[3];
        let declared = len as usize;
        let actual = bytes.len() - FRAME_OVERHEAD;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }
        let end = bytes.len();
        if bytes[end - 2..] != TAIL {
            return Err(FrameError::BadTail(bytes[end - 2], bytes[end - 1]));
        }
        let payload = &bytes[4..4 + declared];
        let received = bytes[end - 3];
        let calculated = checksum(code, len, payload);
        if received != calculated {
            return Err(FrameError::Checksum {
                received,
                calculated,
            });
        }
        Ok(Frame::new(code, payload))
    }
}

/// Additive checksum over code, length and payload.
pub fn checksum(code: u8, len: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(code.wrapping_add(len), |acc, &b| acc.wrapping_add(b))
}

/// Build the wire bytes for one frame.
pub fn encode(code: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let len = payload.len() as u8;
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.extend_from_slice(&HEADER);
    out.push(code);
    out.push(len);
    out.extend_from_slice(payload);
    out.push(checksum(code, len, payload));
    out.extend_from_slice(&TAIL);
    Ok(out)
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Counters for bytes thrown away while hunting for frame alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub frames: usize,
    pub skipped_bytes: usize,
    pub checksum_errors: usize,
    pub tail_errors: usize,
}

/// Drain every complete, valid frame from the front of `ring`.
///
/// Misaligned or corrupt data is dropped one byte at a time until a header,
/// tail and checksum line up again. An incomplete frame at the front stays
/// buffered for the next call.
pub fn parse_all(ring: &RingBuffer) -> Vec<Frame> {
    parse_all_with_stats(ring).0
}

/// Like [`parse_all`], also reporting what had to be discarded.
pub fn parse_all_with_stats(ring: &RingBuffer) -> (Vec<Frame>, ParseStats) {
    let mut frames = Vec::new();
    let mut stats = ParseStats::default();

    while ring.len() >= FRAME_OVERHEAD {
        let (Some(h0), Some(h1)) = (ring.peek_byte(0), ring.peek_byte(1)) else {
            break;
        };
        if [h0, h1] != HEADER {
            stats.skipped_bytes += ring.skip(1);
            continue;
        }

        let Some(len) = ring.peek_byte(3) else {
            break;
        };
        let total = FRAME_OVERHEAD + len as usize;
        if ring.len() < total {
            break;
        }

        let candidate = ring.peek(total);
        if candidate[total - 2..] != TAIL {
            debug!(
                "Resync: bad tail {:02X?} for code {:#04X} len {}",
                &candidate[total - 2..],
                candidate[2],
                len
            );
            stats.tail_errors += 1;
            stats.skipped_bytes += ring.skip(1);
            continue;
        }

        let code = candidate[2];
        let payload = &candidate[4..4 + len as usize];
        let received = candidate[total - 3];
        let calculated = checksum(code, len, payload);
        if received != calculated {
            debug!(
                "Resync: checksum mismatch for code {:#04X} (received: {:#04X}, calculated: {:#04X})",
                code, received, calculated
            );
            stats.checksum_errors += 1;
            stats.skipped_bytes += ring.skip(1);
            continue;
        }

        ring.skip(total);
        frames.push(Frame::new(code, payload));
        stats.frames += 1;
    }

    if stats.checksum_errors > 0 || stats.tail_errors > 0 {
        debug!(
            "Discarded {} bytes while resyncing ({} checksum, {} tail errors)",
            stats.skipped_bytes, stats.checksum_errors, stats.tail_errors
        );
    }

    (frames, stats)
}
