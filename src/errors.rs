use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not connected")]
    NotConnected,
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Reasons a byte slice is not a single well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad header {0:#04X} {1:#04X}")]
    BadHeader(u8, u8),
    #[error("bad tail {0:#04X} {1:#04X}")]
    BadTail(u8, u8),
    #[error("length byte says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch (received: {received:#04X}, calculated: {calculated:#04X})")]
    Checksum { received: u8, calculated: u8 },
    #[error("payload of {0} bytes exceeds the 255-byte limit")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, LinkError>;
