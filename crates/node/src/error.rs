//! Error taxonomy for the node.
//!
//! Nothing here is fatal: sensor failures are retried on the next poll,
//! validation failures become a NAK on the bus, frame errors are dropped as
//! noise, and storage errors leave the in-memory configuration untouched.

use thiserror::Error;

use crate::bus::ValveId;

/// A hardware read that produced no usable value this attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor did not respond")]
    Timeout,
    #[error("sensor data failed its integrity check")]
    Corrupt,
    #[error("reading {0} outside plausible range")]
    OutOfRange(i32),
    #[error("sensor i/o: {0}")]
    Io(String),
}

/// A configuration parameter or command argument outside its legal domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(i64),
    #[error("leak threshold {0} out of range [1, 32767]")]
    LeakThresholdOutOfRange(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValveError {
    #[error("no valve {0}")]
    UnknownValve(ValveId),
    #[error("invalid duration {0} ms")]
    InvalidDuration(i64),
}

/// Why an inbound frame was discarded.  Never surfaced past the bus adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds {0} bytes")]
    Overflow(usize),
    #[error("missing checksum")]
    MissingChecksum,
    #[error("checksum mismatch: frame says {expected:04X}, computed {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("payload is not ASCII")]
    NotAscii,
    #[error("addressed to {0:?}")]
    OtherAddress(String),
    #[error("reply frame from another node")]
    ReplyFrame,
    #[error("malformed command: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable")]
    Unavailable,
}

/// Failure of the parameter-set path: either the value was rejected or it
/// could not be persisted.  The store is unchanged in both cases.
#[derive(Debug, Error)]
pub enum SetParamError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("persist failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("transmit queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
}
