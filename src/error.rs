//! Unified error types for the bridge.
//!
//! Follows one discipline throughout: a typed enum per subsystem that every
//! fallible operation funnels into, keeping the agent's error handling
//! uniform. Connector errors are classified (retry vs escalate) by the
//! inverter agent, never by the connector itself.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the bridge funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid option value or broken referential integrity. Fatal at startup.
    Config(String),
    /// A connector call failed.
    Conn(ConnError),
    /// A register span could not be decoded into a sensor value.
    Decode(DecodeError),
    /// A command carried a value the sensor's validator rejected.
    Invalid(InvalidValue),
    /// Unrecoverable inverter connection loss; terminates the process after
    /// a grace delay so a supervisor can restart it.
    FatalInverter(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Conn(e) => write!(f, "connector: {e}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Invalid(e) => write!(f, "invalid value: {e}"),
            Self::FatalInverter(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Connector errors
// ---------------------------------------------------------------------------

/// Transport-level failures. Recoverable within a tick (the agent retries);
/// repeated failures escalate to a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    /// The per-call deadline expired.
    Timeout,
    /// The response could not be framed or failed its checksum.
    Frame,
    /// The peer closed the connection mid-request.
    Closed,
    /// The connection could not be established.
    Refused,
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Frame => write!(f, "framing error"),
            Self::Closed => write!(f, "connection closed"),
            Self::Refused => write!(f, "connection refused"),
        }
    }
}

impl From<ConnError> for Error {
    fn from(e: ConnError) -> Self {
        Self::Conn(e)
    }
}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// A sensor could not produce a value from the registers it was handed.
/// Swallowed per-sensor: the stored value stays stale, the tick continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Register count does not match the sensor's address width.
    WidthMismatch { expected: usize, got: usize },
    /// The register content is outside the representable range
    /// (e.g. a packed time of day with minute 75).
    BadContent(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WidthMismatch { expected, got } => {
                write!(f, "expected {expected} registers, got {got}")
            }
            Self::BadContent(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

// ---------------------------------------------------------------------------
// Command-side validation errors
// ---------------------------------------------------------------------------

/// A writable-sensor command was rejected. Surfaced back to the bus as a
/// retained error state; never interrupts the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidValue {
    /// Numeric value outside the sensor's `[min, max]` range.
    OutOfRange { value: f64, min: i64, max: i64 },
    /// Value is not one of the sensor's allowed options.
    NotAnOption(String),
    /// Value does not land on a register step (e.g. not a multiple of the
    /// sensor factor, or minutes off the program time grid).
    OffStep(String),
    /// Value has the wrong shape (e.g. `25:99` for a time of day).
    BadFormat(&'static str),
    /// The sensor is read-only.
    NotWritable,
}

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { value, min, max } => {
                write!(f, "{value} outside [{min}, {max}]")
            }
            Self::NotAnOption(v) => write!(f, "'{v}' is not an allowed option"),
            Self::OffStep(v) => write!(f, "'{v}' does not land on a register step"),
            Self::BadFormat(msg) => write!(f, "bad format: {msg}"),
            Self::NotWritable => write!(f, "sensor is read-only"),
        }
    }
}

impl From<InvalidValue> for Error {
    fn from(e: InvalidValue) -> Self {
        Self::Invalid(e)
    }
}
