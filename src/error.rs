//! Error types for the Modbus engine.
//!
//! All failures surface as [`ModbusError`]. Public engine operations never
//! unwind: errors are captured into an [`ExchangeResult`](crate::engine::ExchangeResult)
//! together with the request/response traces.

use std::fmt;

use thiserror::Error;

/// Result alias used across the crate.
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Status code reported for connect and transport timeouts.
pub const TIMEOUT_ERROR_CODE: u16 = 408;

/// Sub-kind of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// No bytes (or not enough bytes) arrived before the deadline.
    Timeout,
    /// Peer closed or reset the connection.
    Reset,
    /// Any other I/O failure.
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Reset => write!(f, "connection reset"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

/// Modbus engine errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Address text did not match `station;function;address[.bit]`
    #[error("Malformed address '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// Transport could not be opened
    #[error("Connect failed: {message}")]
    Connect { message: String, timed_out: bool },

    /// Send or receive failed on an open transport
    #[error("Transport {kind}: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Response check-head does not match the request (stale or foreign frame)
    #[error("Check-head mismatch: sent {expected:02X?}, received {actual:02X?}")]
    CheckHeadMismatch { expected: [u8; 2], actual: [u8; 2] },

    /// RTU frame failed CRC16 verification
    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },

    /// Echoed function code differs from the request
    #[error("Unexpected function code: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Device answered with a Modbus exception
    #[error("Modbus exception 0x{code:02X} on function 0x{function:02X}: {message}")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Transport returned zero bytes
    #[error("Empty response")]
    EmptyResponse,

    /// Frame is truncated or structurally invalid
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Function code not supported by the requested operation
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Caller data cannot be encoded or decoded
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Protocol-level inconsistency
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Caller bug or inconsistent configuration (e.g. data type not valid for a function)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation requires an open transport
    #[error("Not connected")]
    NotConnected,
}

impl ModbusError {
    pub fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        ModbusError::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connect {
            message: msg.into(),
            timed_out: false,
        }
    }

    pub fn connect_timeout(msg: impl Into<String>) -> Self {
        ModbusError::Connect {
            message: msg.into(),
            timed_out: true,
        }
    }

    /// Transport timeout for `operation` after `timeout_ms`.
    pub fn timeout(operation: impl fmt::Display, timeout_ms: u64) -> Self {
        ModbusError::Transport {
            kind: TransportErrorKind::Timeout,
            message: format!("{} timed out after {}ms", operation, timeout_ms),
        }
    }

    pub fn reset(msg: impl Into<String>) -> Self {
        ModbusError::Transport {
            kind: TransportErrorKind::Reset,
            message: msg.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ModbusError::Transport {
            kind: TransportErrorKind::Io,
            message: msg.into(),
        }
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::Frame {
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol {
            message: msg.into(),
        }
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        ModbusError::InvalidData {
            message: msg.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        ModbusError::InvalidFunction { code }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ModbusError::Configuration {
            message: msg.into(),
        }
    }

    /// Classify a `std::io::Error` raised while sending or receiving.
    pub fn from_io(operation: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => TransportErrorKind::Reset,
            _ => TransportErrorKind::Io,
        };
        ModbusError::Transport {
            kind,
            message: format!("{}: {}", operation, err),
        }
    }

    /// Numeric code reported alongside the message.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            ModbusError::Connect {
                timed_out: true, ..
            } => Some(TIMEOUT_ERROR_CODE),
            ModbusError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => Some(TIMEOUT_ERROR_CODE),
            ModbusError::Exception { code, .. } => Some(u16::from(*code)),
            _ => None,
        }
    }

    /// Check if this error is a timeout (connect or transport).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ModbusError::Connect {
                timed_out: true,
                ..
            } | ModbusError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            }
        )
    }

    /// Check if the failure happened on the wire (send/receive/connect).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ModbusError::Connect { .. } | ModbusError::Transport { .. } | ModbusError::NotConnected
        )
    }

    /// Check if the response frame itself was rejected.
    pub fn is_frame_validation(&self) -> bool {
        matches!(
            self,
            ModbusError::CheckHeadMismatch { .. }
                | ModbusError::CrcMismatch { .. }
                | ModbusError::UnexpectedFunction { .. }
                | ModbusError::EmptyResponse
                | ModbusError::Frame { .. }
        )
    }

    /// Whether retrying the same exchange can succeed.
    ///
    /// Parse/configuration errors and device exceptions are deterministic.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.is_frame_validation()
    }

    /// Whether the transport should be dropped and reopened.
    ///
    /// After a failed or rejected exchange the byte stream may still hold a
    /// partial or stale frame.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            ModbusError::Connect { .. } => false,
            other => other.is_retryable(),
        }
    }
}
