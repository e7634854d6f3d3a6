//! # Error Types
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. Errors are
//! grouped into five categories that drive how the engine reacts:
//!
//! | Category | Examples | Reaction |
//! |----------|----------|----------|
//! | Transient | timeout on one span, CRC fault, busy device | skip this cycle, retry next |
//! | Permanent | sentinel or illegal-address on a single register | add to the failed set |
//! | Link | not connected, breaker open, link dropped | abort the operation, reconnect |
//! | Validation | bad address, value out of range, short frame | rejected before any I/O |
//! | Authentication | protected register without password | actionable message to caller |

use thiserror::Error;

/// Result type used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Error category used by the orchestrators to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected this cycle, retried on the next one.
    Transient,
    /// Address confirmed unsupported by the device.
    Permanent,
    /// The link is unusable until a fresh connection is made.
    Link,
    /// Malformed input, never reaches the wire.
    Validation,
    /// Password gating failed.
    Authentication,
}

/// Errors raised by the codec, the transport and the orchestrators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Generic protocol violation (unexpected function code, slave mismatch, ...).
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Data that cannot be interpreted (short payload, odd byte count, ...).
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Frame too short or structurally broken.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC mismatch on a received frame.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// Device answered with an exception response.
    #[error("Device exception 0x{code:02X} on function 0x{function:02X}: {message}")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Function code the codec does not handle.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address out of range or address arithmetic overflow.
    #[error("Invalid address: {message}")]
    InvalidAddress { message: String },

    /// No response notification within the deadline.
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Link-level failure (write not acknowledged, link dropped, connect failed).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Exchange attempted while the link is down.
    #[error("Not connected")]
    NotConnected,

    /// Too many consecutive timeouts; the link was torn down.
    #[error("Stuck link: {timeouts} consecutive timeouts, forced disconnect")]
    CircuitOpen { timeouts: u32 },

    /// Connection attempts suspended until the backoff window ends.
    #[error("Connection attempts suspended for another {remaining_ms}ms")]
    Backoff { remaining_ms: u64 },

    /// Vendor sentinel: the requested span contains an address the device refuses.
    #[error("Unsupported register: {message}")]
    Unsupported { message: String },

    /// Protected register written without a valid password.
    #[error("Authentication failed: {message}")]
    Authentication { message: String, code: Option<u8> },

    /// Write queue at capacity.
    #[error("Write queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Invalid configuration or catalog.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ModbusError::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        ModbusError::InvalidData {
            message: message.into(),
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        ModbusError::Frame {
            message: message.into(),
        }
    }

    pub fn invalid_address(message: impl Into<String>) -> Self {
        ModbusError::InvalidAddress {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        ModbusError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        ModbusError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        ModbusError::Unsupported {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>, code: Option<u8>) -> Self {
        ModbusError::Authentication {
            message: message.into(),
            code,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ModbusError::Configuration {
            message: message.into(),
        }
    }

    /// Map the error onto the recovery taxonomy.
    ///
    /// Exceptions are transient here; whether an exception makes an address
    /// permanently unsupported depends on the request width and is decided
    /// by the read orchestrator.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ModbusError::Connection { .. }
            | ModbusError::NotConnected
            | ModbusError::CircuitOpen { .. }
            | ModbusError::Backoff { .. } => ErrorCategory::Link,
            ModbusError::Unsupported { .. } => ErrorCategory::Permanent,
            ModbusError::Authentication { .. } => ErrorCategory::Authentication,
            ModbusError::InvalidAddress { .. }
            | ModbusError::InvalidFunction { .. }
            | ModbusError::QueueFull { .. }
            | ModbusError::Configuration { .. } => ErrorCategory::Validation,
            ModbusError::Protocol { .. }
            | ModbusError::InvalidData { .. }
            | ModbusError::Frame { .. }
            | ModbusError::Crc { .. }
            | ModbusError::Exception { .. }
            | ModbusError::Timeout { .. } => ErrorCategory::Transient,
        }
    }

    /// True when the current operation must stop and the link reconnect.
    #[inline]
    pub fn is_link_error(&self) -> bool {
        self.category() == ErrorCategory::Link
    }

    /// True when the request was rejected before reaching the wire.
    #[inline]
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// True for timeouts waiting on a response notification.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout { .. })
    }

    /// Exception code carried by the error, if the device sent one.
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ModbusError::Exception { code, .. } => Some(*code),
            ModbusError::Authentication { code, .. } => *code,
            _ => None,
        }
    }
}
