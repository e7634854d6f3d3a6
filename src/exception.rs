//! # Exception Codes
//!
//! The inverter reuses the Modbus exception slots 0x01-0x0B with its own
//! meanings. Some of them carry password semantics, which the write path
//! turns into actionable messages.
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0x01 | Illegal function |
//! | 0x02 | Illegal data address |
//! | 0x03 | Illegal data value |
//! | 0x04 | Operation failed / device busy |
//! | 0x05 | Wrong password |
//! | 0x06 | Frame or length error |
//! | 0x07 | Read-only parameter |
//! | 0x08 | Locked while running |
//! | 0x09 | Password protection active |
//! | 0x0A | Length error (more than 32 registers) |
//! | 0x0B | Permission denied |

use std::fmt;

use crate::constants::*;

/// Exception code returned by the device in an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    OperationFailed,
    PasswordError,
    FrameError,
    ReadOnly,
    LockedDuringOperation,
    PasswordProtection,
    LengthError,
    PermissionDenied,
    /// Code outside the documented table.
    Unknown(u8),
}

impl ExceptionCode {
    /// Map a raw code byte onto the table.
    pub fn from_code(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_OPERATION_FAILED => Self::OperationFailed,
            EXCEPTION_PASSWORD_ERROR => Self::PasswordError,
            EXCEPTION_FRAME_ERROR => Self::FrameError,
            EXCEPTION_READ_ONLY => Self::ReadOnly,
            EXCEPTION_LOCKED_DURING_OPERATION => Self::LockedDuringOperation,
            EXCEPTION_PASSWORD_PROTECTION => Self::PasswordProtection,
            EXCEPTION_LENGTH_ERROR => Self::LengthError,
            EXCEPTION_PERMISSION_DENIED => Self::PermissionDenied,
            other => Self::Unknown(other),
        }
    }

    /// Raw code byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            Self::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            Self::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            Self::OperationFailed => EXCEPTION_OPERATION_FAILED,
            Self::PasswordError => EXCEPTION_PASSWORD_ERROR,
            Self::FrameError => EXCEPTION_FRAME_ERROR,
            Self::ReadOnly => EXCEPTION_READ_ONLY,
            Self::LockedDuringOperation => EXCEPTION_LOCKED_DURING_OPERATION,
            Self::PasswordProtection => EXCEPTION_PASSWORD_PROTECTION,
            Self::LengthError => EXCEPTION_LENGTH_ERROR,
            Self::PermissionDenied => EXCEPTION_PERMISSION_DENIED,
            Self::Unknown(code) => *code,
        }
    }

    /// Short description from the vendor table.
    pub fn description(&self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::OperationFailed => "Operation failed or device busy",
            Self::PasswordError => "Password error",
            Self::FrameError => "Frame or length error",
            Self::ReadOnly => "Parameter is read-only",
            Self::LockedDuringOperation => "Parameter locked during operation",
            Self::PasswordProtection => "Password protection active",
            Self::LengthError => "Length error (more than 32 registers)",
            Self::PermissionDenied => "Permission denied",
            Self::Unknown(_) => "Unknown exception",
        }
    }

    /// A single-register read answered with this code means the address does not exist.
    #[inline]
    pub fn marks_unsupported(&self) -> bool {
        matches!(self, Self::IllegalDataAddress)
    }

    /// Codes that relate to the password lock.
    #[inline]
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::PasswordError | Self::PasswordProtection | Self::PermissionDenied
        )
    }

    /// Codes worth retrying on a later cycle without any change on our side.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationFailed | Self::FrameError)
    }

    /// Message for a rejected write, phrased so the user knows what to change.
    pub fn write_message(&self, register: u16, value: u16) -> String {
        match self {
            Self::PermissionDenied => "Permission denied. Configure the inverter password \
                 (common defaults: 4321, 0000, 111111)"
                .to_string(),
            Self::PasswordError => "Incorrect password. Check the configured password".to_string(),
            Self::PasswordProtection => {
                "System locked. Configure the inverter password to unlock it".to_string()
            }
            Self::IllegalDataAddress => format!("Illegal data address: 0x{:04X}", register),
            Self::IllegalDataValue => {
                format!("Value {} out of range for register 0x{:04X}", value, register)
            }
            Self::ReadOnly => format!("Read-only register: 0x{:04X}", register),
            Self::LockedDuringOperation => format!(
                "Cannot modify register 0x{:04X} while the inverter is running",
                register
            ),
            Self::Unknown(code) => format!("Unknown error 0x{:02X}", code),
            other => other.description().to_string(),
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.code(), self.description())
    }
}
