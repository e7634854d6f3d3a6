//! Modbus RTU protocol constants and vendor values for the inverter family
//!
//! Protocol ceilings follow the Modbus specification:
//! - Maximum PDU size: 253 bytes (RS485 ADU limit of 256 bytes minus address and CRC)
//! - Register limits are calculated to fit within the PDU size constraint
//!
//! Vendor values (link header, sentinel, password registers) describe the
//! BLE bridge used by the inverter and can be overridden through
//! [`LinkFraming`](crate::config::LinkFraming).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size per Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Slave address (1) + function code (1) + CRC (2), plus at least one body byte.
pub const MIN_FRAME_LEN: usize = 5;

/// Length of an FC03/FC06 request frame: slave + fc + 2 + 2 + crc.
pub const REQUEST_FRAME_LEN: usize = 8;

/// Length of the CRC trailer.
pub const CRC_LEN: usize = 2;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03 (Read Holding Registers)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Register Data: N × 2 bytes
/// - Total: 1 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: u16 = 125;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// High bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Exception Codes (vendor table)
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Operation failed / device busy
pub const EXCEPTION_OPERATION_FAILED: u8 = 0x04;

/// Wrong password
pub const EXCEPTION_PASSWORD_ERROR: u8 = 0x05;

/// Frame or length error
pub const EXCEPTION_FRAME_ERROR: u8 = 0x06;

/// Parameter is read-only
pub const EXCEPTION_READ_ONLY: u8 = 0x07;

/// Parameter locked while the inverter is running
pub const EXCEPTION_LOCKED_DURING_OPERATION: u8 = 0x08;

/// Register range requires a password first
pub const EXCEPTION_PASSWORD_PROTECTION: u8 = 0x09;

/// Request length error (more than 32 registers)
pub const EXCEPTION_LENGTH_ERROR: u8 = 0x0A;

/// Permission denied
pub const EXCEPTION_PERMISSION_DENIED: u8 = 0x0B;

// ============================================================================
// Device Addressing
// ============================================================================

/// Default slave address of the inverter behind the BLE bridge.
pub const DEFAULT_SLAVE_ID: u8 = 0x01;

/// First address of the password-protected parameter block.
pub const PROTECTED_RANGE_START: u16 = 0xE000;

/// Last address of the password-protected parameter block.
pub const PROTECTED_RANGE_END: u16 = 0xE0FF;

/// Register that unlocks the protected block when written with the password.
pub const PASSWORD_REGISTER: u16 = 0xE203;

// ============================================================================
// BLE Link Framing
// ============================================================================

/// Length of the link-layer prefix the BLE bridge puts in front of each frame.
pub const LINK_HEADER_LEN: usize = 8;

/// Byte value of the link-layer prefix.
pub const LINK_HEADER_BYTE: u8 = 0x00;

/// Byte repeated by the bridge when a span contains an unsupported address.
pub const SENTINEL_BYTE: u8 = 0x2D;

/// Minimum run of [`SENTINEL_BYTE`] that counts as the sentinel.
pub const MIN_SENTINEL_LEN: usize = 4;

/// Returns true when the address lies in the password-protected block.
#[inline]
pub fn is_protected_address(address: u16) -> bool {
    (PROTECTED_RANGE_START..=PROTECTED_RANGE_END).contains(&address)
}
