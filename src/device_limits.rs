//! # Device Limits Configuration
//!
//! Limits that shape how register reads are grouped and retried.
//!
//! ## Protocol vs Device Ceilings
//!
//! - **Modbus FC03**: at most 125 registers per request
//! - **Inverter firmware**: at most 32 registers per request (exception 0x0A above that)
//!
//! The effective batch width is the smaller of the two. Reads over the BLE
//! bridge are slow enough that a gap of unrequested registers is often cheaper
//! than an extra round trip, so the allowed gap is configurable too.

use crate::constants::MAX_READ_REGISTERS;
use crate::error::{ModbusError, ModbusResult};

/// Default maximum registers per read request (inverter firmware limit).
pub const DEFAULT_MAX_BATCH_REGISTERS: u16 = 32;

/// Default number of unrequested registers tolerated inside one span.
pub const DEFAULT_MAX_GAP: u16 = 0;

/// Default split-retry recursion depth (32 → 16 → 8 → 4 → 2 → 1).
pub const DEFAULT_MAX_SPLIT_DEPTH: u8 = 5;

/// Default whole-span re-reads after a garbled answer before splitting.
pub const DEFAULT_MAX_RETRIES: u8 = 1;

/// Default capacity of the pending write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 20;

/// Default inter-request delay in milliseconds.
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 0;

/// Device-specific read and queueing limits.
///
/// # Example
///
/// ```rust
/// use voltage_ble_modbus::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_batch_registers(16)
///     .with_max_gap(2);
///
/// assert_eq!(limits.batch_ceiling(), 16);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum registers per read request.
    pub max_batch_registers: u16,
    /// Maximum unrequested registers bridged inside one span.
    pub max_gap: u16,
    /// Maximum split-retry recursion depth.
    pub max_split_depth: u8,
    /// Whole-span re-reads after a garbled answer.
    pub max_retries: u8,
    /// Capacity of the pending write queue.
    pub write_queue_capacity: usize,
    /// Minimum delay between requests (milliseconds).
    pub inter_request_delay_ms: u64,
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_registers(mut self, count: u16) -> Self {
        self.max_batch_registers = count;
        self
    }

    pub fn with_max_gap(mut self, gap: u16) -> Self {
        self.max_gap = gap;
        self
    }

    pub fn with_max_split_depth(mut self, depth: u8) -> Self {
        self.max_split_depth = depth;
        self
    }

    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    /// Effective span width: device limit capped by the protocol ceiling.
    #[inline]
    pub fn batch_ceiling(&self) -> u16 {
        self.max_batch_registers.clamp(1, MAX_READ_REGISTERS)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.max_batch_registers == 0 || self.max_batch_registers > MAX_READ_REGISTERS {
            return Err(ModbusError::configuration(format!(
                "max_batch_registers must be 1..={}, got {}",
                MAX_READ_REGISTERS, self.max_batch_registers
            )));
        }
        if self.write_queue_capacity == 0 {
            return Err(ModbusError::configuration(
                "write_queue_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_batch_registers: DEFAULT_MAX_BATCH_REGISTERS,
            max_gap: DEFAULT_MAX_GAP,
            max_split_depth: DEFAULT_MAX_SPLIT_DEPTH,
            max_retries: DEFAULT_MAX_RETRIES,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
