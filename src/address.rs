//! Register address newtype.
//!
//! Arithmetic never wraps: every operation re-validates the result against
//! the 16-bit address space and returns an error instead of overflowing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// A validated 16-bit register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterAddress(u16);

impl RegisterAddress {
    pub const MIN: RegisterAddress = RegisterAddress(0x0000);
    pub const MAX: RegisterAddress = RegisterAddress(0xFFFF);

    /// Build from any integer, rejecting values outside 0..=0xFFFF.
    pub fn new(value: impl Into<i64>) -> ModbusResult<Self> {
        let value = value.into();
        u16::try_from(value).map(Self).map_err(|_| {
            ModbusError::invalid_address(format!(
                "address {} outside 0x0000..=0xFFFF",
                value
            ))
        })
    }

    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Address `offset` registers further on.
    pub fn checked_add(self, offset: u16) -> ModbusResult<Self> {
        self.0.checked_add(offset).map(Self).ok_or_else(|| {
            ModbusError::invalid_address(format!("0x{:04X} + {} overflows", self.0, offset))
        })
    }

    /// Address `offset` registers earlier.
    pub fn checked_sub(self, offset: u16) -> ModbusResult<Self> {
        self.0.checked_sub(offset).map(Self).ok_or_else(|| {
            ModbusError::invalid_address(format!("0x{:04X} - {} underflows", self.0, offset))
        })
    }

    /// Distance from `base` to `self`, if `self` is not below `base`.
    #[inline]
    pub fn offset_from(self, base: RegisterAddress) -> Option<u16> {
        self.0.checked_sub(base.0)
    }

    /// Last address of a `width`-register block starting here.
    pub fn span_end(self, width: u16) -> ModbusResult<Self> {
        if width == 0 {
            return Err(ModbusError::invalid_data("span width must be at least 1"));
        }
        self.checked_add(width - 1)
    }
}

impl From<u16> for RegisterAddress {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<RegisterAddress> for u16 {
    fn from(address: RegisterAddress) -> Self {
        address.0
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert_eq!(RegisterAddress::new(0x0100).unwrap().value(), 0x0100);
        assert_eq!(RegisterAddress::new(0xFFFF).unwrap(), RegisterAddress::MAX);
        assert!(RegisterAddress::new(0x1_0000).is_err());
        assert!(RegisterAddress::new(-1).is_err());
    }

    #[test]
    fn test_arithmetic_revalidates() {
        let addr = RegisterAddress::from(0xFFFE);
        assert_eq!(addr.checked_add(1).unwrap(), RegisterAddress::MAX);
        assert!(addr.checked_add(2).is_err());
        assert!(RegisterAddress::MIN.checked_sub(1).is_err());
        assert_eq!(addr.span_end(2).unwrap().value(), 0xFFFF);
        assert!(addr.span_end(3).is_err());
        assert!(addr.span_end(0).is_err());
    }

    #[test]
    fn test_offset_and_display() {
        let base = RegisterAddress::from(0x0100);
        let addr = RegisterAddress::from(0x0105);
        assert_eq!(addr.offset_from(base), Some(5));
        assert_eq!(base.offset_from(addr), None);
        assert_eq!(addr.to_string(), "0x0105");
    }
}
