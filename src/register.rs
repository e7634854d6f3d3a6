//! # Register Catalog
//!
//! Static description of the device register map and conversion between raw
//! words and engineering values.
//!
//! ## Supported Data Types
//!
//! | Type | Words | Aliases |
//! |------|-------|---------|
//! | U16 | 1 | uint16, u16, word |
//! | I16 | 1 | int16, i16, short |
//! | U32 | 2 | uint32, u32, dword |
//! | I32 | 2 | int32, i32, long |
//!
//! 32-bit values put the high word first. A register entry may claim more
//! words than its type needs (width 4 for a block the device only serves as a
//! whole); the value is taken from the leading words.
//!
//! ## Value Processing
//!
//! `value = round(raw * scale + offset, precision)`
//!
//! Encoding for writes is the inverse, `raw = round((value - offset) / scale)`,
//! checked against the entry's bounds and the type's range.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::address::RegisterAddress;
use crate::error::{ModbusError, ModbusResult};

/// Default number of decimals kept after scaling.
pub const DEFAULT_PRECISION: u8 = 2;

/// Numeric type of a register entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    U16,
    I16,
    U32,
    I32,
}

impl DataType {
    /// Number of 16-bit words the type occupies.
    #[inline]
    pub fn words(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 => 2,
        }
    }

    #[inline]
    pub fn is_signed(self) -> bool {
        matches!(self, DataType::I16 | DataType::I32)
    }

    /// Inclusive raw range representable by the type.
    pub fn raw_range(self) -> (i64, i64) {
        match self {
            DataType::U16 => (0, u16::MAX as i64),
            DataType::I16 => (i16::MIN as i64, i16::MAX as i64),
            DataType::U32 => (0, u32::MAX as i64),
            DataType::I32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }

    /// Interpret the leading words as this type.
    pub fn decode(self, words: &[u16]) -> ModbusResult<i64> {
        let needed = self.words() as usize;
        if words.len() < needed {
            return Err(ModbusError::invalid_data(format!(
                "Not enough registers for {}: need {}, got {}",
                self,
                needed,
                words.len()
            )));
        }
        let value = match self {
            DataType::U16 => words[0] as i64,
            DataType::I16 => words[0] as i16 as i64,
            DataType::U32 => (((words[0] as u32) << 16) | words[1] as u32) as i64,
            DataType::I32 => (((words[0] as u32) << 16) | words[1] as u32) as i32 as i64,
        };
        Ok(value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U16 => "uint16",
            DataType::I16 => "int16",
            DataType::U32 => "uint32",
            DataType::I32 => "int32",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uint16" | "u16" | "word" => Ok(DataType::U16),
            "int16" | "i16" | "short" => Ok(DataType::I16),
            "uint32" | "u32" | "dword" => Ok(DataType::U32),
            "int32" | "i32" | "long" => Ok(DataType::I32),
            _ => Err(ModbusError::configuration(format!(
                "Unsupported data type: {}",
                s
            ))),
        }
    }
}

/// Access rights of a register entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
    /// Command registers that cannot be polled.
    WriteOnly,
}

impl Access {
    #[inline]
    pub fn is_readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// One named entry of the register map. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSpec {
    pub name: String,
    pub address: RegisterAddress,
    /// Number of words claimed by the entry (1, 2 or 4).
    pub width: u16,
    pub data_type: DataType,
    pub scale: f64,
    pub offset: i64,
    pub unit: Option<String>,
    pub access: Access,
    /// Engineering-value bounds enforced on writes.
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Higher values are read first in a cycle.
    pub priority: u8,
    pub precision: u8,
}

impl RegisterSpec {
    /// Read-only single-word unsigned entry with unit scale.
    pub fn new(name: impl Into<String>, address: impl Into<RegisterAddress>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            width: 1,
            data_type: DataType::U16,
            scale: 1.0,
            offset: 0,
            unit: None,
            access: Access::ReadOnly,
            min: None,
            max: None,
            priority: 0,
            precision: DEFAULT_PRECISION,
        }
    }

    /// Set the data type; the width grows to fit the type if needed.
    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self.width = self.width.max(data_type.words());
        self
    }

    pub fn with_width(mut self, width: u16) -> Self {
        self.width = width;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }

    /// Last address claimed by the entry.
    #[inline]
    pub fn end(&self) -> u16 {
        self.address.value().saturating_add(self.width.saturating_sub(1))
    }

    /// Every address claimed by the entry.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        self.address.value()..=self.end()
    }

    /// Check the static shape of the entry.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.is_empty() {
            return Err(ModbusError::configuration("register name must not be empty"));
        }
        if !matches!(self.width, 1 | 2 | 4) {
            return Err(ModbusError::configuration(format!(
                "{}: width {} not in {{1, 2, 4}}",
                self.name, self.width
            )));
        }
        if self.width < self.data_type.words() {
            return Err(ModbusError::configuration(format!(
                "{}: width {} too small for {}",
                self.name, self.width, self.data_type
            )));
        }
        self.address.span_end(self.width).map_err(|_| {
            ModbusError::configuration(format!(
                "{}: {} words at {} run past 0xFFFF",
                self.name, self.width, self.address
            ))
        })?;
        if self.scale == 0.0 || !self.scale.is_finite() {
            return Err(ModbusError::configuration(format!(
                "{}: scale must be finite and non-zero",
                self.name
            )));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(ModbusError::configuration(format!(
                    "{}: min {} greater than max {}",
                    self.name, min, max
                )));
            }
        }
        Ok(())
    }

    /// Convert raw words (starting at the entry's address) to an engineering value.
    pub fn decode(&self, words: &[u16]) -> ModbusResult<f64> {
        let raw = self.data_type.decode(words)?;
        let value = raw as f64 * self.scale + self.offset as f64;
        Ok(round_to(value, self.precision))
    }

    /// Convert an engineering value to the single raw word written with FC06.
    pub fn encode(&self, value: f64) -> ModbusResult<u16> {
        if !self.access.is_writable() {
            return Err(ModbusError::invalid_data(format!(
                "{} at {} is read-only",
                self.name, self.address
            )));
        }
        if self.data_type.words() != 1 {
            return Err(ModbusError::invalid_data(format!(
                "{} is {}; only single-word registers can be written",
                self.name, self.data_type
            )));
        }
        if !value.is_finite() {
            return Err(ModbusError::invalid_data(format!(
                "{}: value must be finite",
                self.name
            )));
        }
        if let Some(min) = self.min {
            if value < min {
                return Err(ModbusError::invalid_data(format!(
                    "{}: {} below minimum {}",
                    self.name, value, min
                )));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(ModbusError::invalid_data(format!(
                    "{}: {} above maximum {}",
                    self.name, value, max
                )));
            }
        }

        let raw = ((value - self.offset as f64) / self.scale).round() as i64;
        let (low, high) = self.data_type.raw_range();
        if raw < low || raw > high {
            return Err(ModbusError::invalid_data(format!(
                "{}: raw value {} does not fit {}",
                self.name, raw, self.data_type
            )));
        }
        Ok(raw as u16)
    }
}

/// Round half away from zero to `precision` decimals.
pub fn round_to(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Validated collection of register entries.
#[derive(Debug, Clone, Default)]
pub struct RegisterCatalog {
    entries: Vec<RegisterSpec>,
    by_name: HashMap<String, usize>,
}

impl RegisterCatalog {
    /// Build a catalog, rejecting invalid entries, duplicate names and
    /// entries whose words overlap.
    pub fn new(entries: Vec<RegisterSpec>) -> ModbusResult<Self> {
        let mut by_name = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            entry.validate()?;
            if by_name.insert(entry.name.clone(), index).is_some() {
                return Err(ModbusError::configuration(format!(
                    "duplicate register name: {}",
                    entry.name
                )));
            }
        }

        let mut by_address: Vec<&RegisterSpec> = entries.iter().collect();
        by_address.sort_by_key(|e| e.address);
        for pair in by_address.windows(2) {
            let (first, second) = (pair[0], pair[1]);
            if second.address.value() <= first.end() {
                return Err(ModbusError::invalid_data(format!(
                    "{} at {} overlaps {} ({}..=0x{:04X})",
                    second.name,
                    second.address,
                    first.name,
                    first.address,
                    first.end()
                )));
            }
        }

        Ok(Self { entries, by_name })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RegisterSpec] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&RegisterSpec> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Entry starting exactly at `address`.
    pub fn at_address(&self, address: u16) -> Option<&RegisterSpec> {
        self.entries.iter().find(|e| e.address.value() == address)
    }

    /// Names grouped by start address, for diagnostics.
    pub fn address_map(&self) -> BTreeMap<u16, Vec<&str>> {
        let mut map: BTreeMap<u16, Vec<&str>> = BTreeMap::new();
        for entry in &self.entries {
            map.entry(entry.address.value())
                .or_default()
                .push(entry.name.as_str());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_types() {
        assert_eq!(DataType::U16.decode(&[65500]).unwrap(), 65500);
        assert_eq!(DataType::I16.decode(&[65500]).unwrap(), -36);
        assert_eq!(DataType::U32.decode(&[0x0001, 0x0002]).unwrap(), 0x0001_0002);
        assert_eq!(DataType::I32.decode(&[0xFFFF, 0xFFFE]).unwrap(), -2);
        assert!(DataType::U32.decode(&[1]).is_err());
    }

    #[test]
    fn test_value_processing() {
        let voltage = RegisterSpec::new("battery_voltage", 0x0100u16).with_scale(0.1);
        assert_eq!(voltage.decode(&[2400]).unwrap(), 240.0);

        let current = RegisterSpec::new("battery_current", 0x0101u16)
            .with_type(DataType::I16)
            .with_scale(0.1);
        assert_eq!(current.decode(&[65500]).unwrap(), -3.6);

        // Scale first, then offset.
        let temperature = RegisterSpec::new("temperature", 0x0103u16)
            .with_scale(0.1)
            .with_offset(-40);
        assert_eq!(temperature.decode(&[250]).unwrap(), -15.0);
    }

    #[test]
    fn test_encode_with_offset() {
        let setpoint = RegisterSpec::new("temperature_limit", 0xE010u16)
            .with_access(Access::ReadWrite)
            .with_scale(0.1)
            .with_offset(-40);
        let raw = setpoint.encode(-15.0).unwrap();
        assert_eq!(raw, 250);
        assert_eq!(setpoint.decode(&[raw]).unwrap(), -15.0);
    }

    #[test]
    fn test_encode_inverse() {
        let spec = RegisterSpec::new("charge_limit", 0xE00Au16)
            .with_access(Access::ReadWrite)
            .with_scale(0.1)
            .with_bounds(0.0, 100.0);
        assert_eq!(spec.encode(55.5).unwrap(), 555);
        assert!(spec.encode(100.1).is_err());
        assert!(spec.encode(-1.0).is_err());

        let signed = RegisterSpec::new("offset_current", 0xE010u16)
            .with_access(Access::ReadWrite)
            .with_type(DataType::I16);
        assert_eq!(signed.encode(-1.0).unwrap(), 0xFFFF);

        let unsigned = RegisterSpec::new("count", 0xE011u16).with_access(Access::ReadWrite);
        assert!(unsigned.encode(-1.0).is_err());
        assert!(unsigned.encode(70000.0).is_err());
    }

    #[test]
    fn test_catalog_rejects_overlapping_entries() {
        let overlapping = RegisterCatalog::new(vec![
            RegisterSpec::new("energy", 0x0100u16).with_type(DataType::U32),
            RegisterSpec::new("energy_low", 0x0101u16),
        ]);
        assert!(matches!(overlapping, Err(ModbusError::InvalidData { .. })));

        let same_start = RegisterCatalog::new(vec![
            RegisterSpec::new("a", 0x0200u16),
            RegisterSpec::new("b", 0x0200u16),
        ]);
        assert!(same_start.is_err());

        let adjacent = RegisterCatalog::new(vec![
            RegisterSpec::new("serial", 0x0102u16).with_width(4),
            RegisterSpec::new("energy", 0x0100u16).with_type(DataType::U32),
            RegisterSpec::new("next", 0x0106u16),
        ])
        .unwrap();
        assert_eq!(adjacent.len(), 3);
    }

    #[test]
    fn test_encode_rejects_read_only() {
        let spec = RegisterSpec::new("battery_voltage", 0x0100u16);
        assert!(matches!(
            spec.encode(1.0),
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_spec_validation() {
        assert!(RegisterSpec::new("x", 0u16).with_width(3).validate().is_err());
        assert!(RegisterSpec::new("x", 0xFFFFu16).with_width(2).validate().is_err());
        assert!(RegisterSpec::new("x", 0u16).with_scale(0.0).validate().is_err());
        assert!(RegisterSpec::new("x", 0u16)
            .with_type(DataType::U32)
            .with_width(1)
            .validate()
            .is_err());
        assert!(RegisterSpec::new("x", 0u16).with_width(4).validate().is_ok());
    }

    #[test]
    fn test_with_type_grows_width() {
        let spec = RegisterSpec::new("energy", 0x0200u16).with_type(DataType::U32);
        assert_eq!(spec.width, 2);
        assert_eq!(spec.end(), 0x0201);
        assert_eq!(spec.addresses().collect::<Vec<_>>(), vec![0x0200, 0x0201]);
    }

    #[test]
    fn test_catalog() {
        let catalog = RegisterCatalog::new(vec![
            RegisterSpec::new("a", 0x0100u16),
            RegisterSpec::new("b", 0x0101u16),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("b").unwrap().address.value(), 0x0101);
        assert_eq!(catalog.at_address(0x0100).unwrap().name, "a");
        assert!(catalog.get("c").is_none());

        let dup = RegisterCatalog::new(vec![
            RegisterSpec::new("a", 0x0100u16),
            RegisterSpec::new("a", 0x0102u16),
        ]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("INT16".parse::<DataType>().unwrap(), DataType::I16);
        assert_eq!("dword".parse::<DataType>().unwrap(), DataType::U32);
        assert!("float32".parse::<DataType>().is_err());
    }
}
