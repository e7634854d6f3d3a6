//! # Read Batching
//!
//! Turns the flat register catalog into the fewest contiguous FC03 spans the
//! device accepts.
//!
//! ## How It Works
//!
//! 1. Keep readable entries; drop entries touching the failed set, an
//!    externally excluded address, or a disabled feature range.
//! 2. Sort by address.
//! 3. Walk once. The current span grows while the gap to the next entry is at
//!    most `max_gap` and the span stays within the width ceiling. Multi-word
//!    entries claim all their words; entries starting inside a claimed word
//!    are skipped.
//! 4. Order spans by priority (highest first), then by address.
//!
//! Gap registers are read and discarded: over BLE one extra round trip costs
//! far more than a few unused words.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use voltage_ble_modbus::{BatchBuilder, DeviceLimits, FeatureMap, RegisterCatalog, RegisterSpec};
//!
//! let catalog = RegisterCatalog::new(vec![
//!     RegisterSpec::new("battery_voltage", 0x0100u16),
//!     RegisterSpec::new("battery_current", 0x0101u16),
//!     RegisterSpec::new("pv_power", 0x0109u16),
//! ])
//! .unwrap();
//!
//! let mut builder = BatchBuilder::new(&DeviceLimits::new());
//! let batches = builder.build(&catalog, &BTreeSet::new(), &FeatureMap::new(), &BTreeSet::new());
//!
//! assert_eq!(batches.len(), 2);
//! assert_eq!(batches[0].count(), 2);
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::RangeInclusive;

use tracing::{debug, warn};

use crate::address::RegisterAddress;
use crate::constants::MAX_READ_REGISTERS;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::register::{RegisterCatalog, RegisterSpec};

// ============================================================================
// RegisterBatch
// ============================================================================

/// A contiguous span read with one FC03 request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBatch {
    start: RegisterAddress,
    count: u16,
    members: Vec<RegisterSpec>,
    priority: u8,
    max_retries: u8,
}

impl RegisterBatch {
    /// Build a span, checking `0 < count <= ceiling <= 125` and that every
    /// member lies entirely inside the span.
    pub fn new(
        start: RegisterAddress,
        count: u16,
        members: Vec<RegisterSpec>,
        ceiling: u16,
    ) -> ModbusResult<Self> {
        let ceiling = ceiling.min(MAX_READ_REGISTERS);
        if count == 0 || count > ceiling {
            return Err(ModbusError::invalid_data(format!(
                "batch width {} outside 1..={}",
                count, ceiling
            )));
        }
        let end = start.span_end(count)?.value();
        if let Some(outside) = members
            .iter()
            .find(|m| m.address < start || m.end() > end)
        {
            return Err(ModbusError::invalid_data(format!(
                "{} ({}..=0x{:04X}) outside batch {}..=0x{:04X}",
                outside.name,
                outside.address,
                outside.end(),
                start,
                end
            )));
        }
        let priority = members.iter().map(|m| m.priority).max().unwrap_or(0);
        Ok(Self {
            start,
            count,
            members,
            priority,
            max_retries: 0,
        })
    }

    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    #[inline]
    pub fn start(&self) -> RegisterAddress {
        self.start
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Last address of the span.
    #[inline]
    pub fn end(&self) -> u16 {
        self.start.value() + (self.count - 1)
    }

    #[inline]
    pub fn members(&self) -> &[RegisterSpec] {
        &self.members
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    #[inline]
    pub fn contains(&self, address: u16) -> bool {
        (self.start.value()..=self.end()).contains(&address)
    }

    /// Words occupied by catalog entries (the rest are gap).
    pub fn used_registers(&self) -> u16 {
        self.members.iter().map(|m| m.width).sum()
    }

    /// Decode the span's words into named values.
    ///
    /// Members whose words are missing from a short answer are returned
    /// separately instead of failing the whole span.
    pub fn distribute(&self, words: &[u16]) -> (BTreeMap<String, f64>, Vec<String>) {
        distribute_words(self.start.value(), &self.members, words)
    }
}

/// Decode `words`, read from `start`, into the values of `members`.
///
/// Every member must start at or after `start`.
pub(crate) fn distribute_words<'a>(
    start: u16,
    members: impl IntoIterator<Item = &'a RegisterSpec>,
    words: &[u16],
) -> (BTreeMap<String, f64>, Vec<String>) {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();
    for member in members {
        let offset = (member.address.value() - start) as usize;
        let end = offset + member.width as usize;
        match words.get(offset..end).map(|w| member.decode(w)) {
            Some(Ok(value)) => {
                values.insert(member.name.clone(), value);
            }
            Some(Err(err)) => {
                warn!("Failed to decode {}: {}", member.name, err);
                missing.push(member.name.clone());
            }
            None => missing.push(member.name.clone()),
        }
    }
    (values, missing)
}

// ============================================================================
// FeatureMap
// ============================================================================

/// Firmware features and the address ranges they own.
///
/// A disabled feature removes its ranges from every batch build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureMap {
    ranges: BTreeMap<String, Vec<RangeInclusive<u16>>>,
    disabled: BTreeSet<String>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature and its ranges; features start enabled.
    pub fn with_feature(
        mut self,
        name: impl Into<String>,
        ranges: impl IntoIterator<Item = RangeInclusive<u16>>,
    ) -> Self {
        self.ranges
            .entry(name.into())
            .or_default()
            .extend(ranges);
        self
    }

    /// Enable or disable a feature; returns whether anything changed.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        if enabled {
            self.disabled.remove(name)
        } else {
            self.disabled.insert(name.to_string())
        }
    }

    #[inline]
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }

    #[inline]
    pub fn disabled_features(&self) -> &BTreeSet<String> {
        &self.disabled
    }

    /// Every address owned by a disabled feature.
    pub fn disabled_addresses(&self) -> HashSet<u16> {
        self.disabled
            .iter()
            .filter_map(|name| self.ranges.get(name))
            .flatten()
            .flat_map(|range| range.clone())
            .collect()
    }
}

// ============================================================================
// BatchBuilder
// ============================================================================

/// Builds read spans; owns the disabled-address cache.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    ceiling: u16,
    max_gap: u16,
    max_retries: u8,
    /// Disabled addresses keyed by the disabled feature names they came from.
    disabled_cache: Option<(BTreeSet<String>, HashSet<u16>)>,
    cache_rebuilds: u64,
}

impl BatchBuilder {
    pub fn new(limits: &DeviceLimits) -> Self {
        Self {
            ceiling: limits.batch_ceiling(),
            max_gap: limits.max_gap,
            max_retries: limits.max_retries,
            disabled_cache: None,
            cache_rebuilds: 0,
        }
    }

    #[inline]
    pub fn ceiling(&self) -> u16 {
        self.ceiling
    }

    #[inline]
    pub fn max_gap(&self) -> u16 {
        self.max_gap
    }

    /// How often the disabled-address cache was recomputed.
    #[inline]
    pub fn cache_rebuilds(&self) -> u64 {
        self.cache_rebuilds
    }

    fn disabled_addresses(&mut self, features: &FeatureMap) -> &HashSet<u16> {
        let key = features.disabled_features();
        if !matches!(&self.disabled_cache, Some((cached, _)) if cached == key) {
            let addresses = features.disabled_addresses();
            debug!(
                "Disabled-address cache rebuilt: {} features, {} addresses",
                key.len(),
                addresses.len()
            );
            self.cache_rebuilds += 1;
            self.disabled_cache = Some((key.clone(), addresses));
        }
        &self
            .disabled_cache
            .get_or_insert_with(|| (key.clone(), features.disabled_addresses()))
            .1
    }

    /// Build spans for every readable, non-excluded catalog entry.
    pub fn build(
        &mut self,
        catalog: &RegisterCatalog,
        failed: &BTreeSet<u16>,
        features: &FeatureMap,
        excluded: &BTreeSet<u16>,
    ) -> Vec<RegisterBatch> {
        let ceiling = self.ceiling;
        let max_gap = self.max_gap;
        let max_retries = self.max_retries;
        let disabled = self.disabled_addresses(features);

        let mut entries: Vec<&RegisterSpec> = catalog
            .entries()
            .iter()
            .filter(|e| e.access.is_readable())
            .filter(|e| {
                e.addresses().all(|a| {
                    !failed.contains(&a) && !excluded.contains(&a) && !disabled.contains(&a)
                })
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));

        let mut batches = Vec::new();
        let mut span: Option<(u16, u16, Vec<RegisterSpec>)> = None;

        for entry in entries {
            if entry.width > ceiling {
                warn!(
                    "{} is {} words wide, above the batch ceiling {}; not polled",
                    entry.name, entry.width, ceiling
                );
                continue;
            }
            let address = entry.address.value();

            if let Some((start, end, members)) = span.as_mut() {
                if address <= *end {
                    debug!("{} at {} already covered, skipped", entry.name, entry.address);
                    continue;
                }
                let gap = address - *end - 1;
                let width = entry.end() - *start + 1;
                if gap <= max_gap && width <= ceiling {
                    *end = entry.end();
                    members.push(entry.clone());
                    continue;
                }
            }

            if let Some(closed) = span.take() {
                batches.extend(Self::close(closed, ceiling, max_retries));
            }
            span = Some((address, entry.end(), vec![entry.clone()]));
        }
        if let Some(closed) = span.take() {
            batches.extend(Self::close(closed, ceiling, max_retries));
        }

        batches.sort_by_key(|b| (Reverse(b.priority()), b.start()));
        debug!(
            "Built {} batches covering {} registers",
            batches.len(),
            batches.iter().map(|b| b.count() as usize).sum::<usize>()
        );
        batches
    }

    fn close(
        (start, end, members): (u16, u16, Vec<RegisterSpec>),
        ceiling: u16,
        max_retries: u8,
    ) -> Option<RegisterBatch> {
        match RegisterBatch::new(RegisterAddress::from(start), end - start + 1, members, ceiling) {
            Ok(batch) => Some(batch.with_max_retries(max_retries)),
            Err(err) => {
                warn!("Dropping span 0x{:04X}..=0x{:04X}: {}", start, end, err);
                None
            }
        }
    }

    /// Recombine exactly adjacent spans whose combined width fits the ceiling.
    ///
    /// Useful when spans were built independently (for example per feature
    /// group); the output is ordered like [`BatchBuilder::build`] output.
    pub fn merge_adjacent(&self, mut batches: Vec<RegisterBatch>) -> Vec<RegisterBatch> {
        batches.sort_by_key(|b| b.start());
        let mut merged: Vec<RegisterBatch> = Vec::with_capacity(batches.len());

        for batch in batches {
            if let Some(last) = merged.last_mut() {
                let contiguous = last.end().checked_add(1) == Some(batch.start().value());
                let width = last.count() as u32 + batch.count() as u32;
                if contiguous && width <= self.ceiling as u32 {
                    last.count = width as u16;
                    last.priority = last.priority.max(batch.priority);
                    last.max_retries = last.max_retries.max(batch.max_retries);
                    last.members.extend(batch.members);
                    continue;
                }
            }
            merged.push(batch);
        }

        merged.sort_by_key(|b| (Reverse(b.priority()), b.start()));
        merged
    }
}

// ============================================================================
// Tests
// ============================================================================
