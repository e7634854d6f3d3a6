//! CRC-16/MODBUS checksum (seed 0xFFFF, reflected polynomial 0xA001).
//!
//! The command space of a polling cycle is small and repeats every cycle, so
//! [`CrcEngine`] keeps a bounded memo of recent inputs. The memo belongs to the
//! engine instance; there is no process-wide cache.

use std::collections::{HashMap, VecDeque};

use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Default number of memoized inputs.
pub const DEFAULT_CRC_CACHE_CAPACITY: usize = 128;

/// Compute the CRC of `data` without memoization.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// CRC calculator with a bounded memo keyed by the input bytes.
#[derive(Debug, Clone)]
pub struct CrcEngine {
    cache: HashMap<Vec<u8>, u16>,
    order: VecDeque<Vec<u8>>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl CrcEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CRC_CACHE_CAPACITY)
    }

    /// Create an engine memoizing at most `capacity` inputs. Zero disables the memo.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Checksum of `data`, served from the memo when possible.
    pub fn calculate(&mut self, data: &[u8]) -> u16 {
        if let Some(&crc) = self.cache.get(data) {
            self.hits += 1;
            return crc;
        }

        self.misses += 1;
        let crc = crc16(data);
        if self.capacity == 0 {
            return crc;
        }

        if self.cache.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert(data.to_vec(), crc);
        self.order.push_back(data.to_vec());
        crc
    }

    /// Checksum as the two trailer bytes (low byte first).
    #[inline]
    pub fn trailer(&mut self, data: &[u8]) -> [u8; 2] {
        self.calculate(data).to_le_bytes()
    }

    /// Number of memoized entries.
    #[inline]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// (hits, misses) since creation.
    #[inline]
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.order.clear();
    }
}

impl Default for CrcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x01, 0x00, 0x00, 0x01]), 0xF685);

        let mut engine = CrcEngine::new();
        assert_eq!(
            engine.trailer(&[0x01, 0x03, 0x01, 0x00, 0x00, 0x04]),
            [0x45, 0xF5]
        );
    }

    #[test]
    fn test_memo_hits() {
        let mut engine = CrcEngine::new();
        let frame = [0x01, 0x03, 0x01, 0x00, 0x00, 0x01];

        let first = engine.calculate(&frame);
        let second = engine.calculate(&frame);
        assert_eq!(first, second);
        assert_eq!(engine.hit_stats(), (1, 1));
        assert_eq!(engine.cached(), 1);
    }

    #[test]
    fn test_memo_is_bounded() {
        let mut engine = CrcEngine::with_capacity(4);
        for i in 0..10u8 {
            let value = engine.calculate(&[0x01, 0x03, 0x00, i]);
            assert_eq!(value, crc16(&[0x01, 0x03, 0x00, i]));
        }
        assert_eq!(engine.cached(), 4);

        // Oldest inputs were evicted, the newest are still served from the memo.
        engine.calculate(&[0x01, 0x03, 0x00, 9]);
        assert_eq!(engine.hit_stats().0, 1);
    }

    #[test]
    fn test_disabled_memo() {
        let mut engine = CrcEngine::with_capacity(0);
        engine.calculate(&[1, 2, 3]);
        engine.calculate(&[1, 2, 3]);
        assert_eq!(engine.cached(), 0);
        assert_eq!(engine.hit_stats(), (0, 2));
    }
}
