//! # Engine Configuration
//!
//! Plain builder structs with working defaults for the inverter's BLE bridge.
//! Loading them from files is left to the host.
//!
//! | Struct | Covers |
//! |--------|--------|
//! | [`LinkFraming`] | link-layer prefix, vendor sentinel |
//! | [`ExchangeTimings`] | response/write timeouts, settle delay, stuck-link breaker |
//! | [`BackoffPolicy`] | reconnect backoff and lockout |
//! | [`TimingConfig`] | latency sampling and timeout learning |
//! | [`EngineConfig`] | everything above plus device identity |

use std::time::Duration;

use crate::constants::*;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};

// ============================================================================
// Link framing
// ============================================================================

/// Vendor framing around Modbus RTU frames on the BLE bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFraming {
    /// Prefix stripped from notifications when present.
    pub header: Vec<u8>,
    /// Byte the bridge repeats to refuse a span.
    pub sentinel_byte: u8,
    /// Minimum leading run of `sentinel_byte` recognised as the sentinel.
    pub min_sentinel_len: usize,
    /// Treat a sentinel in the status read-back as a refusal as well.
    pub status_sentinel_rejects: bool,
}

impl LinkFraming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framing without any link-layer prefix.
    pub fn bare() -> Self {
        Self {
            header: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, header: impl Into<Vec<u8>>) -> Self {
        self.header = header.into();
        self
    }

    pub fn with_sentinel(mut self, byte: u8, min_len: usize) -> Self {
        self.sentinel_byte = byte;
        self.min_sentinel_len = min_len;
        self
    }

    pub fn with_status_sentinel_rejects(mut self, enabled: bool) -> Self {
        self.status_sentinel_rejects = enabled;
        self
    }

    /// True when `data` starts with the sentinel run.
    pub fn is_sentinel(&self, data: &[u8]) -> bool {
        self.min_sentinel_len > 0
            && data.len() >= self.min_sentinel_len
            && data[..self.min_sentinel_len]
                .iter()
                .all(|&b| b == self.sentinel_byte)
    }

    /// `data` without the link-layer prefix, if the prefix is there.
    pub fn strip_header<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        if !self.header.is_empty() && data.starts_with(&self.header) {
            &data[self.header.len()..]
        } else {
            data
        }
    }
}

impl Default for LinkFraming {
    fn default() -> Self {
        Self {
            header: vec![LINK_HEADER_BYTE; LINK_HEADER_LEN],
            sentinel_byte: SENTINEL_BYTE,
            min_sentinel_len: MIN_SENTINEL_LEN,
            status_sentinel_rejects: false,
        }
    }
}

// ============================================================================
// Exchange timings
// ============================================================================

/// Default wait for the response notification of a read.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Default wait for the echo of a write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default pause between write acknowledgement and status read-back.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Default consecutive timeouts that declare the link stuck.
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Timing of one physical exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTimings {
    pub response_timeout: Duration,
    pub write_timeout: Duration,
    pub settle_delay: Duration,
    pub max_consecutive_timeouts: u32,
}

impl ExchangeTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_max_consecutive_timeouts(mut self, count: u32) -> Self {
        self.max_consecutive_timeouts = count;
        self
    }
}

impl Default for ExchangeTimings {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
        }
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Reconnect backoff: doubling from `initial` up to `max`, with a lockout
/// after `max_consecutive_failures` that lifts once `max` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_consecutive_failures: u32,
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Next delay after `current`: doubled, capped at `max`.
    #[inline]
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            max_consecutive_failures: 5,
        }
    }
}

// ============================================================================
// Timing collection / learning
// ============================================================================

/// Latency sampling and timeout learning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    pub enabled: bool,
    /// Nominal samples per operation; the window keeps twice as many.
    pub sample_size: usize,
    /// Samples needed before a recommendation is made (at least 2).
    pub min_samples: usize,
    /// Multiplier applied to P95.
    pub safety_factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl TimingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size;
        self
    }

    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }

    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: 100,
            min_samples: 20,
            safety_factor: 1.5,
            min_timeout: Duration::from_millis(300),
            max_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Full engine configuration.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use voltage_ble_modbus::{DeviceLimits, EngineConfig};
///
/// let config = EngineConfig::new("AA:BB:CC:DD:EE:FF")
///     .with_password(4321)
///     .with_limits(DeviceLimits::new().with_max_gap(2));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.timings.response_timeout, Duration::from_millis(1500));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Link address handed to the radio driver.
    pub device_address: String,
    pub slave_id: u8,
    /// Password written to the password register before protected writes.
    pub password: Option<u16>,
    /// Use learned timeouts instead of the static ones once available.
    pub adaptive_timeouts: bool,
    pub limits: DeviceLimits,
    pub framing: LinkFraming,
    pub timings: ExchangeTimings,
    pub backoff: BackoffPolicy,
    pub timing: TimingConfig,
}

impl EngineConfig {
    pub fn new(device_address: impl Into<String>) -> Self {
        Self {
            device_address: device_address.into(),
            slave_id: DEFAULT_SLAVE_ID,
            password: None,
            adaptive_timeouts: true,
            limits: DeviceLimits::default(),
            framing: LinkFraming::default(),
            timings: ExchangeTimings::default(),
            backoff: BackoffPolicy::default(),
            timing: TimingConfig::default(),
        }
    }

    pub fn with_slave_id(mut self, slave_id: u8) -> Self {
        self.slave_id = slave_id;
        self
    }

    pub fn with_password(mut self, password: u16) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_adaptive_timeouts(mut self, enabled: bool) -> Self {
        self.adaptive_timeouts = enabled;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_framing(mut self, framing: LinkFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_timings(mut self, timings: ExchangeTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        self.limits.validate()?;
        if self.device_address.is_empty() {
            return Err(ModbusError::configuration("device address must not be empty"));
        }
        if self.timings.max_consecutive_timeouts == 0 {
            return Err(ModbusError::configuration(
                "max_consecutive_timeouts must be at least 1",
            ));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ModbusError::configuration(
                "initial backoff exceeds the backoff cap",
            ));
        }
        if self.timing.min_samples < 2 {
            return Err(ModbusError::configuration(format!(
                "min_samples must be at least 2, got {}",
                self.timing.min_samples
            )));
        }
        if self.timing.min_timeout > self.timing.max_timeout {
            return Err(ModbusError::configuration(
                "learned timeout lower bound exceeds upper bound",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_defaults() {
        let framing = LinkFraming::default();
        assert_eq!(framing.header, vec![0u8; 8]);
        assert!(framing.is_sentinel(&[0x2D, 0x2D, 0x2D, 0x2D]));
        assert!(framing.is_sentinel(&[0x2D; 12]));
        assert!(!framing.is_sentinel(&[0x2D, 0x2D, 0x2D]));
        assert!(!framing.is_sentinel(&[0x01, 0x2D, 0x2D, 0x2D, 0x2D]));
    }

    #[test]
    fn test_strip_header() {
        let framing = LinkFraming::default();
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&[0x01, 0x03]);
        assert_eq!(framing.strip_header(&data), &[0x01, 0x03]);
        assert_eq!(framing.strip_header(&[0x01, 0x03]), &[0x01, 0x03]);

        let bare = LinkFraming::bare();
        assert_eq!(bare.strip_header(&data), data.as_slice());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next(Duration::from_secs(200)), Duration::from_secs(300));
        assert_eq!(policy.next(Duration::from_secs(300)), Duration::from_secs(300));
    }

    #[test]
    fn test_engine_config_validation() {
        assert!(EngineConfig::new("dev").validate().is_ok());
        assert!(EngineConfig::new("").validate().is_err());

        let config = EngineConfig::new("dev")
            .with_timings(ExchangeTimings::new().with_max_consecutive_timeouts(0));
        assert!(config.validate().is_err());

        let config = EngineConfig::new("dev").with_backoff(
            BackoffPolicy::new()
                .with_initial(Duration::from_secs(10))
                .with_max(Duration::from_secs(5)),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_samples_needs_a_spread() {
        for samples in [0, 1] {
            let config =
                EngineConfig::new("dev").with_timing(TimingConfig::new().with_min_samples(samples));
            assert!(matches!(
                config.validate(),
                Err(ModbusError::Configuration { .. })
            ));
        }

        let config = EngineConfig::new("dev").with_timing(TimingConfig::new().with_min_samples(2));
        assert!(config.validate().is_ok());
    }
}
