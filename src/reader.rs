//! # Batch Read Orchestrator
//!
//! Reads every batch of a refresh cycle and turns the words into named
//! values.
//!
//! ## Failure Handling
//!
//! A span that fails with a garbled answer (CRC, short frame) or a busy
//! exception is retried whole up to the batch's retry budget. After that the span is bisected and
//! each half read on its own, down to a single catalog entry or the split
//! depth limit. A single entry refused with the sentinel or exception 0x02
//! is reported as permanently unsupported; any other failure only skips it
//! for this cycle.
//!
//! A link error anywhere stops the refresh at once and returns what was
//! read so far: splitting cannot diagnose a dead link.
//!
//! ```text
//! 0x0100..0x011F rejected
//!   0x0100..0x010F ok
//!   0x0110..0x011F rejected
//!     0x0110..0x0117 ok
//!     0x0118..0x011F rejected
//!       ...
//!         0x011B rejected -> unsupported
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::address::RegisterAddress;
use crate::batch::{distribute_words, RegisterBatch};
use crate::constants::EXCEPTION_ILLEGAL_DATA_ADDRESS;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::exception::ExceptionCode;
use crate::link::RadioLink;
use crate::register::RegisterSpec;
use crate::session::Session;

/// Result of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshOutcome {
    /// Decoded values by register name.
    pub values: BTreeMap<String, f64>,
    /// False when the cycle was aborted by a link error.
    pub success: bool,
    pub error: Option<ModbusError>,
    pub duration: Duration,
    /// Read requests that did not produce values.
    pub failed_reads: usize,
    /// Addresses found unsupported during this cycle.
    pub newly_unsupported: Vec<u16>,
    /// Entries that got no value this cycle.
    pub skipped: Vec<String>,
    pub batches_read: usize,
}

impl RefreshOutcome {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// Counters for the life of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub refreshes: u64,
    pub aborted: u64,
    pub requests: u64,
    pub retries: u64,
    pub splits: u64,
    pub unsupported_found: u64,
}

struct Span<'a> {
    members: Vec<&'a RegisterSpec>,
    depth: u8,
    retries: u8,
}

impl Span<'_> {
    fn start(&self) -> u16 {
        self.members.iter().map(|m| m.address.value()).min().unwrap_or(0)
    }

    fn end(&self) -> u16 {
        self.members.iter().map(|m| m.end()).max().unwrap_or(0)
    }

    fn count(&self) -> u16 {
        self.end() - self.start() + 1
    }

    /// Halve at the address midpoint without cutting an entry; fall back to
    /// halving the member list when every entry starts before the midpoint.
    fn bisect(self) -> (Self, Self) {
        let start = self.start();
        let mid = start + self.count() / 2;
        let (mut left, mut right): (Vec<_>, Vec<_>) = self
            .members
            .iter()
            .copied()
            .partition(|m| m.address.value() < mid);
        if right.is_empty() {
            right = left.split_off(left.len() / 2);
        }
        let depth = self.depth + 1;
        (
            Span {
                members: left,
                depth,
                retries: self.retries,
            },
            Span {
                members: right,
                depth,
                retries: self.retries,
            },
        )
    }
}

/// Errors worth re-reading the same span for: garbled answers and busy codes.
fn worth_retrying(err: &ModbusError) -> bool {
    match err {
        ModbusError::Crc { .. } | ModbusError::Frame { .. } | ModbusError::InvalidData { .. } => {
            true
        }
        ModbusError::Exception { code, .. } => ExceptionCode::from_code(*code).is_retryable(),
        _ => false,
    }
}

fn is_refusal(err: &ModbusError) -> bool {
    matches!(err, ModbusError::Unsupported { .. })
        || err.exception_code() == Some(EXCEPTION_ILLEGAL_DATA_ADDRESS)
}

#[derive(Default)]
struct Cycle {
    values: BTreeMap<String, f64>,
    failed_reads: usize,
    unsupported: BTreeSet<u16>,
    skipped: Vec<String>,
}

/// Drives the reads of one refresh cycle.
#[derive(Debug, Clone)]
pub struct ReadOrchestrator {
    max_split_depth: u8,
    inter_request_delay: Duration,
    stats: ReadStats,
}

impl ReadOrchestrator {
    pub fn new(limits: &DeviceLimits) -> Self {
        Self {
            max_split_depth: limits.max_split_depth,
            inter_request_delay: Duration::from_millis(limits.inter_request_delay_ms),
            stats: ReadStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    #[inline]
    pub fn max_split_depth(&self) -> u8 {
        self.max_split_depth
    }

    /// Read every batch in order.
    ///
    /// The caller makes sure the link is up first; a link that drops during
    /// the cycle ends it with the values read so far.
    pub async fn refresh<L: RadioLink>(
        &mut self,
        session: &mut Session<L>,
        batches: &[RegisterBatch],
    ) -> RefreshOutcome {
        let started = Instant::now();
        self.stats.refreshes += 1;
        let mut cycle = Cycle::default();
        let mut batches_read = 0;
        let mut error = None;

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 && !self.inter_request_delay.is_zero() {
                sleep(self.inter_request_delay).await;
            }
            if !session.is_connected() {
                warn!(
                    "Link down before batch {} ({} of {}), aborting refresh",
                    batch.start(),
                    index + 1,
                    batches.len()
                );
                error = Some(ModbusError::NotConnected);
                break;
            }
            match self.read_batch(session, batch, &mut cycle).await {
                Ok(()) => batches_read += 1,
                Err(err) => {
                    warn!("Refresh aborted at batch {}: {}", batch.start(), err);
                    error = Some(err);
                    break;
                }
            }
        }

        if error.is_some() {
            self.stats.aborted += 1;
        }
        let newly_unsupported = cycle.unsupported.into_iter().collect::<Vec<_>>();
        if !newly_unsupported.is_empty() {
            info!(
                "Registers not supported by the device: {}",
                newly_unsupported
                    .iter()
                    .map(|a| format!("0x{:04X}", a))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let outcome = RefreshOutcome {
            values: cycle.values,
            success: error.is_none(),
            error,
            duration: started.elapsed(),
            failed_reads: cycle.failed_reads,
            newly_unsupported,
            skipped: cycle.skipped,
            batches_read,
        };
        debug!(
            "Refresh: {} values from {}/{} batches in {:?} ({} failed reads)",
            outcome.values.len(),
            outcome.batches_read,
            batches.len(),
            outcome.duration,
            outcome.failed_reads
        );
        outcome
    }

    /// Read one batch, splitting on failure. Only link errors are returned.
    async fn read_batch<L: RadioLink>(
        &mut self,
        session: &mut Session<L>,
        batch: &RegisterBatch,
        cycle: &mut Cycle,
    ) -> ModbusResult<()> {
        // The whole span first; gap words included.
        self.stats.requests += 1;
        let mut retries = batch.max_retries();
        let first = loop {
            match session.read_span(batch.start(), batch.count()).await {
                Ok(words) => {
                    let (values, missing) = batch.distribute(&words);
                    cycle.values.extend(values);
                    cycle.skipped.extend(missing);
                    return Ok(());
                }
                Err(err) if err.is_link_error() => return Err(err),
                Err(err) if worth_retrying(&err) && retries > 0 => {
                    debug!("Batch {} failed ({}), retrying whole", batch.start(), err);
                    retries -= 1;
                    self.stats.retries += 1;
                    self.stats.requests += 1;
                    cycle.failed_reads += 1;
                }
                Err(err) => break err,
            }
        };
        cycle.failed_reads += 1;

        let root = Span {
            members: batch.members().iter().collect(),
            depth: 0,
            retries: batch.max_retries(),
        };
        if root.members.len() == 1 {
            self.give_up(&root, &first, cycle);
            return Ok(());
        }
        if self.max_split_depth == 0 {
            debug!("Batch {} failed ({}), splitting disabled", batch.start(), first);
            self.give_up(&root, &first, cycle);
            return Ok(());
        }

        debug!("Batch {} failed ({}), splitting", batch.start(), first);
        self.stats.splits += 1;
        let (left, right) = root.bisect();
        let mut stack = vec![right, left];

        while let Some(mut span) = stack.pop() {
            if span.members.is_empty() {
                continue;
            }
            if !session.is_connected() {
                return Err(ModbusError::NotConnected);
            }

            let start = span.start();
            let count = span.count();
            self.stats.requests += 1;
            match session.read_span(RegisterAddress::from(start), count).await {
                Ok(words) => {
                    let (values, missing) =
                        distribute_words(start, span.members.iter().copied(), &words);
                    cycle.values.extend(values);
                    cycle.skipped.extend(missing);
                }
                Err(err) if err.is_link_error() => return Err(err),
                Err(err) => {
                    cycle.failed_reads += 1;
                    if worth_retrying(&err) && span.retries > 0 {
                        span.retries -= 1;
                        self.stats.retries += 1;
                        stack.push(span);
                        continue;
                    }
                    if span.members.len() == 1 || span.depth >= self.max_split_depth {
                        self.give_up(&span, &err, cycle);
                        continue;
                    }
                    debug!(
                        "Span 0x{:04X}+{} failed ({}), splitting at depth {}",
                        start,
                        count,
                        err,
                        span.depth + 1
                    );
                    self.stats.splits += 1;
                    let (left, right) = span.bisect();
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        Ok(())
    }

    /// Record a span that will not be split further.
    fn give_up(&mut self, span: &Span<'_>, err: &ModbusError, cycle: &mut Cycle) {
        if span.members.len() == 1 && is_refusal(err) {
            let member = span.members[0];
            info!(
                "{} at {} not supported by the device ({})",
                member.name, member.address, err
            );
            self.stats.unsupported_found += 1;
            cycle.unsupported.extend(member.addresses());
        } else {
            debug!(
                "Skipping {} entries at 0x{:04X} this cycle: {}",
                span.members.len(),
                span.start(),
                err
            );
        }
        cycle
            .skipped
            .extend(span.members.iter().map(|m| m.name.clone()));
    }
}

impl Default for ReadOrchestrator {
    fn default() -> Self {
        Self::new(&DeviceLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchBuilder, FeatureMap};
    use crate::config::EngineConfig;
    use crate::link::LinkEventSender;
    use crate::register::{DataType, RegisterCatalog};
    use crate::sim::SimulatedDevice;
    use tokio::sync::mpsc;

    async fn session(device: &SimulatedDevice) -> Session<SimulatedDevice> {
        let mut session = Session::new(device.clone(), &EngineConfig::new("sim"));
        let (tx, _rx): (LinkEventSender, _) = mpsc::unbounded_channel();
        session.transport_mut().connect("sim", tx).await.unwrap();
        session
    }

    fn batches(catalog: &RegisterCatalog, limits: &DeviceLimits) -> Vec<RegisterBatch> {
        BatchBuilder::new(limits).build(
            catalog,
            &BTreeSet::new(),
            &FeatureMap::new(),
            &BTreeSet::new(),
        )
    }

    fn consecutive(start: u16, count: u16) -> RegisterCatalog {
        RegisterCatalog::new(
            (0..count)
                .map(|i| RegisterSpec::new(format!("reg_{:04x}", start + i), start + i))
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_decodes_values() {
        let device = SimulatedDevice::new().with_registers(0x0100, &[2400, 65500]);
        let catalog = RegisterCatalog::new(vec![
            RegisterSpec::new("battery_voltage", 0x0100u16).with_scale(0.1),
            RegisterSpec::new("battery_current", 0x0101u16)
                .with_type(DataType::I16)
                .with_scale(0.1),
        ])
        .unwrap();
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.value("battery_voltage"), Some(240.0));
        assert_eq!(outcome.value("battery_current"), Some(-3.6));
        assert_eq!(outcome.batches_read, 1);
        assert_eq!(device.reads(), vec![(0x0100, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_isolates_unsupported_address() {
        let device = SimulatedDevice::new().with_unsupported(0x011B);
        let catalog = consecutive(0x0100, 32);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.newly_unsupported, vec![0x011B]);
        assert_eq!(outcome.values.len(), 31);
        assert_eq!(outcome.skipped, vec!["reg_011b".to_string()]);

        // Spans that succeeded never overlap: each address is delivered once.
        let mut seen = BTreeMap::new();
        for (start, count) in device.reads() {
            let span = start..start + count;
            if span.contains(&0x011B) {
                continue;
            }
            for address in span {
                *seen.entry(address).or_insert(0) += 1;
            }
        }
        assert_eq!(seen.len(), 31);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_depth_is_bounded() {
        let device = SimulatedDevice::new().with_unsupported(0x0100);
        let catalog = consecutive(0x0100, 32);
        let limits = DeviceLimits::default().with_max_split_depth(2);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::new(&limits);

        let outcome = reader.refresh(&mut session, &batches(&catalog, &limits)).await;
        // 32 -> 16 -> 8: the 8-wide span holding 0x0100 is given up on.
        assert!(outcome.newly_unsupported.is_empty());
        assert_eq!(outcome.values.len(), 24);
        assert!(device.reads().iter().all(|&(_, count)| count >= 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_on_single_register_is_permanent() {
        let device = SimulatedDevice::new()
            .with_refusal(crate::sim::RefusalStyle::IllegalAddress)
            .with_unsupported(0x0103);
        let catalog = consecutive(0x0100, 4);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert_eq!(outcome.newly_unsupported, vec![0x0103]);
        assert_eq!(outcome.values.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_register_is_transient() {
        let device = SimulatedDevice::new();
        device.inject_exception(0x0102, 0x04);
        let catalog = consecutive(0x0100, 4);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert!(outcome.success);
        assert!(outcome.newly_unsupported.is_empty());
        assert_eq!(outcome.skipped, vec!["reg_0102".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_answer_is_retried_whole() {
        let device = SimulatedDevice::new().with_registers(0x0100, &[1, 2, 3, 4]);
        device.corrupt_responses(1);
        let catalog = consecutive(0x0100, 4);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert_eq!(outcome.values.len(), 4);
        assert_eq!(outcome.failed_reads, 1);
        assert_eq!(device.reads(), vec![(0x0100, 4), (0x0100, 4)]);
        assert_eq!(reader.stats().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_word_entry_is_never_cut() {
        let device = SimulatedDevice::new()
            .with_registers(0x0200, &[0x0001, 0x0002])
            .with_unsupported(0x0203);
        let catalog = RegisterCatalog::new(vec![
            RegisterSpec::new("energy", 0x0200u16).with_type(DataType::U32),
            RegisterSpec::new("flag", 0x0202u16),
            RegisterSpec::new("missing", 0x0203u16),
        ])
        .unwrap();
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert_eq!(outcome.value("energy"), Some(65538.0));
        assert_eq!(outcome.newly_unsupported, vec![0x0203]);
        assert!(device.reads().contains(&(0x0200, 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_aborts_with_partial_results() {
        let device = SimulatedDevice::new();
        let catalog = RegisterCatalog::new(vec![
            RegisterSpec::new("a", 0x0100u16),
            RegisterSpec::new("b", 0x0200u16),
        ])
        .unwrap();
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();
        let batches = batches(&catalog, &DeviceLimits::default());
        assert_eq!(batches.len(), 2);

        let first = reader.refresh(&mut session, &batches[..1]).await;
        assert!(first.success);

        device.drop_link("range");
        let outcome = reader.refresh(&mut session, &batches).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(ModbusError::NotConnected));
        assert_eq!(outcome.batches_read, 0);
        assert_eq!(reader.stats().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_trips_breaker() {
        let device = SimulatedDevice::new();
        device.set_silent(true);
        let catalog = consecutive(0x0100, 8);
        let mut session = session(&device).await;
        let mut reader = ReadOrchestrator::default();

        let outcome = reader
            .refresh(&mut session, &batches(&catalog, &DeviceLimits::default()))
            .await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(ModbusError::CircuitOpen { timeouts: 3 })));
        assert!(!session.is_connected());
        assert_eq!(device.request_count(), 3);
    }
}
