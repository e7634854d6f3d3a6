//! # Engine
//!
//! The façade a host drives. One engine owns one device: its catalog, the
//! connection, the batch list and the write queue. Every call runs on the
//! caller's task and at most one exchange is ever in flight.
//!
//! ## Example
//!
//! ```rust
//! use voltage_ble_modbus::sim::SimulatedDevice;
//! use voltage_ble_modbus::{DataType, Engine, EngineConfig, RegisterCatalog, RegisterSpec};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> voltage_ble_modbus::ModbusResult<()> {
//! let catalog = RegisterCatalog::new(vec![
//!     RegisterSpec::new("battery_voltage", 0x0100u16).with_scale(0.1).with_unit("V"),
//!     RegisterSpec::new("battery_current", 0x0101u16)
//!         .with_type(DataType::I16)
//!         .with_scale(0.1)
//!         .with_unit("A"),
//! ])?;
//! let device = SimulatedDevice::new().with_registers(0x0100, &[2400, 65500]);
//!
//! let mut engine = Engine::new(EngineConfig::new("AA:BB:CC:DD:EE:FF"), catalog, device)?;
//! let outcome = engine.refresh().await;
//!
//! assert!(outcome.success);
//! assert_eq!(outcome.value("battery_voltage"), Some(240.0));
//! assert_eq!(outcome.value("battery_current"), Some(-3.6));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::address::RegisterAddress;
use crate::batch::{BatchBuilder, FeatureMap, RegisterBatch};
use crate::config::EngineConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::exclusion::DisabledAddressSource;
use crate::failed::FailedRegisterSet;
use crate::learner::LearnedTimeout;
use crate::link::RadioLink;
use crate::logging::LoggingMode;
use crate::persistence::{PersistedState, StateStore};
use crate::reader::{ReadOrchestrator, ReadStats, RefreshOutcome};
use crate::register::RegisterCatalog;
use crate::session::Session;
use crate::state::ConnectionState;
use crate::supervisor::{ConnectionSupervisor, SupervisorStats};
use crate::timing::TimingStats;
use crate::transport::TransportStats;
use crate::writer::{WriteOrchestrator, WriteOutcome, WriteQueue, WriteStats, WriteTransaction};

/// Result of draining the write queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedWrites {
    pub outcomes: Vec<WriteOutcome>,
    /// Link error that stopped processing; the rest stays queued.
    pub error: Option<ModbusError>,
    pub remaining: usize,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub state: ConnectionState,
    pub transport: TransportStats,
    pub supervisor: SupervisorStats,
    pub reads: ReadStats,
    pub writes: WriteStats,
    pub timing: Vec<TimingStats>,
    pub learned_timeouts: Vec<LearnedTimeout>,
    pub batches: usize,
    pub failed_registers: usize,
    pub queued_writes: usize,
}

/// Polling and write engine for one device.
pub struct Engine<L> {
    config: EngineConfig,
    catalog: RegisterCatalog,
    features: FeatureMap,
    failed: FailedRegisterSet,
    excluded: BTreeSet<u16>,
    exclusions: Option<watch::Receiver<BTreeSet<u16>>>,
    builder: BatchBuilder,
    batches: Vec<RegisterBatch>,
    dirty: bool,
    supervisor: ConnectionSupervisor,
    session: Session<L>,
    reader: ReadOrchestrator,
    writer: WriteOrchestrator,
    queue: WriteQueue,
    store: Option<Arc<dyn StateStore>>,
    saved_timeouts: Vec<LearnedTimeout>,
}

impl<L: RadioLink> Engine<L> {
    pub fn new(config: EngineConfig, catalog: RegisterCatalog, link: L) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            features: FeatureMap::new(),
            failed: FailedRegisterSet::new(),
            excluded: BTreeSet::new(),
            exclusions: None,
            builder: BatchBuilder::new(&config.limits),
            batches: Vec::new(),
            dirty: true,
            supervisor: ConnectionSupervisor::new(config.device_address.clone(), config.backoff),
            session: Session::new(link, &config),
            reader: ReadOrchestrator::new(&config.limits),
            writer: WriteOrchestrator::new(config.password),
            queue: WriteQueue::new(config.limits.write_queue_capacity),
            store: None,
            saved_timeouts: Vec::new(),
            catalog,
            config,
        })
    }

    /// Firmware features and the address ranges they own.
    pub fn with_features(mut self, features: FeatureMap) -> Self {
        self.features = features;
        self.dirty = true;
        self
    }

    /// Follow an external exclusion set.
    pub fn with_exclusions(mut self, source: &dyn DisabledAddressSource) -> Self {
        let mut rx = source.subscribe();
        self.excluded = rx.borrow_and_update().clone();
        self.exclusions = Some(rx);
        self.dirty = true;
        self
    }

    pub fn with_logging(mut self, mode: LoggingMode) -> Self {
        self.session = self.session.with_logging(mode);
        self
    }

    /// Attach a store and restore whatever it holds.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> ModbusResult<Self> {
        if let Some(state) = store.load()? {
            self.restore(state);
        }
        self.store = Some(store);
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    #[inline]
    pub fn features(&self) -> &FeatureMap {
        &self.features
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected() && self.session.is_connected()
    }

    #[inline]
    pub fn failed_registers(&self) -> &FailedRegisterSet {
        &self.failed
    }

    #[inline]
    pub fn queued_writes(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    /// Current batch list, rebuilt first if its inputs changed.
    pub fn batches(&mut self) -> &[RegisterBatch] {
        self.sync_exclusions();
        if self.dirty {
            self.rebuild_batches();
        }
        &self.batches
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.supervisor.state(),
            transport: self.session.transport().stats().clone(),
            supervisor: self.supervisor.stats().clone(),
            reads: self.reader.stats().clone(),
            writes: self.writer.stats().clone(),
            timing: self.session.timing().all_stats(),
            learned_timeouts: self.learned_timeouts(),
            batches: self.batches.len(),
            failed_registers: self.failed.len(),
            queued_writes: self.queue.len(),
        }
    }

    pub fn learned_timeouts(&self) -> Vec<LearnedTimeout> {
        self.session.learner().all(self.session.timing())
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect if needed, honouring backoff and lockout.
    pub async fn connect(&mut self) -> ModbusResult<()> {
        let was_connected = self.is_connected();
        self.supervisor
            .ensure_connected(self.session.transport_mut())
            .await?;
        if !was_connected {
            // A fresh link means a locked device.
            self.writer.reset_authentication();
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.supervisor.disconnect(self.session.transport_mut()).await;
        self.writer.reset_authentication();
    }

    /// Tell the supervisor about a link the transport tore down.
    fn note_link_error(&mut self, err: &ModbusError) {
        if self.supervisor.is_connected() && !self.session.is_connected() {
            self.supervisor.handle_connection_lost(&err.to_string());
        }
        self.writer.reset_authentication();
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Poll every batch once.
    pub async fn refresh(&mut self) -> RefreshOutcome {
        if let Err(err) = self.connect().await {
            debug!("Refresh skipped: {}", err);
            return RefreshOutcome {
                success: false,
                error: Some(err),
                ..Default::default()
            };
        }

        self.sync_exclusions();
        if self.dirty {
            self.rebuild_batches();
        }

        let outcome = self.reader.refresh(&mut self.session, &self.batches).await;

        if let Some(err) = outcome.error.as_ref().filter(|e| e.is_link_error()) {
            self.note_link_error(err);
        }

        let added = self.failed.extend(outcome.newly_unsupported.iter().copied());
        if added > 0 {
            info!("{} registers marked unsupported, rebuilding batches", added);
            self.dirty = true;
        }
        if added > 0 || self.timeouts_moved() {
            self.persist();
        }
        outcome
    }

    /// Whether a learned timeout differs from the last saved one.
    fn timeouts_moved(&self) -> bool {
        let saved: BTreeMap<&str, u64> = self
            .saved_timeouts
            .iter()
            .map(|l| (l.operation.as_str(), l.timeout_ms))
            .collect();
        let learned = self.learned_timeouts();
        learned.len() != saved.len()
            || learned
                .iter()
                .any(|l| saved.get(l.operation.as_str()) != Some(&l.timeout_ms))
    }

    fn sync_exclusions(&mut self) {
        let Some(rx) = self.exclusions.as_mut() else {
            return;
        };
        match rx.has_changed() {
            Ok(true) => {
                self.excluded = rx.borrow_and_update().clone();
                debug!("Exclusion set changed: {} addresses", self.excluded.len());
                self.dirty = true;
            }
            Ok(false) => {}
            Err(_) => {
                debug!("Exclusion source dropped; keeping the last set");
                self.exclusions = None;
            }
        }
    }

    fn rebuild_batches(&mut self) {
        let failed = self.failed.snapshot();
        self.batches = self
            .builder
            .build(&self.catalog, &failed, &self.features, &self.excluded);
        self.dirty = false;
        info!(
            "{} batches for {} catalog entries ({} unsupported, {} excluded)",
            self.batches.len(),
            self.catalog.len(),
            failed.len(),
            self.excluded.len()
        );
    }

    /// Enable or disable a firmware feature; batches are rebuilt on change.
    pub fn set_feature_enabled(&mut self, feature: &str, enabled: bool) -> bool {
        let changed = self.features.set_enabled(feature, enabled);
        if changed {
            info!(
                "Feature {} {}",
                feature,
                if enabled { "enabled" } else { "disabled" }
            );
            self.dirty = true;
        }
        changed
    }

    /// Forget every unsupported address so all are probed again.
    pub fn clear_failed_registers(&mut self) -> bool {
        let cleared = self.failed.clear();
        if cleared {
            info!("Failed register set cleared");
            self.dirty = true;
            self.persist();
        }
        cleared
    }

    /// Forget one unsupported address.
    pub fn recover_register(&mut self, address: u16) -> bool {
        let removed = self.failed.remove(address);
        if removed {
            info!("Register 0x{:04X} will be polled again", address);
            self.dirty = true;
            self.persist();
        }
        removed
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a raw value. Address and value are range-checked before any I/O.
    pub async fn write_register(
        &mut self,
        register: impl Into<i64>,
        value: impl Into<i64>,
    ) -> WriteOutcome {
        let register = register.into();
        let value = value.into();
        let (address, raw) = match validate_write(register, value) {
            Ok(checked) => checked,
            Err(err) => {
                warn!("Write rejected: {}", err);
                return WriteOutcome::rejected(register as u16, value as u16, err);
            }
        };
        self.execute_write(address, raw).await
    }

    /// Write an engineering value to a catalog entry by name.
    pub async fn write_value(&mut self, name: &str, value: f64) -> WriteOutcome {
        let Some(spec) = self.catalog.get(name) else {
            return WriteOutcome::rejected(
                0,
                0,
                ModbusError::configuration(format!("unknown register '{}'", name)),
            );
        };
        let address = spec.address;
        match spec.encode(value) {
            Ok(raw) => self.execute_write(address, raw).await,
            Err(err) => {
                warn!("Write to {} rejected: {}", name, err);
                WriteOutcome::rejected(address.value(), 0, err)
            }
        }
    }

    async fn execute_write(&mut self, address: RegisterAddress, value: u16) -> WriteOutcome {
        if let Err(err) = self.connect().await {
            return WriteOutcome::rejected(address.value(), value, err);
        }
        match self.writer.write(&mut self.session, address, value).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.note_link_error(&err);
                WriteOutcome::rejected(address.value(), value, err)
            }
        }
    }

    /// Queue a raw write for [`Engine::process_writes`].
    pub fn queue_write(
        &mut self,
        register: impl Into<i64>,
        value: impl Into<i64>,
        priority: u8,
    ) -> ModbusResult<()> {
        let (address, raw) = validate_write(register.into(), value.into())?;
        self.queue
            .try_push(WriteTransaction::new(address, raw).with_priority(priority))?;
        debug!("Queued write {} = {} ({} pending)", address, raw, self.queue.len());
        Ok(())
    }

    /// Execute queued writes in order, stopping at the first link error.
    pub async fn process_writes(&mut self) -> ProcessedWrites {
        let mut processed = ProcessedWrites::default();
        if self.queue.is_empty() {
            return processed;
        }
        if let Err(err) = self.connect().await {
            processed.error = Some(err);
            processed.remaining = self.queue.len();
            return processed;
        }

        while let Some(transaction) = self.queue.pop() {
            match self
                .writer
                .write(&mut self.session, transaction.register, transaction.value)
                .await
            {
                Ok(outcome) => processed.outcomes.push(outcome),
                Err(err) => {
                    warn!(
                        "Write queue stopped at {}: {} ({} left)",
                        transaction.register,
                        err,
                        self.queue.len() + 1
                    );
                    self.queue.push_front(transaction);
                    self.note_link_error(&err);
                    processed.error = Some(err);
                    break;
                }
            }
        }
        processed.remaining = self.queue.len();
        processed
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// State worth keeping across restarts.
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            failed_registers: self.failed.iter().collect(),
            learned_timeouts: self.learned_timeouts(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Install state from a previous run.
    pub fn restore(&mut self, state: PersistedState) {
        info!(
            "Restoring {} unsupported registers and {} learned timeouts",
            state.failed_registers.len(),
            state.learned_timeouts.len()
        );
        self.failed = state.failed_registers.into_iter().collect();
        self.saved_timeouts = state.learned_timeouts.clone();
        self.session.learner_mut().restore(state.learned_timeouts);
        self.dirty = true;
    }

    /// Save through the attached store, if any.
    pub fn save_state(&mut self) -> ModbusResult<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let state = self.persisted_state();
        store.save(&state)?;
        self.saved_timeouts = state.learned_timeouts;
        Ok(())
    }

    fn persist(&mut self) {
        if let Err(err) = self.save_state() {
            warn!("Failed to save engine state: {}", err);
        }
    }
}

fn validate_write(register: i64, value: i64) -> ModbusResult<(RegisterAddress, u16)> {
    let address = RegisterAddress::new(register)?;
    let raw = u16::try_from(value).map_err(|_| {
        ModbusError::invalid_data(format!("value {} outside 0..=65535", value))
    })?;
    Ok((address, raw))
}
