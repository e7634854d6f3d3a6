//! # Voltage BLE Modbus - Batched Modbus RTU over lossy radio links
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Register transfer for an inverter whose Modbus RTU port is bridged over
//! Bluetooth Low Energy. The link is slow, drops out, and the device refuses
//! whole spans when a single address in them is unsupported. This crate
//! keeps a register catalog readable anyway.
//!
//! ## Features
//!
//! - **Batched reads**: catalog entries are packed into the fewest spans the
//!   device accepts, never cutting a multi-word value
//! - **Split-retry**: a refused span is bisected until the unsupported
//!   address is isolated, then remembered and skipped
//! - **Connection supervision**: exponential backoff, failure lockout and a
//!   circuit breaker for links that go silent
//! - **Adaptive timeouts**: response deadlines learned from measured latency
//! - **Password gating**: protected registers are unlocked before writing
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x03 | Read Holding Registers |
//! | 0x06 | Write Single Register |
//!
//! ## Quick Start
//!
//! ```rust
//! use voltage_ble_modbus::sim::SimulatedDevice;
//! use voltage_ble_modbus::{Engine, EngineConfig, ModbusResult, RegisterCatalog, RegisterSpec};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> ModbusResult<()> {
//!     let catalog = RegisterCatalog::new(vec![
//!         RegisterSpec::new("battery_soc", 0x0100u16).with_unit("%"),
//!     ])?;
//!     let device = SimulatedDevice::new().with_register(0x0100, 87);
//!
//!     let mut engine = Engine::new(EngineConfig::new("AA:BB:CC:DD:EE:FF"), catalog, device)?;
//!     let outcome = engine.refresh().await;
//!     println!("SOC: {:?}", outcome.value("battery_soc"));
//!
//!     let write = engine.write_register(0x0300, 1).await;
//!     assert!(write.success);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and result handling
pub mod error;

/// Protocol constants and vendor values
pub mod constants;

/// Device exception codes
pub mod exception;

/// CRC-16/MODBUS
pub mod crc;

/// Validated register addresses
pub mod address;

/// RTU frame building and parsing
pub mod frame;

/// Radio link abstraction
pub mod link;

/// Request/response exchange over a radio link
pub mod transport;

/// Packet logging
pub mod logging;

// ============================================================================
// Configuration and catalog
// ============================================================================

/// Device-specific protocol limits
pub mod device_limits;

/// Engine configuration
pub mod config;

/// Register descriptors and the catalog
pub mod register;

// ============================================================================
// Connection
// ============================================================================

/// Connection state machine
pub mod state;

/// Backoff, lockout and reconnection
pub mod supervisor;

// ============================================================================
// Reads and writes
// ============================================================================

/// Span planning
pub mod batch;

/// Addresses the device refused
pub mod failed;

/// Host-controlled exclusions
pub mod exclusion;

/// Timed single exchanges
pub mod session;

/// Batched reads with split-retry
pub mod reader;

/// Single-register writes and password gating
pub mod writer;

/// Engine façade
pub mod engine;

// ============================================================================
// Timing and persistence
// ============================================================================

/// Latency measurement
pub mod timing;

/// Learned response timeouts
pub mod learner;

/// State that outlives a session
pub mod persistence;

/// In-memory device for tests and demos
pub mod sim;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_ble_modbus::tokio) ===
pub use tokio;

// === Engine API ===
pub use engine::{Engine, EngineStats, ProcessedWrites};

// === Error handling ===
pub use error::{ErrorCategory, ModbusError, ModbusResult};

// === Core types ===
pub use address::RegisterAddress;
pub use exception::ExceptionCode;
pub use frame::{FrameCodec, Response};
pub use link::{LinkEvent, RadioLink};
pub use register::{Access, DataType, RegisterCatalog, RegisterSpec};
pub use state::ConnectionState;

// === Configuration ===
pub use config::{BackoffPolicy, EngineConfig, ExchangeTimings, LinkFraming, TimingConfig};
pub use device_limits::DeviceLimits;

// === Reads and writes ===
pub use batch::{BatchBuilder, FeatureMap, RegisterBatch};
pub use exclusion::{DisabledAddressSource, StaticExclusions};
pub use failed::FailedRegisterSet;
pub use reader::{ReadStats, RefreshOutcome};
pub use writer::{WriteOutcome, WriteStats, WriteTransaction};

// === Monitoring ===
pub use learner::{LearnedTimeout, TimeoutLearner};
pub use supervisor::SupervisorStats;
pub use timing::{TimingCollector, TimingStats};
pub use transport::TransportStats;

// === Persistence ===
pub use persistence::{MemoryStateStore, PersistedState, StateStore};

// === Logging ===
pub use logging::LoggingMode;

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_READ_REGISTERS, PASSWORD_REGISTER};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage BLE Modbus v{} - Batched Modbus RTU over BLE by Evan Liu",
        VERSION
    )
}
