//! Voltage BLE Modbus Demo
//!
//! Runs the engine against the in-memory device and shows:
//! - Span planning for a small inverter catalog
//! - A refresh that discovers an unsupported register by split-retry
//! - Password-gated writes
//! - Learned timeouts after a few dozen cycles
//!
//! Usage: cargo run --bin demo
//! Set RUST_LOG=voltage_ble_modbus=debug for per-request logs.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use voltage_ble_modbus::sim::SimulatedDevice;
use voltage_ble_modbus::{
    Access, DataType, Engine, EngineConfig, MemoryStateStore, RegisterCatalog, RegisterSpec,
};

fn catalog() -> voltage_ble_modbus::ModbusResult<RegisterCatalog> {
    RegisterCatalog::new(vec![
        RegisterSpec::new("battery_soc", 0x0100u16).with_unit("%"),
        RegisterSpec::new("battery_voltage", 0x0101u16)
            .with_scale(0.1)
            .with_unit("V"),
        RegisterSpec::new("battery_current", 0x0102u16)
            .with_type(DataType::I16)
            .with_scale(0.1)
            .with_unit("A"),
        RegisterSpec::new("pv_power", 0x0109u16).with_unit("W"),
        RegisterSpec::new("load_power", 0x021Bu16).with_unit("W"),
        RegisterSpec::new("total_energy", 0x021Cu16)
            .with_type(DataType::U32)
            .with_scale(0.1)
            .with_unit("kWh"),
        RegisterSpec::new("output_priority", 0xE204u16).with_access(Access::ReadWrite),
        RegisterSpec::new("max_charge_current", 0xE00Au16)
            .with_access(Access::ReadWrite)
            .with_scale(0.1)
            .with_bounds(0.0, 150.0)
            .with_unit("A"),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("{}", voltage_ble_modbus::info());
    println!("==========================================\n");

    let device = SimulatedDevice::new()
        .with_registers(0x0100, &[87, 532, 65500])
        .with_register(0x0109, 1250)
        .with_registers(0x021B, &[430, 0x0001, 0x0002])
        .with_register(0xE00A, 600)
        .with_unsupported(0x021B)
        .with_password(1111)
        .with_response_delay(Duration::from_millis(120));

    let store = Arc::new(MemoryStateStore::new());
    let config = EngineConfig::new("AA:BB:CC:DD:EE:FF").with_password(1111);
    let mut engine = Engine::new(config, catalog()?, device.clone())?.with_store(store.clone())?;

    // =========================================================================
    // Part 1: Span planning
    // =========================================================================
    println!("📦 Part 1: Span planning");
    println!("------------------------");
    for batch in engine.batches() {
        println!(
            "  0x{:04X} x{:<3} {} members",
            batch.start().value(),
            batch.count(),
            batch.members().len()
        );
    }

    // =========================================================================
    // Part 2: Refresh with an unsupported register
    // =========================================================================
    println!("\n🔄 Part 2: Refresh");
    println!("------------------");
    let outcome = engine.refresh().await;
    for (name, value) in &outcome.values {
        println!("  {:<20} {}", name, value);
    }
    println!(
        "  success={} batches={} unsupported={:?} took {:?}",
        outcome.success, outcome.batches_read, outcome.newly_unsupported, outcome.duration
    );
    if let Some(state) = store.snapshot() {
        println!("  persisted failed registers: {:?}", state.failed_registers);
    }

    // =========================================================================
    // Part 3: Writes
    // =========================================================================
    println!("\n✏️  Part 3: Writes");
    println!("------------------");
    let plain = engine.write_register(0xE204, 2).await;
    println!("  output_priority <- 2: success={}", plain.success);

    let gated = engine.write_value("max_charge_current", 80.0).await;
    println!(
        "  max_charge_current <- 80.0: success={} (device unlocked: {})",
        gated.success,
        device.is_unlocked()
    );

    let rejected = engine.write_register(0x0101, 70_000).await;
    println!(
        "  battery_voltage <- 70000: {}",
        rejected.message.unwrap_or_default()
    );

    // =========================================================================
    // Part 4: Learned timeouts
    // =========================================================================
    println!("\n⏱️  Part 4: Learned timeouts");
    println!("----------------------------");
    for _ in 0..30 {
        engine.refresh().await;
    }
    for learned in engine.learned_timeouts() {
        println!(
            "  {:<14} {}ms (p95 {:.1}ms over {} samples, {:+.0}% vs default)",
            learned.operation,
            learned.timeout_ms,
            learned.p95_ms,
            learned.samples,
            learned.change_percent()
        );
    }

    let stats = engine.stats();
    println!("\n📊 Stats");
    println!("--------");
    println!("  state:        {}", stats.state);
    println!("  requests:     {}", stats.transport.requests_sent);
    println!("  splits:       {}", stats.reads.splits);
    println!("  writes:       {}/{}", stats.writes.succeeded, stats.writes.writes);

    engine.disconnect().await;
    Ok(())
}
