//! Hot-path benchmarks: CRC, response decoding, span planning and a full
//! refresh against the in-memory device.
//!
//! Run with: cargo bench --bench throughput

use std::collections::BTreeSet;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_ble_modbus::crc::{crc16, CrcEngine};
use voltage_ble_modbus::sim::SimulatedDevice;
use voltage_ble_modbus::{
    BatchBuilder, DeviceLimits, Engine, EngineConfig, ExchangeTimings, FeatureMap, FrameCodec, LinkFraming,
    RegisterCatalog, RegisterSpec,
};

/// Read response for `count` registers, link header included.
fn read_response(count: u16) -> Vec<u8> {
    let mut frame = vec![0x01, 0x03, (count * 2) as u8];
    for i in 0..count {
        frame.extend_from_slice(&(0x1000 + i).to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    let mut notification = vec![0u8; 8];
    notification.extend_from_slice(&frame);
    notification
}

/// Catalog of `count` single-word entries with every fifth address skipped.
fn sparse_catalog(count: u16) -> RegisterCatalog {
    let entries = (0..count)
        .filter(|i| i % 5 != 4)
        .map(|i| RegisterSpec::new(format!("reg_{}", i), 0x0100 + i))
        .collect();
    RegisterCatalog::new(entries).expect("valid catalog")
}

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    let request = [0x01, 0x03, 0x01, 0x00, 0x00, 0x20];

    group.bench_function("uncached", |b| b.iter(|| crc16(black_box(&request))));

    let mut engine = CrcEngine::new();
    group.bench_function("memoized", |b| {
        b.iter(|| engine.calculate(black_box(&request)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_read_response");

    for count in [1u16, 8, 32, 125].iter() {
        let notification = read_response(*count);
        let mut codec = FrameCodec::new(0x01, LinkFraming::default());

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| codec.decode(black_box(&notification)).expect("decodes"))
        });
    }
    group.finish();
}

fn bench_batch_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_build");
    let features = FeatureMap::new();
    let none = BTreeSet::new();

    for gap in [0u16, 2].iter() {
        let catalog = sparse_catalog(400);
        let limits = DeviceLimits::new().with_max_gap(*gap);

        group.throughput(Throughput::Elements(catalog.len() as u64));
        group.bench_with_input(BenchmarkId::new("max_gap", gap), gap, |b, _| {
            b.iter(|| {
                let mut builder = BatchBuilder::new(&limits);
                builder.build(black_box(&catalog), &none, &features, &none)
            })
        });
    }
    group.finish();
}

fn bench_refresh(c: &mut Criterion) {
    let device = SimulatedDevice::new().with_response_delay(Duration::ZERO);
    let config = EngineConfig::new("bench")
        .with_limits(DeviceLimits::new().with_max_gap(1).with_inter_request_delay_ms(0))
        .with_timings(ExchangeTimings::new().with_settle_delay(Duration::ZERO));
    let mut engine = Engine::new(config, sparse_catalog(200), device).expect("valid engine");

    c.bench_function("refresh_200_registers", |b| {
        b.iter(|| tokio_test::block_on(engine.refresh()))
    });
}

criterion_group!(
    benches,
    bench_crc,
    bench_decode,
    bench_batch_build,
    bench_refresh
);
criterion_main!(benches);
