//! Criterion benchmarks for TickVault hot paths.
//!
//! Benchmarks:
//! 1. Kline aggregation (1m → 5m / 1h / 1d)
//! 2. Trade aggregation (prints → 1m bars)
//! 3. Streaming a zipped kline archive through the reader, with a fixed and a
//!    live process memory probe
//! 4. Batch validation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Write;
use std::sync::Arc;

use tickvault_core::config::{StreamConfig, ValidationConfig};
use tickvault_core::data::{
    aggregate_klines, aggregate_trades, validate_batch, FixedMemoryProbe, MemoryProbe,
    ParsedDataBatch, ProcessMemoryProbe, StreamingReader,
};
use tickvault_core::domain::{Kline, Timeframe, Trade};
use zip::write::SimpleFileOptions;

const T0: i64 = 1_704_067_200_000;

// ── Helpers ──────────────────────────────────────────────────────────

fn make_klines(n: usize) -> Vec<Kline> {
    (0..n)
        .map(|i| {
            let open_time = T0 + i as i64 * 60_000;
            let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            Kline {
                open_time,
                open: close - 0.3,
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: 10.0 + (i % 7) as f64,
                close_time: open_time + 59_999,
                quote_volume: 1_000.0,
                trade_count: 25,
                taker_buy_base_volume: 5.0,
                taker_buy_quote_volume: 500.0,
            }
        })
        .collect()
}

fn make_trades(n: usize) -> Vec<Trade> {
    (0..n)
        .map(|i| {
            let price = 100.0 + (i as f64 * 0.01).sin();
            Trade {
                id: i as u64,
                price,
                quantity: 0.25,
                quote_qty: price * 0.25,
                time: T0 + i as i64 * 250,
                is_buyer_maker: i % 3 == 0,
            }
        })
        .collect()
}

fn kline_archive(dir: &std::path::Path, bars: &[Kline]) -> std::path::PathBuf {
    let path = dir.join(format!("bench-{}.zip", bars.len()));
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    zip.start_file("bench.csv", SimpleFileOptions::default()).unwrap();
    writeln!(zip, "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore").unwrap();
    for k in bars {
        writeln!(
            zip,
            "{},{},{},{},{},{},{},{},{},{},{},0",
            k.open_time,
            k.open,
            k.high,
            k.low,
            k.close,
            k.volume,
            k.close_time,
            k.quote_volume,
            k.trade_count,
            k.taker_buy_base_volume,
            k.taker_buy_quote_volume
        )
        .unwrap();
    }
    zip.finish().unwrap();
    path
}

// ── 1. Kline aggregation ─────────────────────────────────────────────

fn bench_aggregate_klines(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_klines");

    for &bar_count in &[1_440, 10_080, 43_200] {
        let bars = make_klines(bar_count);
        for target in [Timeframe::M5, Timeframe::H1, Timeframe::D1] {
            group.bench_with_input(
                BenchmarkId::new(target.as_str(), bar_count),
                &bar_count,
                |b, _| {
                    b.iter(|| aggregate_klines(black_box(&bars), target));
                },
            );
        }
    }

    group.finish();
}

// ── 2. Trade aggregation ─────────────────────────────────────────────

fn bench_aggregate_trades(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_trades");

    for &trade_count in &[10_000, 100_000] {
        let trades = make_trades(trade_count);
        group.bench_with_input(BenchmarkId::new("1m", trade_count), &trade_count, |b, _| {
            b.iter(|| aggregate_trades(black_box(&trades), Timeframe::M1));
        });
    }

    group.finish();
}

// ── 3. Streaming ─────────────────────────────────────────────────────

fn bench_stream_klines(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_klines");
    let dir = tempfile::tempdir().unwrap();

    for &bar_count in &[1_440, 10_080] {
        let path = kline_archive(dir.path(), &make_klines(bar_count));
        let probes: [(&str, Arc<dyn MemoryProbe>); 2] = [
            ("fixed_probe", Arc::new(FixedMemoryProbe::from_mb(1))),
            ("process_probe", Arc::new(ProcessMemoryProbe::new())),
        ];
        for (name, probe) in probes {
            let mut reader = StreamingReader::with_probe(StreamConfig::default(), probe);
            group.bench_with_input(BenchmarkId::new(name, bar_count), &bar_count, |b, _| {
                b.iter(|| {
                    let mut volume = 0.0;
                    reader
                        .stream_klines(black_box(&path), |k| {
                            volume += k.volume;
                            Ok(())
                        })
                        .unwrap();
                    volume
                });
            });
        }
    }

    group.finish();
}

// ── 4. Validation ────────────────────────────────────────────────────

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_batch");
    let config = ValidationConfig::default();

    for &bar_count in &[1_440, 43_200] {
        let batch = ParsedDataBatch::from_klines("BENCH", "2024-01-01", Timeframe::M1, make_klines(bar_count));
        group.bench_with_input(BenchmarkId::new("klines", bar_count), &bar_count, |b, _| {
            b.iter(|| validate_batch(black_box(&batch), &config));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_aggregate_klines,
    bench_aggregate_trades,
    bench_stream_klines,
    bench_validate,
);
criterion_main!(benches);
