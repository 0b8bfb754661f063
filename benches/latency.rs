//! Latency benchmarks for the hot paths of a scan and a monitor tick.
//!
//! Run with: `cargo bench --bench latency`

use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use exchange_core::cache::TtlCache;
use exchange_core::precision::floor_to_step;
use exchange_core::types::{Candle, PositionSide, Side};
use market_signals::{IndicatorParams, SignalSet};
use risk_manager::{TrailingParams, TrailingState};
use trading_engine::scorer::{score, MarketContext};
use trading_engine::TrailingBook;

/// A random walk of hourly candles.
fn generate_candles(count: usize, seed: u64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut close = 100.0_f64;
    (0..count)
        .map(|i| {
            let open = close;
            close = (open * (1.0 + rng.gen_range(-0.01..0.01))).max(1.0);
            Candle {
                open_time: start + ChronoDuration::hours(i as i64),
                open,
                high: open.max(close) * (1.0 + rng.gen_range(0.0..0.005)),
                low: open.min(close) * (1.0 - rng.gen_range(0.0..0.005)),
                close,
                volume: rng.gen_range(500.0..1500.0),
            }
        })
        .collect()
}

fn bench_signal_computation(c: &mut Criterion) {
    let mut group = c.benchmark_group("signals");
    let params = IndicatorParams::default();

    for count in [50, 100, 500] {
        let candles = generate_candles(count, 7);
        group.bench_with_input(BenchmarkId::new("signal_set", count), &candles, |b, candles| {
            b.iter(|| SignalSet::compute(black_box(candles), &params))
        });
    }

    group.finish();
}

fn bench_scoring(c: &mut Criterion) {
    let signals = SignalSet::compute(&generate_candles(100, 11), &IndicatorParams::default())
        .expect("signal set");
    let context = MarketContext {
        sentiment: 0.4,
        book_pressure: 0.2,
        timeframe_bias: 0.6,
        performance_ratio: 1.3,
    };

    c.bench_function("score_opportunity", |b| {
        b.iter(|| score(black_box(&signals), black_box(&context), Side::Long).total())
    });
}

fn bench_precision(c: &mut Criterion) {
    let mut group = c.benchmark_group("precision");
    let value = Decimal::new(123_456_789, 5);

    for step in [Decimal::new(1, 3), Decimal::new(1, 1), Decimal::new(5, 0)] {
        group.bench_with_input(BenchmarkId::new("floor_to_step", step), &step, |b, step| {
            b.iter(|| floor_to_step(black_box(value), *step))
        });
    }

    group.finish();
}

fn bench_trailing(c: &mut Criterion) {
    let mut group = c.benchmark_group("trailing");
    let state = TrailingState::seed(
        "BTCUSDT",
        Side::Long,
        PositionSide::Both,
        Decimal::from(100),
        Decimal::ONE,
        TrailingParams::default(),
        Utc::now(),
    );
    let prices: Vec<Decimal> = (0..100).map(|i| Decimal::new(10_000 + i * 7, 2)).collect();

    group.bench_function("exit_trigger", |b| {
        b.iter(|| state.exit_trigger(black_box(Decimal::new(9_950, 2))))
    });

    group.bench_function("ratchet_sequence", |b| {
        b.iter(|| {
            let mut s = state.clone();
            for price in &prices {
                black_box(s.ratchet(*price));
            }
            s.stop_loss
        })
    });

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(3600), 1000);
    for i in 0..1000u64 {
        cache.insert(format!("SYM{i}USDT"), i);
    }
    let key = "SYM500USDT".to_string();

    group.bench_function("get_hit", |b| b.iter(|| cache.get(black_box(&key))));

    let mut next = 1000u64;
    group.bench_function("insert_with_eviction", |b| {
        b.iter(|| {
            next += 1;
            cache.insert(format!("SYM{next}USDT"), next);
        })
    });

    group.finish();
}

fn bench_trailing_book(c: &mut Criterion) {
    let mut group = c.benchmark_group("trailing_book");
    let book = TrailingBook::new();
    for i in 0..100 {
        let symbol = format!("SYM{i}USDT");
        book.put(
            "alice",
            TrailingState::seed(
                &symbol,
                Side::Short,
                PositionSide::Both,
                Decimal::from(50 + i),
                Decimal::ONE,
                TrailingParams::default(),
                Utc::now(),
            ),
        );
    }

    group.bench_function("get", |b| b.iter(|| book.get("alice", black_box("SYM42USDT"))));
    group.bench_function("symbols", |b| b.iter(|| book.symbols(black_box("alice"))));

    group.finish();
}

criterion_group!(
    benches,
    bench_signal_computation,
    bench_scoring,
    bench_precision,
    bench_trailing,
    bench_cache,
    bench_trailing_book,
);
criterion_main!(benches);
