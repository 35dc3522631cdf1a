//! Property tests for aggregation invariants.
//!
//! Uses proptest to verify:
//! 1. Volume conservation — aggregation never creates or loses volume
//! 2. Range sanity — every output bar has high >= low and contains open/close
//! 3. Order independence — reversing the input does not change the output
//! 4. Bucket alignment — output open times sit on interval boundaries

use proptest::prelude::*;
use tickvault_core::data::{aggregate_klines, aggregate_trades};
use tickvault_core::domain::{Kline, Timeframe, Trade};

const T0: i64 = 1_704_067_200_000;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_price() -> impl Strategy<Value = f64> {
    (10.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

fn arb_volume() -> impl Strategy<Value = f64> {
    (0.0..1000.0_f64).prop_map(|v| (v * 1000.0).round() / 1000.0)
}

/// One-minute bar at minute `slot` with a consistent OHLC range.
fn arb_kline(slot: i64) -> impl Strategy<Value = Kline> {
    (arb_price(), arb_price(), arb_price(), arb_price(), arb_volume(), 0u64..500).prop_map(
        move |(a, b, c, d, volume, trades)| {
            let high = a.max(b).max(c).max(d);
            let low = a.min(b).min(c).min(d);
            let open_time = T0 + slot * 60_000;
            Kline {
                open_time,
                open: a,
                high,
                low,
                close: d,
                volume,
                close_time: open_time + 59_999,
                quote_volume: volume * d,
                trade_count: trades,
                taker_buy_base_volume: volume / 2.0,
                taker_buy_quote_volume: volume * d / 2.0,
            }
        },
    )
}

/// A set of bars on distinct minute slots within one day.
fn arb_series() -> impl Strategy<Value = Vec<Kline>> {
    prop::collection::btree_set(0i64..1_440, 1..120).prop_flat_map(|slots| {
        slots
            .into_iter()
            .map(arb_kline)
            .collect::<Vec<_>>()
    })
}

fn arb_trades() -> impl Strategy<Value = Vec<Trade>> {
    prop::collection::vec(
        (0i64..3_600_000, arb_price(), 0.001..10.0_f64, any::<bool>()),
        1..200,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (offset, price, quantity, is_buyer_maker))| Trade {
                id: i as u64,
                price,
                quantity,
                quote_qty: price * quantity,
                time: T0 + offset,
                is_buyer_maker,
            })
            .collect()
    })
}

fn arb_target() -> impl Strategy<Value = Timeframe> {
    prop::sample::select(vec![
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ])
}

fn close_enough(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
}

// ── 1. Volume conservation ───────────────────────────────────────────

proptest! {
    #[test]
    fn kline_volume_is_conserved(bars in arb_series(), target in arb_target()) {
        let out = aggregate_klines(&bars, target).unwrap();

        let vol_in: f64 = bars.iter().map(|k| k.volume).sum();
        let vol_out: f64 = out.iter().map(|k| k.volume).sum();
        prop_assert!(close_enough(vol_in, vol_out), "{} vs {}", vol_in, vol_out);

        let trades_in: u64 = bars.iter().map(|k| k.trade_count).sum();
        let trades_out: u64 = out.iter().map(|k| k.trade_count).sum();
        prop_assert_eq!(trades_in, trades_out);
    }

    #[test]
    fn trade_volume_is_conserved(trades in arb_trades(), target in arb_target()) {
        let out = aggregate_trades(&trades, target).unwrap();

        let qty_in: f64 = trades.iter().map(|t| t.quantity).sum();
        let qty_out: f64 = out.iter().map(|k| k.volume).sum();
        prop_assert!(close_enough(qty_in, qty_out));

        let count: u64 = out.iter().map(|k| k.trade_count).sum();
        prop_assert_eq!(count, trades.len() as u64);
    }
}

// ── 2. Range sanity ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn aggregated_bars_are_sane(bars in arb_series(), target in arb_target()) {
        let out = aggregate_klines(&bars, target).unwrap();
        for k in &out {
            prop_assert!(k.is_sane(), "insane bar: {:?}", k);
            prop_assert!(k.low <= k.open && k.open <= k.high);
            prop_assert!(k.low <= k.close && k.close <= k.high);
        }

        let max_in = bars.iter().map(|k| k.high).fold(f64::NEG_INFINITY, f64::max);
        let max_out = out.iter().map(|k| k.high).fold(f64::NEG_INFINITY, f64::max);
        prop_assert_eq!(max_in, max_out);
    }

    #[test]
    fn trade_bars_bracket_every_print(trades in arb_trades()) {
        let out = aggregate_trades(&trades, Timeframe::M5).unwrap();
        for t in &trades {
            let bucket = Timeframe::M5.bucket_start(t.time);
            let bar = out.iter().find(|k| k.open_time == bucket);
            prop_assert!(bar.is_some());
            let bar = bar.unwrap();
            prop_assert!(bar.low <= t.price && t.price <= bar.high);
        }
    }
}

// ── 3. Order independence ────────────────────────────────────────────

proptest! {
    #[test]
    fn reversed_input_gives_same_bars(bars in arb_series(), target in arb_target()) {
        let sorted = aggregate_klines(&bars, target).unwrap();
        let mut reversed = bars.clone();
        reversed.reverse();
        prop_assert_eq!(aggregate_klines(&reversed, target).unwrap(), sorted);
    }
}

// ── 4. Bucket alignment ──────────────────────────────────────────────

proptest! {
    #[test]
    fn buckets_are_aligned_and_strictly_increasing(bars in arb_series(), target in arb_target()) {
        let out = aggregate_klines(&bars, target).unwrap();
        let interval = target.interval_ms();

        prop_assert!(out.len() <= bars.len());
        for k in &out {
            prop_assert_eq!(k.open_time.rem_euclid(interval), 0);
            prop_assert_eq!(k.close_time, k.open_time + interval - 1);
        }
        for pair in out.windows(2) {
            prop_assert!(pair[0].open_time < pair[1].open_time);
        }
    }
}
