//! Timeframe aggregation, continuity checks and multi-resolution alignment.
//!
//! Every function works on an explicitly time-sorted copy of its input, so
//! caller ordering never matters. Buckets are `floor(t / interval) * interval`.

use crate::data::error::{ContinuityBreak, ContinuityReport, DataError, Result};
use crate::domain::{Kline, Timeframe, Trade};
use std::collections::HashMap;

/// Fold finer bars into `target`-sized bars.
///
/// Open comes from the first bar of each bucket, close from the last,
/// high/low are extrema, and all volumes and trade counts are summed.
pub fn aggregate_klines(bars: &[Kline], target: Timeframe) -> Result<Vec<Kline>> {
    if bars.is_empty() {
        return Err(DataError::EmptyInput("no klines to aggregate".into()));
    }

    let mut sorted = bars.to_vec();
    sorted.sort_by_key(|k| k.open_time);

    let interval = target.interval_ms();
    let mut out: Vec<Kline> = Vec::new();

    for bar in sorted {
        let bucket = target.bucket_start(bar.open_time);
        match out.last_mut() {
            Some(agg) if agg.open_time == bucket => {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
                agg.quote_volume += bar.quote_volume;
                agg.trade_count += bar.trade_count;
                agg.taker_buy_base_volume += bar.taker_buy_base_volume;
                agg.taker_buy_quote_volume += bar.taker_buy_quote_volume;
                continue;
            }
            _ => {}
        }
        out.push(Kline {
            open_time: bucket,
            close_time: bucket + interval - 1,
            ..bar
        });
    }

    Ok(out)
}

/// Build `timeframe` bars directly from trade prints.
///
/// A new bucket seeds OHLC from its first trade. Taker-buy sub-totals
/// accumulate the trades flagged buyer-maker.
pub fn aggregate_trades(trades: &[Trade], timeframe: Timeframe) -> Result<Vec<Kline>> {
    if trades.is_empty() {
        return Err(DataError::EmptyInput("no trades to aggregate".into()));
    }

    let mut sorted = trades.to_vec();
    sorted.sort_by_key(|t| t.time);

    let interval = timeframe.interval_ms();
    let mut out: Vec<Kline> = Vec::new();

    for trade in &sorted {
        let bucket = timeframe.bucket_start(trade.time);
        let needs_new = out.last().map_or(true, |k| k.open_time != bucket);
        if needs_new {
            out.push(Kline {
                open_time: bucket,
                open: trade.price,
                high: trade.price,
                low: trade.price,
                close: trade.price,
                volume: 0.0,
                close_time: bucket + interval - 1,
                quote_volume: 0.0,
                trade_count: 0,
                taker_buy_base_volume: 0.0,
                taker_buy_quote_volume: 0.0,
            });
        }

        if let Some(bar) = out.last_mut() {
            bar.high = bar.high.max(trade.price);
            bar.low = bar.low.min(trade.price);
            bar.close = trade.price;
            bar.volume += trade.quantity;
            bar.quote_volume += trade.quote_qty;
            bar.trade_count += 1;
            if trade.is_buyer_maker {
                bar.taker_buy_base_volume += trade.quantity;
                bar.taker_buy_quote_volume += trade.quote_qty;
            }
        }
    }

    Ok(out)
}

/// Check that consecutive bars (after sorting) are exactly one interval apart.
///
/// Every gap or overlap is reported with the index pair (in sorted order) and
/// the difference between actual and expected open time.
pub fn validate_continuity(bars: &[Kline], timeframe: Timeframe) -> Result<()> {
    let mut times: Vec<i64> = bars.iter().map(|k| k.open_time).collect();
    times.sort_unstable();

    let interval = timeframe.interval_ms();
    let breaks: Vec<ContinuityBreak> = times
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let gap_ms = pair[1] - (pair[0] + interval);
            (gap_ms != 0).then_some(ContinuityBreak {
                prev_index: i,
                index: i + 1,
                gap_ms,
            })
        })
        .collect();

    if breaks.is_empty() {
        Ok(())
    } else {
        Err(DataError::Continuity(ContinuityReport {
            timeframe: timeframe.to_string(),
            breaks,
        }))
    }
}

/// Trim every series to the window all of them cover.
///
/// The window is `[max of starts, min of ends]` over open times. Each output
/// series is sorted. Fails if any series is empty or the windows don't overlap.
pub fn synchronize_timeframes(
    series: HashMap<Timeframe, Vec<Kline>>,
) -> Result<HashMap<Timeframe, Vec<Kline>>> {
    if series.is_empty() {
        return Ok(series);
    }

    let mut start = i64::MIN;
    let mut end = i64::MAX;
    for (tf, bars) in &series {
        let first = bars.iter().map(|k| k.open_time).min();
        let last = bars.iter().map(|k| k.open_time).max();
        match (first, last) {
            (Some(first), Some(last)) => {
                start = start.max(first);
                end = end.min(last);
            }
            _ => return Err(DataError::EmptyInput(format!("{tf} series is empty"))),
        }
    }

    if start > end {
        return Err(DataError::NoCommonWindow);
    }

    Ok(series
        .into_iter()
        .map(|(tf, mut bars)| {
            bars.retain(|k| k.open_time >= start && k.open_time <= end);
            bars.sort_by_key(|k| k.open_time);
            (tf, bars)
        })
        .collect())
}
