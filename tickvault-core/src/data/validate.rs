//! Batch validation rules.
//!
//! Hard errors (broken invariants, time going backwards) make a batch invalid.
//! Soft findings (large gaps, large price or volume moves) are collected as
//! warnings; callers decide whether those block downstream use.

use crate::config::ValidationConfig;
use crate::data::batch::{BatchRecords, ParsedDataBatch};
use crate::domain::{Kline, Trade};
use serde::Serialize;

/// Outcome of validating exactly one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub error_count: usize,
    pub warning_count: usize,
}

impl DataValidationResult {
    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn warn(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn finish(mut self) -> Self {
        self.error_count = self.errors.len();
        self.warning_count = self.warnings.len();
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// Run the rule set matching the batch's kind.
pub fn validate_batch(batch: &ParsedDataBatch, config: &ValidationConfig) -> DataValidationResult {
    let config = config.clone().resolve();
    let mut result = DataValidationResult::default();

    if batch.record_count() == 0 {
        result.warn(format!(
            "{} {} batch for {} contains no records",
            batch.symbol(),
            batch.kind(),
            batch.date()
        ));
    }

    match batch.records() {
        BatchRecords::Klines(klines) => validate_klines(klines, &config, &mut result),
        BatchRecords::Trades(trades) => validate_trades(trades, &config, &mut result),
    }

    result.finish()
}

fn validate_klines(klines: &[Kline], config: &ValidationConfig, result: &mut DataValidationResult) {
    for (i, k) in klines.iter().enumerate() {
        let reported = result.errors.len();
        if k.open_time >= k.close_time {
            result.error(format!(
                "kline {i}: open time {} is not before close time {}",
                k.open_time, k.close_time
            ));
        }
        if k.high < k.low {
            result.error(format!("kline {i}: high {} is below low {}", k.high, k.low));
        } else if [k.open, k.close].iter().any(|&p| p < k.low || p > k.high) {
            result.error(format!(
                "kline {i}: open {} / close {} outside range [{}, {}]",
                k.open, k.close, k.low, k.high
            ));
        }
        if k.open <= 0.0 || k.high <= 0.0 || k.low <= 0.0 || k.close <= 0.0 {
            result.error(format!(
                "kline {i}: non-positive price (o={}, h={}, l={}, c={})",
                k.open, k.high, k.low, k.close
            ));
        }
        if k.volume < 0.0 {
            result.error(format!("kline {i}: negative volume {}", k.volume));
        }
        // Anything else the bar-level check rejects, e.g. negative quote volume.
        if result.errors.len() == reported && !k.is_sane() {
            result.error(format!("kline {i}: inconsistent bar {k:?}"));
        }

        let Some(prev) = i.checked_sub(1).map(|p| &klines[p]) else {
            continue;
        };

        if config.require_monotonic_time && k.open_time <= prev.open_time {
            result.error(format!(
                "kline {i}: open time {} does not advance past previous {}",
                k.open_time, prev.open_time
            ));
        }

        let gap = k.open_time - prev.close_time;
        if gap > config.max_time_gap_ms {
            result.warn(format!(
                "kline {i}: {gap} ms gap after previous bar (max {} ms)",
                config.max_time_gap_ms
            ));
        }

        if let Some(pct) = deviation_pct(prev.close, k.close) {
            if pct > config.max_price_deviation_pct {
                result.warn(format!(
                    "kline {i}: close moved {pct:.2}% from previous close (max {}%)",
                    config.max_price_deviation_pct
                ));
            }
        }

        if let Some(pct) = deviation_pct(prev.volume, k.volume) {
            if pct > config.max_volume_deviation_pct {
                result.warn(format!(
                    "kline {i}: volume moved {pct:.2}% from previous bar (max {}%)",
                    config.max_volume_deviation_pct
                ));
            }
        }
    }
}

fn validate_trades(trades: &[Trade], config: &ValidationConfig, result: &mut DataValidationResult) {
    for (i, t) in trades.iter().enumerate() {
        if t.price <= 0.0 {
            result.error(format!("trade {i}: non-positive price {}", t.price));
        }
        if t.quantity <= 0.0 {
            result.error(format!("trade {i}: non-positive quantity {}", t.quantity));
        }
        if t.time <= 0 {
            result.error(format!("trade {i}: non-positive timestamp {}", t.time));
        }
        if t.price > 0.0 && t.quantity > 0.0 && !t.quote_qty_consistent() {
            result.warn(format!(
                "trade {i}: quote quantity {} differs from price x quantity {}",
                t.quote_qty,
                t.price * t.quantity
            ));
        }

        let Some(prev) = i.checked_sub(1).map(|p| &trades[p]) else {
            continue;
        };

        if config.require_monotonic_time && t.time < prev.time {
            result.error(format!(
                "trade {i}: time {} is before previous trade time {}",
                t.time, prev.time
            ));
        }

        if let Some(pct) = deviation_pct(prev.price, t.price) {
            if pct > config.max_price_deviation_pct {
                result.warn(format!(
                    "trade {i}: price moved {pct:.2}% from previous trade (max {}%)",
                    config.max_price_deviation_pct
                ));
            }
        }
    }
}

/// Absolute percentage change from `base`, or `None` when `base` is not positive.
fn deviation_pct(base: f64, value: f64) -> Option<f64> {
    (base > 0.0).then(|| (value - base).abs() / base * 100.0)
}
