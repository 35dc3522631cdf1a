//! Kline — one OHLCV bar as published in the exchange's historical archives.

use serde::{Deserialize, Serialize};

/// OHLCV bar with exchange-side volume breakdown.
///
/// Times are epoch milliseconds. `close_time` is the last millisecond covered
/// by the bar, so a 1m bar opening at `t` closes at `t + 59_999`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Kline {
    /// Basic OHLCV sanity: `low <= {open, close} <= high`, positive prices,
    /// non-negative volumes, `open_time < close_time`.
    pub fn is_sane(&self) -> bool {
        self.open > 0.0
            && self.close > 0.0
            && self.low > 0.0
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
            && self.quote_volume >= 0.0
            && self.taker_buy_base_volume >= 0.0
            && self.taker_buy_quote_volume >= 0.0
            && self.open_time < self.close_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Kline {
        Kline {
            open_time: 1_704_067_200_000,
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: 12.5,
            close_time: 1_704_067_259_999,
            quote_volume: 1_280.0,
            trade_count: 42,
            taker_buy_base_volume: 6.0,
            taker_buy_quote_volume: 615.0,
        }
    }

    #[test]
    fn sample_is_sane() {
        assert!(sample().is_sane());
    }

    #[test]
    fn inverted_range_is_not_sane() {
        let mut k = sample();
        k.high = 97.0;
        assert!(!k.is_sane());
    }

    #[test]
    fn reversed_times_are_not_sane() {
        let mut k = sample();
        k.close_time = k.open_time;
        assert!(!k.is_sane());
    }
}
