//! Parsed batches and the processor that builds them.
//!
//! A batch is one archive's worth of records for one (symbol, kind, date
//! [, timeframe]). It is built once and never mutated afterwards; statistics
//! and validation are derived views.

use crate::config::{StreamConfig, ValidationConfig};
use crate::data::error::{DataError, Result};
use crate::data::stream::StreamingReader;
use crate::data::validate::{self, DataValidationResult};
use crate::domain::{DataKind, Kline, Timeframe, Trade};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// The records of a batch, by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchRecords {
    Klines(Vec<Kline>),
    Trades(Vec<Trade>),
}

impl BatchRecords {
    pub fn len(&self) -> usize {
        match self {
            BatchRecords::Klines(k) => k.len(),
            BatchRecords::Trades(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable parse result for one archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDataBatch {
    symbol: String,
    kind: DataKind,
    date: String,
    timeframe: Option<Timeframe>,
    records: BatchRecords,
    start_time: i64,
    end_time: i64,
    processed_at: DateTime<Utc>,
}

impl ParsedDataBatch {
    /// Bounds are the earliest open time and the latest close time.
    pub fn from_klines(
        symbol: impl Into<String>,
        date: impl Into<String>,
        timeframe: Timeframe,
        klines: Vec<Kline>,
    ) -> Self {
        let mut bounds = TimeBounds::default();
        for k in &klines {
            bounds.observe(k.open_time, k.close_time);
        }
        Self::build(
            symbol.into(),
            DataKind::Klines,
            date.into(),
            Some(timeframe),
            BatchRecords::Klines(klines),
            bounds,
        )
    }

    /// Bounds are the earliest and latest trade time.
    pub fn from_trades(symbol: impl Into<String>, date: impl Into<String>, trades: Vec<Trade>) -> Self {
        let mut bounds = TimeBounds::default();
        for t in &trades {
            bounds.observe(t.time, t.time);
        }
        Self::build(
            symbol.into(),
            DataKind::Trades,
            date.into(),
            None,
            BatchRecords::Trades(trades),
            bounds,
        )
    }

    fn build(
        symbol: String,
        kind: DataKind,
        date: String,
        timeframe: Option<Timeframe>,
        records: BatchRecords,
        bounds: TimeBounds,
    ) -> Self {
        let (start_time, end_time) = bounds.finish();
        Self {
            symbol,
            kind,
            date,
            timeframe,
            records,
            start_time,
            end_time,
            processed_at: Utc::now(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        self.timeframe
    }

    pub fn records(&self) -> &BatchRecords {
        &self.records
    }

    pub fn klines(&self) -> Option<&[Kline]> {
        match &self.records {
            BatchRecords::Klines(k) => Some(k),
            BatchRecords::Trades(_) => None,
        }
    }

    pub fn trades(&self) -> Option<&[Trade]> {
        match &self.records {
            BatchRecords::Trades(t) => Some(t),
            BatchRecords::Klines(_) => None,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Earliest time covered; 0 for an empty batch.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Latest time covered; 0 for an empty batch.
    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }

    /// Release the records, consuming the batch.
    pub fn into_records(self) -> BatchRecords {
        self.records
    }
}

/// Running min/max over record times.
#[derive(Debug, Default, Clone, Copy)]
struct TimeBounds {
    start: Option<i64>,
    end: Option<i64>,
}

impl TimeBounds {
    fn observe(&mut self, start: i64, end: i64) {
        self.start = Some(self.start.map_or(start, |s| s.min(start)));
        self.end = Some(self.end.map_or(end, |e| e.max(end)));
    }

    fn finish(self) -> (i64, i64) {
        (self.start.unwrap_or(0), self.end.unwrap_or(0))
    }
}

/// Drives a [`StreamingReader`] into batches and validates them.
pub struct ParsedDataProcessor {
    reader: StreamingReader,
    validation: ValidationConfig,
}

impl ParsedDataProcessor {
    pub fn new(stream: StreamConfig, validation: ValidationConfig) -> Self {
        Self::with_reader(StreamingReader::new(stream), validation)
    }

    pub fn with_reader(reader: StreamingReader, validation: ValidationConfig) -> Self {
        Self {
            reader,
            validation: validation.resolve(),
        }
    }

    pub fn reader(&self) -> &StreamingReader {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut StreamingReader {
        &mut self.reader
    }

    pub fn validation_config(&self) -> &ValidationConfig {
        &self.validation
    }

    /// Stream a kline archive into a batch.
    pub fn parse_klines_batch(
        &mut self,
        path: &Path,
        symbol: &str,
        timeframe: &str,
        date: &str,
    ) -> Result<ParsedDataBatch> {
        require(path.as_os_str().is_empty(), "path")?;
        require(symbol.trim().is_empty(), "symbol")?;
        require(timeframe.trim().is_empty(), "timeframe")?;
        require(date.trim().is_empty(), "date")?;
        let timeframe: Timeframe = timeframe.parse()?;

        let mut klines = Vec::new();
        self.reader.stream_klines(path, |k| {
            klines.push(k);
            Ok(())
        })?;

        let batch = ParsedDataBatch::from_klines(symbol, date, timeframe, klines);
        info!(
            symbol,
            timeframe = %timeframe,
            date,
            records = batch.record_count(),
            "parsed kline batch"
        );
        Ok(batch)
    }

    /// Stream a trade archive into a batch.
    pub fn parse_trades_batch(&mut self, path: &Path, symbol: &str, date: &str) -> Result<ParsedDataBatch> {
        require(path.as_os_str().is_empty(), "path")?;
        require(symbol.trim().is_empty(), "symbol")?;
        require(date.trim().is_empty(), "date")?;

        let mut trades = Vec::new();
        self.reader.stream_trades(path, |t| {
            trades.push(t);
            Ok(())
        })?;

        let batch = ParsedDataBatch::from_trades(symbol, date, trades);
        info!(symbol, date, records = batch.record_count(), "parsed trade batch");
        Ok(batch)
    }

    /// Parse a kline archive and validate the result in one step.
    pub fn parse_and_validate_klines(
        &mut self,
        path: &Path,
        symbol: &str,
        timeframe: &str,
        date: &str,
    ) -> Result<(ParsedDataBatch, DataValidationResult)> {
        let batch = self.parse_klines_batch(path, symbol, timeframe, date)?;
        let result = self.validate_batch(&batch);
        Ok((batch, result))
    }

    pub fn validate_batch(&self, batch: &ParsedDataBatch) -> DataValidationResult {
        validate::validate_batch(batch, &self.validation)
    }

    pub fn batch_statistics(&self, batch: &ParsedDataBatch) -> BTreeMap<String, f64> {
        batch_statistics(batch)
    }
}

fn require(missing: bool, name: &str) -> Result<()> {
    if missing {
        return Err(DataError::InvalidRequest(format!("{name} must not be empty")));
    }
    Ok(())
}

/// Derived figures for a batch. Empty batches report only `record_count`.
///
/// Keys: `record_count`, `min_price`, `max_price`, `price_range`,
/// `total_volume`, `total_quote_volume`, plus `avg_trades_per_bar` for klines
/// or `buyer_maker_ratio` for trades.
pub fn batch_statistics(batch: &ParsedDataBatch) -> BTreeMap<String, f64> {
    let mut stats = BTreeMap::new();
    let n = batch.record_count();
    stats.insert("record_count".to_string(), n as f64);
    if n == 0 {
        return stats;
    }

    let (min_price, max_price, volume, quote_volume) = match batch.records() {
        BatchRecords::Klines(klines) => {
            let trades: u64 = klines.iter().map(|k| k.trade_count).sum();
            stats.insert("avg_trades_per_bar".to_string(), trades as f64 / n as f64);
            (
                klines.iter().map(|k| k.low).fold(f64::INFINITY, f64::min),
                klines.iter().map(|k| k.high).fold(f64::NEG_INFINITY, f64::max),
                klines.iter().map(|k| k.volume).sum::<f64>(),
                klines.iter().map(|k| k.quote_volume).sum::<f64>(),
            )
        }
        BatchRecords::Trades(trades) => {
            let makers = trades.iter().filter(|t| t.is_buyer_maker).count();
            stats.insert("buyer_maker_ratio".to_string(), makers as f64 / n as f64);
            (
                trades.iter().map(|t| t.price).fold(f64::INFINITY, f64::min),
                trades.iter().map(|t| t.price).fold(f64::NEG_INFINITY, f64::max),
                trades.iter().map(|t| t.quantity).sum::<f64>(),
                trades.iter().map(|t| t.quote_qty).sum::<f64>(),
            )
        }
    };

    stats.insert("min_price".to_string(), min_price);
    stats.insert("max_price".to_string(), max_price);
    stats.insert("price_range".to_string(), max_price - min_price);
    stats.insert("total_volume".to_string(), volume);
    stats.insert("total_quote_volume".to_string(), quote_volume);
    stats
}
