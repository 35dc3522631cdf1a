//! Bounded-memory streaming over zipped CSV archives.
//!
//! Each archive must hold exactly one `.csv` member. Rows are parsed one at a
//! time into typed records and handed to a callback; nothing is accumulated
//! here. The first row is always treated as a header and skipped.
//!
//! A parse failure aborts the whole stream. There is no skip-and-continue
//! mode: a half-read file is a corrupt file.
//!
//! Memory metrics describe the current (or last) stream only; each stream
//! starts from a clean [`MemoryMetrics`].

use crate::config::StreamConfig;
use crate::data::error::{DataError, Result};
use crate::data::memory::{MemoryMetrics, MemoryProbe, ProcessMemoryProbe};
use crate::domain::{Kline, Trade};
use csv::StringRecord;
use std::fmt::Display;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use zip::ZipArchive;

/// Rows between releases of the reusable record buffer.
pub const RELEASE_INTERVAL_ROWS: usize = 1_000;

pub const KLINE_FIELD_COUNT: usize = 12;
pub const TRADE_FIELD_COUNT: usize = 6;

const KLINE_FIELDS: [&str; KLINE_FIELD_COUNT] = [
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "close_time",
    "quote_volume",
    "count",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "ignore",
];

const TRADE_FIELDS: [&str; TRADE_FIELD_COUNT] = [
    "id",
    "price",
    "qty",
    "quote_qty",
    "time",
    "is_buyer_maker",
];

/// Streams klines or trades out of an archive under a memory ceiling.
///
/// Streaming takes `&mut self`: one reader serves one stream at a time.
/// Use one reader per concurrent stream.
pub struct StreamingReader {
    config: StreamConfig,
    probe: Arc<dyn MemoryProbe>,
    metrics: MemoryMetrics,
}

impl StreamingReader {
    /// Reader sampling this process's resident memory.
    pub fn new(config: StreamConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcessMemoryProbe::new()))
    }

    pub fn with_probe(config: StreamConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config: config.resolve(),
            probe,
            metrics: MemoryMetrics::default(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Stream every kline row of the archive at `path` into `on_kline`.
    /// Returns the number of records delivered.
    pub fn stream_klines<F>(&mut self, path: &Path, mut on_kline: F) -> Result<usize>
    where
        F: FnMut(Kline) -> Result<()>,
    {
        self.stream_rows(path, KLINE_FIELD_COUNT, |row, record| {
            on_kline(parse_kline(row, record)?)
        })
    }

    /// Stream every trade row of the archive at `path` into `on_trade`.
    pub fn stream_trades<F>(&mut self, path: &Path, mut on_trade: F) -> Result<usize>
    where
        F: FnMut(Trade) -> Result<()>,
    {
        self.stream_rows(path, TRADE_FIELD_COUNT, |row, record| {
            on_trade(parse_trade(row, record)?)
        })
    }

    /// Current metrics snapshot.
    pub fn memory_metrics(&self) -> MemoryMetrics {
        self.metrics.clone()
    }

    /// Sample now and report whether usage is within the ceiling.
    /// Being over the ceiling is a `false`, not an error.
    pub fn validate_memory_constraints(&mut self) -> bool {
        let mb = self.metrics.record(self.probe.used_bytes());
        mb <= self.config.max_memory_mb as f64
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = MemoryMetrics::default();
    }

    fn stream_rows<F>(&mut self, path: &Path, min_fields: usize, mut on_row: F) -> Result<usize>
    where
        F: FnMut(usize, &StringRecord) -> Result<()>,
    {
        self.reset_metrics();
        let file = File::open(path).map_err(|e| DataError::io(path, e))?;
        let mut archive = ZipArchive::new(file).map_err(|e| archive_error(path, e))?;
        let (index, name) = locate_csv_member(&mut archive, path)?;
        let member = archive
            .by_index(index)
            .map_err(|e| archive_error(path, e))?;
        debug!(path = %path.display(), member = %name, "streaming archive member");

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .buffer_capacity(self.config.buffer_size)
            .from_reader(member);

        self.metrics.active_buffers += 1;
        let outcome = self.drive(&mut reader, min_fields, &mut on_row);
        self.metrics.active_buffers -= 1;

        match &outcome {
            Ok(rows) => debug!(
                path = %path.display(),
                rows,
                peak_mb = self.metrics.peak_mb,
                "finished streaming archive"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "streaming aborted"),
        }
        outcome
    }

    fn drive<R, F>(
        &mut self,
        reader: &mut csv::Reader<R>,
        min_fields: usize,
        on_row: &mut F,
    ) -> Result<usize>
    where
        R: Read,
        F: FnMut(usize, &StringRecord) -> Result<()>,
    {
        let mut record = StringRecord::new();
        let mut row = 0usize;

        loop {
            if self.config.enable_metrics {
                self.enforce_memory_limit()?;
            }

            let more = reader.read_record(&mut record).map_err(|e| DataError::Parse {
                row,
                field: "record",
                message: e.to_string(),
            })?;
            if !more {
                break;
            }

            if record.len() < min_fields {
                return Err(DataError::Parse {
                    row,
                    field: "record",
                    message: format!("expected {min_fields} fields, found {}", record.len()),
                });
            }

            on_row(row, &record)?;
            row += 1;

            if row % RELEASE_INTERVAL_ROWS == 0 {
                // Drop whatever capacity long rows grew the buffer to.
                record = StringRecord::new();
            }
        }

        Ok(row)
    }

    fn enforce_memory_limit(&mut self) -> Result<()> {
        let current_mb = self.metrics.record(self.probe.used_bytes());
        let limit_mb = self.config.max_memory_mb;
        if current_mb > limit_mb as f64 {
            return Err(DataError::MemoryLimitExceeded {
                current_mb,
                limit_mb,
            });
        }
        Ok(())
    }
}

/// Open an archive and confirm it holds exactly one CSV member.
/// Returns the member name.
pub fn verify_archive(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| DataError::io(path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| archive_error(path, e))?;
    locate_csv_member(&mut archive, path).map(|(_, name)| name)
}

fn locate_csv_member<R>(archive: &mut ZipArchive<R>, path: &Path) -> Result<(usize, String)>
where
    R: Read + std::io::Seek,
{
    let mut found = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| archive_error(path, e))?;
        if !entry.is_dir() && entry.name().to_ascii_lowercase().ends_with(".csv") {
            found.push((i, entry.name().to_string()));
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(DataError::Archive {
            path: path.to_path_buf(),
            message: "no .csv member".into(),
        }),
        n => Err(DataError::Archive {
            path: path.to_path_buf(),
            message: format!(
                "{n} .csv members ({}), expected exactly one",
                found
                    .iter()
                    .map(|(_, name)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }
}

fn archive_error(path: &Path, e: zip::result::ZipError) -> DataError {
    DataError::Archive {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

// ── Row parsing ─────────────────────────────────────────────────────

fn field<T>(record: &StringRecord, row: usize, index: usize, name: &'static str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = record.get(index).ok_or_else(|| DataError::Parse {
        row,
        field: name,
        message: "missing".into(),
    })?;
    raw.parse().map_err(|e| DataError::Parse {
        row,
        field: name,
        message: format!("'{raw}': {e}"),
    })
}

fn bool_field(record: &StringRecord, row: usize, index: usize, name: &'static str) -> Result<bool> {
    let raw = record.get(index).unwrap_or_default();
    match raw {
        "true" | "True" | "TRUE" => Ok(true),
        "false" | "False" | "FALSE" => Ok(false),
        other => Err(DataError::Parse {
            row,
            field: name,
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

/// Parse one kline row (12 fields; the last is ignored).
pub fn parse_kline(row: usize, record: &StringRecord) -> Result<Kline> {
    let f = &KLINE_FIELDS;
    Ok(Kline {
        open_time: field(record, row, 0, f[0])?,
        open: field(record, row, 1, f[1])?,
        high: field(record, row, 2, f[2])?,
        low: field(record, row, 3, f[3])?,
        close: field(record, row, 4, f[4])?,
        volume: field(record, row, 5, f[5])?,
        close_time: field(record, row, 6, f[6])?,
        quote_volume: field(record, row, 7, f[7])?,
        trade_count: field(record, row, 8, f[8])?,
        taker_buy_base_volume: field(record, row, 9, f[9])?,
        taker_buy_quote_volume: field(record, row, 10, f[10])?,
    })
}

/// Parse one trade row (6 fields).
pub fn parse_trade(row: usize, record: &StringRecord) -> Result<Trade> {
    let f = &TRADE_FIELDS;
    Ok(Trade {
        id: field(record, row, 0, f[0])?,
        price: field(record, row, 1, f[1])?,
        quantity: field(record, row, 2, f[2])?,
        quote_qty: field(record, row, 3, f[3])?,
        time: field(record, row, 4, f[4])?,
        is_buyer_maker: bool_field(record, row, 5, f[5])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::FixedMemoryProbe;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const KLINE_HEADER: &str = "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore";

    fn write_zip(dir: &Path, name: &str, members: &[(&str, &str)]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (member, body) in members {
            zip.start_file(*member, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    fn kline_csv(rows: usize) -> String {
        let mut body = String::from(KLINE_HEADER);
        body.push('\n');
        for i in 0..rows {
            let t = 1_704_067_200_000i64 + i as i64 * 60_000;
            body.push_str(&format!(
                "{t},100.0,101.0,99.5,100.5,12.0,{},1206.0,30,6.0,603.0,0\n",
                t + 59_999
            ));
        }
        body
    }

    fn reader_with(mb: u64, limit: u64) -> StreamingReader {
        StreamingReader::with_probe(
            StreamConfig {
                buffer_size: 1024,
                max_memory_mb: limit,
                enable_metrics: true,
            },
            Arc::new(FixedMemoryProbe::from_mb(mb)),
        )
    }

    #[test]
    fn streams_klines_skipping_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "k.zip", &[("BTCUSDT-1m-2024-01-01.csv", &kline_csv(3))]);

        let mut reader = reader_with(10, 100);
        let mut seen = Vec::new();
        let rows = reader
            .stream_klines(&path, |k| {
                seen.push(k);
                Ok(())
            })
            .unwrap();

        assert_eq!(rows, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].open_time, 1_704_067_200_000);
        assert_eq!(seen[2].close_time, 1_704_067_200_000 + 2 * 60_000 + 59_999);
        assert_eq!(seen[1].trade_count, 30);
        assert_eq!(reader.memory_metrics().active_buffers, 0);
    }

    #[test]
    fn streams_trades() {
        let dir = tempfile::tempdir().unwrap();
        let body = "id,price,qty,quote_qty,time,is_buyer_maker\n\
                    1,42000.5,0.002,84.001,1704067200123,true\n\
                    2,42001.0,0.5,21000.5,1704067200456,False\n";
        let path = write_zip(dir.path(), "t.zip", &[("BTCUSDT-trades-2024-01-01.csv", body)]);

        let mut reader = reader_with(10, 100);
        let mut trades = Vec::new();
        reader
            .stream_trades(&path, |t| {
                trades.push(t);
                Ok(())
            })
            .unwrap();

        assert_eq!(trades.len(), 2);
        assert!(trades[0].is_buyer_maker);
        assert!(!trades[1].is_buyer_maker);
        assert_eq!(trades[1].id, 2);
    }

    #[test]
    fn bad_field_names_row_and_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = kline_csv(2);
        body.push_str("1704067380000,abc,101.0,99.5,100.5,12.0,1704067439999,1206.0,30,6.0,603.0,0\n");
        let path = write_zip(dir.path(), "bad.zip", &[("bad.csv", &body)]);

        let mut reader = reader_with(10, 100);
        let mut count = 0;
        let err = reader
            .stream_klines(&path, |_| {
                count += 1;
                Ok(())
            })
            .unwrap_err();

        match err {
            DataError::Parse { row, field, .. } => {
                assert_eq!(row, 2);
                assert_eq!(field, "open");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn short_row_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{KLINE_HEADER}\n1704067200000,100.0,101.0\n");
        let path = write_zip(dir.path(), "short.zip", &[("short.csv", &body)]);

        let err = reader_with(10, 100).stream_klines(&path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, DataError::Parse { row: 0, field: "record", .. }));
    }

    #[test]
    fn aborts_when_over_memory_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "k.zip", &[("k.csv", &kline_csv(5))]);

        let mut reader = reader_with(512, 100);
        let mut delivered = 0;
        let err = reader
            .stream_klines(&path, |_| {
                delivered += 1;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, DataError::MemoryLimitExceeded { limit_mb: 100, .. }));
        assert_eq!(delivered, 0);
        assert_eq!(reader.memory_metrics().peak_mb, 512.0);
    }

    #[test]
    fn each_stream_starts_with_fresh_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "k.zip", &[("k.csv", &kline_csv(3))]);

        let probe = Arc::new(FixedMemoryProbe::from_mb(90));
        let mut reader = StreamingReader::with_probe(
            StreamConfig {
                buffer_size: 1024,
                max_memory_mb: 100,
                enable_metrics: true,
            },
            probe.clone(),
        );
        assert_eq!(reader.stream_klines(&path, |_| Ok(())).unwrap(), 3);
        assert_eq!(reader.memory_metrics().peak_mb, 90.0);

        // No reset_metrics in between: the earlier peak must not leak through.
        probe.set_mb(20);
        assert_eq!(reader.stream_klines(&path, |_| Ok(())).unwrap(), 3);
        let metrics = reader.memory_metrics();
        assert_eq!(metrics.peak_mb, 20.0);
        assert_eq!(metrics.current_mb, 20.0);
        assert_eq!(metrics.active_buffers, 0);
    }

    #[test]
    fn metrics_disabled_ignores_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "k.zip", &[("k.csv", &kline_csv(2))]);

        let mut reader = StreamingReader::with_probe(
            StreamConfig {
                buffer_size: 0,
                max_memory_mb: 1,
                enable_metrics: false,
            },
            Arc::new(FixedMemoryProbe::from_mb(512)),
        );
        assert_eq!(reader.stream_klines(&path, |_| Ok(())).unwrap(), 2);
        assert!(reader.memory_metrics().last_sample.is_none());
    }

    #[test]
    fn callback_error_stops_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "k.zip", &[("k.csv", &kline_csv(10))]);

        let mut calls = 0;
        let err = reader_with(10, 100)
            .stream_klines(&path, |_| {
                calls += 1;
                if calls == 3 {
                    return Err(DataError::EmptyInput("stop".into()));
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, DataError::EmptyInput(_)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn large_member_crosses_release_interval() {
        let dir = tempfile::tempdir().unwrap();
        let rows = RELEASE_INTERVAL_ROWS * 2 + 7;
        let path = write_zip(dir.path(), "big.zip", &[("big.csv", &kline_csv(rows))]);
        assert_eq!(reader_with(10, 100).stream_klines(&path, |_| Ok(())).unwrap(), rows);
    }

    #[test]
    fn archive_member_rules() {
        let dir = tempfile::tempdir().unwrap();
        let none = write_zip(dir.path(), "none.zip", &[("readme.txt", "hi")]);
        let two = write_zip(dir.path(), "two.zip", &[("a.csv", "x"), ("b.csv", "y")]);
        let one = write_zip(dir.path(), "one.zip", &[("notes.txt", "n"), ("data.CSV", "x")]);

        assert!(matches!(verify_archive(&none), Err(DataError::Archive { .. })));
        let err = verify_archive(&two).unwrap_err().to_string();
        assert!(err.contains("expected exactly one"), "{err}");
        assert_eq!(verify_archive(&one).unwrap(), "data.CSV");
    }

    #[test]
    fn not_a_zip_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.zip");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        let err = reader_with(10, 100).stream_trades(&path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, DataError::Archive { .. }));
    }

    #[test]
    fn validate_memory_constraints_reports_without_error() {
        let probe = Arc::new(FixedMemoryProbe::from_mb(50));
        let mut reader = StreamingReader::with_probe(
            StreamConfig {
                buffer_size: 0,
                max_memory_mb: 100,
                enable_metrics: true,
            },
            probe.clone(),
        );
        assert!(reader.validate_memory_constraints());
        probe.set_mb(150);
        assert!(!reader.validate_memory_constraints());
        assert_eq!(reader.memory_metrics().peak_mb, 150.0);

        reader.reset_metrics();
        assert_eq!(reader.memory_metrics(), MemoryMetrics::default());
    }
}
