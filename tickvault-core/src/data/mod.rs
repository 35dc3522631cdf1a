//! Data engine: archive cache, downloader, streaming reader, batches,
//! validation and timeframe aggregation.

pub mod aggregate;
pub mod batch;
pub mod cache;
pub mod download;
pub mod error;
pub mod memory;
pub mod stream;
pub mod validate;

pub use aggregate::{aggregate_klines, aggregate_trades, synchronize_timeframes, validate_continuity};
pub use batch::{batch_statistics, BatchRecords, ParsedDataBatch, ParsedDataProcessor};
pub use cache::{
    file_checksum, index_key, CacheManager, CacheStatistics, CleanupReport, FileMetadata,
    IntegrityStatus,
};
pub use download::{DownloadRequest, DownloadResult, Downloader};
pub use error::{ContinuityBreak, ContinuityReport, DataError, Result};
pub use memory::{FixedMemoryProbe, MemoryMetrics, MemoryProbe, ProcessMemoryProbe};
pub use stream::{verify_archive, StreamingReader};
pub use validate::{validate_batch, DataValidationResult};
