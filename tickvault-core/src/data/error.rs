//! Structured error types for the data engine.
//!
//! Variants fall into five families: request validation (no I/O attempted),
//! integrity, transient I/O, parse, and continuity. Every I/O variant carries
//! the path or URL it failed on.

use crate::domain::{UnknownDataKind, UnsupportedTimeframe};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Debug, Error)]
pub enum DataError {
    // ── Request validation ──────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    UnsupportedTimeframe(#[from] UnsupportedTimeframe),

    #[error(transparent)]
    UnknownDataKind(#[from] UnknownDataKind),

    #[error("empty input: {0}")]
    EmptyInput(String),

    // ── Integrity ───────────────────────────────────────────────────
    #[error("path is not registered in the cache index: {}", path.display())]
    NotIndexed { path: PathBuf },

    // ── Transient I/O ───────────────────────────────────────────────
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("download of {url} failed after {attempts} attempt(s): {last_error}")]
    DownloadFailed {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("index serialization error: {0}")]
    Serialization(String),

    // ── Parse ───────────────────────────────────────────────────────
    #[error("archive error in {}: {message}", path.display())]
    Archive { path: PathBuf, message: String },

    #[error("parse error at row {row}, field '{field}': {message}")]
    Parse {
        row: usize,
        field: &'static str,
        message: String,
    },

    #[error("memory limit exceeded: {current_mb:.1} MB in use, limit {limit_mb} MB")]
    MemoryLimitExceeded { current_mb: f64, limit_mb: u64 },

    // ── Continuity ──────────────────────────────────────────────────
    #[error("{0}")]
    Continuity(ContinuityReport),

    #[error("series do not share a common time window")]
    NoCommonWindow,

    #[error("configuration error: {0}")]
    Config(String),
}

impl DataError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DataError::Io { .. } | DataError::Network { .. } | DataError::Archive { .. } => true,
            DataError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }
}

/// One discontinuity between two adjacent bars of a sorted series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuityBreak {
    pub prev_index: usize,
    pub index: usize,
    /// Actual open time minus expected open time. Negative means overlap.
    pub gap_ms: i64,
}

/// All breaks found in one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuityReport {
    pub timeframe: String,
    pub breaks: Vec<ContinuityBreak>,
}

impl fmt::Display for ContinuityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} continuity break(s) in {} series",
            self.breaks.len(),
            self.timeframe
        )?;
        for b in &self.breaks {
            let kind = if b.gap_ms < 0 { "overlap" } else { "gap" };
            write!(
                f,
                "; {kind} between bars {} and {}: {} ms",
                b.prev_index, b.index, b.gap_ms
            )?;
        }
        Ok(())
    }
}
