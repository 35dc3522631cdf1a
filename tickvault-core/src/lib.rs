//! TickVault Core — local market-data engine for exchange archive files.
//!
//! This crate contains:
//! - Domain types (klines, trades, timeframes)
//! - Archive cache with a persistent, integrity-checked index
//! - HTTP downloader with retries and a parallel batch mode
//! - Memory-governed streaming reader for zipped CSV archives
//! - Parsed batches, batch validation and statistics
//! - Timeframe aggregation, continuity checks and multi-timeframe alignment

pub mod config;
pub mod data;
pub mod domain;
pub mod logging;
