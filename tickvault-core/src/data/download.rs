//! Downloader — fetches daily archives into the cache.
//!
//! Each download goes to a `.part` file next to its final location, is checked
//! for a single CSV member, hashed, renamed into place and only then registered
//! in the index. Requests are validated before any network I/O.
//!
//! Calls for the same key are serialized: a caller that waited on another one
//! re-checks the cache and gets a hit instead of fetching again. Every attempt
//! writes to its own `.part` name, so processes sharing a cache root never
//! truncate each other's partial files.

use crate::config::DownloadConfig;
use crate::data::cache::{self, index_key, CacheManager, FileMetadata};
use crate::data::error::{DataError, Result};
use crate::data::stream::verify_archive;
use crate::domain::{DataKind, Timeframe};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("tickvault/", env!("CARGO_PKG_VERSION"));

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique partial-download path next to `target`.
fn part_path(target: &Path) -> PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    target.with_extension(format!("zip.{}-{seq}.part", std::process::id()))
}

/// One archive to fetch: (symbol, kind, date[, timeframe]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadRequest {
    pub symbol: String,
    pub kind: DataKind,
    pub date: String,
    pub timeframe: Option<Timeframe>,
}

impl DownloadRequest {
    pub fn klines(symbol: impl Into<String>, timeframe: Timeframe, date: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: DataKind::Klines,
            date: date.into(),
            timeframe: Some(timeframe),
        }
    }

    pub fn trades(symbol: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: DataKind::Trades,
            date: date.into(),
            timeframe: None,
        }
    }

    /// Build a request from untyped parts, rejecting unknown kinds and timeframes.
    pub fn parse(symbol: &str, kind: &str, date: &str, timeframe: Option<&str>) -> Result<Self> {
        let kind: DataKind = kind.parse()?;
        let timeframe = timeframe
            .filter(|tf| !tf.trim().is_empty())
            .map(str::parse::<Timeframe>)
            .transpose()?;
        let request = Self {
            symbol: symbol.to_string(),
            kind,
            date: date.to_string(),
            timeframe,
        };
        request.validate()?;
        Ok(request)
    }

    /// Reject malformed requests. No I/O.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(DataError::InvalidRequest("symbol must not be empty".into()));
        }
        if NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err() {
            return Err(DataError::InvalidRequest(format!(
                "date '{}' is not YYYY-MM-DD",
                self.date
            )));
        }
        match (self.kind, self.timeframe) {
            (DataKind::Klines, None) => Err(DataError::InvalidRequest(
                "klines request requires a timeframe".into(),
            )),
            (DataKind::Trades, Some(tf)) => Err(DataError::InvalidRequest(format!(
                "trades request must not carry a timeframe (got {tf})"
            ))),
            _ => Ok(()),
        }
    }

    /// Stable string identifying this request; same as its index key.
    pub fn canonical_key(&self) -> String {
        index_key(&self.symbol, self.kind, &self.date, self.timeframe)
    }
}

/// Outcome of one download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub key: String,
    pub success: bool,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub duration: Duration,
    pub attempts: u32,
    pub from_cache: bool,
    pub error: Option<String>,
}

impl DownloadResult {
    fn completed(meta: &FileMetadata, started: Instant, attempts: u32, from_cache: bool) -> Self {
        Self {
            key: meta.key(),
            success: true,
            path: meta.path.clone(),
            size: meta.size,
            checksum: meta.checksum.clone(),
            duration: started.elapsed(),
            attempts,
            from_cache,
            error: None,
        }
    }

    fn failed(key: String, path: PathBuf, started: Instant, error: &DataError) -> Self {
        let attempts = match error {
            DataError::DownloadFailed { attempts, .. } => *attempts,
            _ => 0,
        };
        Self {
            key,
            success: false,
            path,
            size: 0,
            checksum: String::new(),
            duration: started.elapsed(),
            attempts,
            from_cache: false,
            error: Some(error.to_string()),
        }
    }
}

/// Fetches archives over HTTP and registers them with a [`CacheManager`].
pub struct Downloader {
    config: DownloadConfig,
    cache: Arc<CacheManager>,
    client: reqwest::blocking::Client,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Downloader {
    pub fn new(config: DownloadConfig, cache: Arc<CacheManager>) -> Result<Self> {
        let config = config.resolve();
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DataError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            cache,
            client,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Fetch one archive unless a verified copy is already on disk.
    pub fn download_file(&self, request: &DownloadRequest) -> Result<DownloadResult> {
        request.validate()?;
        let started = Instant::now();

        if let Some(meta) = self.cached_entry(request) {
            debug!(key = %meta.key(), "cache hit");
            return Ok(DownloadResult::completed(&meta, started, 0, true));
        }

        let key = request.canonical_key();
        let slot = self.key_lock(&key);
        let outcome = {
            let _held = slot.lock().unwrap_or_else(|e| e.into_inner());
            self.download_locked(request, started)
        };
        self.release_key(&key, slot);
        outcome
    }

    /// Download many archives on a pool of `max_concurrent_downloads` threads.
    ///
    /// Failures are reported per request rather than aborting the batch.
    /// Results come back in request order; repeated requests share one fetch.
    pub fn download_batch(&self, requests: &[DownloadRequest]) -> Result<Vec<DownloadResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_concurrent_downloads)
            .thread_name(|i| format!("tickvault-dl-{i}"))
            .build()
            .map_err(|e| DataError::Config(format!("failed to build download pool: {e}")))?;

        let mut seen = HashSet::new();
        let unique: Vec<&DownloadRequest> = requests
            .iter()
            .filter(|r| seen.insert(r.canonical_key()))
            .collect();

        let fetched: HashMap<String, DownloadResult> = pool.install(|| {
            unique
                .par_iter()
                .map(|request| {
                    let started = Instant::now();
                    let key = request.canonical_key();
                    let result = self.download_file(request).unwrap_or_else(|e| {
                        warn!(key = %key, error = %e, "download failed");
                        DownloadResult::failed(key.clone(), self.cached_file_path(request), started, &e)
                    });
                    (key, result)
                })
                .collect()
        });

        let results: Vec<DownloadResult> = requests
            .iter()
            .filter_map(|r| fetched.get(&r.canonical_key()).cloned())
            .collect();

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            total = results.len(),
            unique = fetched.len(),
            failed,
            "batch download complete"
        );
        Ok(results)
    }

    /// Source URL for a request. Markets like `futures-um` map to `futures/um`.
    pub fn download_url(&self, request: &DownloadRequest) -> String {
        let market = self.cache.config().market.replace('-', "/");
        let symbol = &request.symbol;
        let date = &request.date;
        match (request.kind, request.timeframe) {
            (DataKind::Klines, Some(tf)) => format!(
                "{}/data/{market}/daily/klines/{symbol}/{tf}/{symbol}-{tf}-{date}.zip",
                self.config.base_url
            ),
            (kind, _) => format!(
                "{}/data/{market}/daily/{kind}/{symbol}/{symbol}-{kind}-{date}.zip",
                self.config.base_url
            ),
        }
    }

    pub fn check_file_exists(&self, request: &DownloadRequest) -> bool {
        self.cache
            .file_exists(&request.symbol, request.kind, &request.date, request.timeframe)
    }

    pub fn cached_file_path(&self, request: &DownloadRequest) -> PathBuf {
        self.cache
            .file_path(&request.symbol, request.kind, &request.date, request.timeframe)
    }

    /// True when the cached file still matches its recorded size and checksum.
    pub fn validate_checksum_file(&self, request: &DownloadRequest) -> Result<bool> {
        let path = self
            .cache
            .get_metadata(&request.symbol, request.kind, &request.date, request.timeframe)
            .map(|m| m.path)
            .unwrap_or_else(|| self.cached_file_path(request));
        Ok(!self.cache.is_file_corrupted(&path)?)
    }

    /// Presence of each request in the cache, keyed by [`DownloadRequest::canonical_key`].
    pub fn batch_exists(&self, requests: &[DownloadRequest]) -> HashMap<String, bool> {
        requests
            .iter()
            .map(|r| (r.canonical_key(), self.check_file_exists(r)))
            .collect()
    }

    fn cached_entry(&self, request: &DownloadRequest) -> Option<FileMetadata> {
        if !self.check_file_exists(request) {
            return None;
        }
        self.cache
            .get_metadata(&request.symbol, request.kind, &request.date, request.timeframe)
            .filter(|m| m.verified)
    }

    /// Body of [`Self::download_file`] once the key is held.
    fn download_locked(&self, request: &DownloadRequest, started: Instant) -> Result<DownloadResult> {
        if let Some(meta) = self.cached_entry(request) {
            debug!(key = %meta.key(), "cache hit after waiting on in-flight download");
            return Ok(DownloadResult::completed(&meta, started, 0, true));
        }

        let url = self.download_url(request);
        let target = self.cached_file_path(request);
        let (meta, attempts) = self.fetch_with_retry(request, &url, &target)?;
        self.cache.update_index(meta.clone())?;

        info!(
            key = %meta.key(),
            size = meta.size,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "downloaded archive"
        );
        Ok(DownloadResult::completed(&meta, started, attempts, false))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(in_flight.entry(key.to_string()).or_default())
    }

    /// Drop the key's slot once no other caller holds or waits on it.
    fn release_key(&self, key: &str, slot: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&slot) == 2 {
            in_flight.remove(key);
        }
    }

    fn fetch_with_retry(
        &self,
        request: &DownloadRequest,
        url: &str,
        target: &Path,
    ) -> Result<(FileMetadata, u32)> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| DataError::io(parent, e))?;
        }
        let max_attempts = self.config.max_retries + 1;
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            if attempts > 0 {
                std::thread::sleep(self.config.retry_delay() * attempts);
            }
            attempts += 1;

            let part = part_path(target);
            let outcome = self.fetch_once(request, url, &part, target);
            cache::remove_if_present(&part)?;
            match outcome {
                Ok(meta) => return Ok((meta, attempts)),
                Err(e) => {
                    let permanent = !e.is_transient();
                    warn!(url, attempt = attempts, error = %e, permanent, "download attempt failed");
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
        }

        Err(DataError::DownloadFailed {
            url: url.to_string(),
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// One GET into `part`, then verify, hash and move into place.
    fn fetch_once(
        &self,
        request: &DownloadRequest,
        url: &str,
        part: &Path,
        target: &Path,
    ) -> Result<FileMetadata> {
        let mut resp = self.client.get(url).send().map_err(|e| DataError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DataError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let file = File::create(part).map_err(|e| DataError::io(part, e))?;
        let mut writer = BufWriter::new(file);
        let size = resp.copy_to(&mut writer).map_err(|e| DataError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        writer.flush().map_err(|e| DataError::io(part, e))?;
        drop(writer);

        let member = verify_archive(part)?;
        let checksum = if self.config.verify_checksum {
            cache::file_checksum(part)?
        } else {
            String::new()
        };
        fs::rename(part, target).map_err(|e| DataError::io(target, e))?;
        debug!(url, member = %member, size, "archive written");

        Ok(FileMetadata {
            symbol: request.symbol.clone(),
            kind: request.kind,
            date: request.date.clone(),
            timeframe: request.timeframe,
            path: target.to_path_buf(),
            size,
            checksum,
            downloaded_at: Utc::now(),
            verified: true,
        })
    }
}
