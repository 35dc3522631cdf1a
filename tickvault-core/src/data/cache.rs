//! Archive cache with a persistent JSON index.
//!
//! Layout:
//! - `{root}/{exchange}/{market}/klines/{SYMBOL}/{tf}/{SYMBOL}-{tf}-{date}.zip`
//! - `{root}/{exchange}/{market}/trades/{SYMBOL}/{SYMBOL}-trades-{date}.zip`
//! - `{root}/index.json`: key `symbol_kind_date[_tf]` → [`FileMetadata`]
//!
//! Features:
//! - Single writer: every index mutation happens under one `RwLock` and is
//!   persisted before the lock is released
//! - Atomic index writes (write to .tmp, rename into place)
//! - Integrity checks against recorded size and streamed BLAKE3 checksum
//! - Stale entries (file gone from disk) are evicted synchronously on lookup

use crate::config::CacheConfig;
use crate::data::error::{DataError, Result};
use crate::domain::{DataKind, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";

/// Metadata for one cached archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub symbol: String,
    pub kind: DataKind,
    /// `YYYY-MM-DD`
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    pub path: PathBuf,
    pub size: u64,
    /// Hex BLAKE3 of the file contents; empty when not computed.
    #[serde(default)]
    pub checksum: String,
    pub downloaded_at: DateTime<Utc>,
    pub verified: bool,
}

impl FileMetadata {
    /// Composite index key.
    pub fn key(&self) -> String {
        index_key(&self.symbol, self.kind, &self.date, self.timeframe)
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(DataError::InvalidMetadata("symbol is empty".into()));
        }
        if self.date.trim().is_empty() {
            return Err(DataError::InvalidMetadata("date is empty".into()));
        }
        match (self.kind, self.timeframe) {
            (DataKind::Klines, None) => Err(DataError::InvalidMetadata(
                "klines metadata requires a timeframe".into(),
            )),
            (DataKind::Trades, Some(tf)) => Err(DataError::InvalidMetadata(format!(
                "trades metadata must not carry a timeframe (got {tf})"
            ))),
            _ => Ok(()),
        }
    }
}

/// Composite key `symbol_kind_date[_timeframe]`.
pub fn index_key(symbol: &str, kind: DataKind, date: &str, timeframe: Option<Timeframe>) -> String {
    match timeframe {
        Some(tf) => format!("{symbol}_{kind}_{date}_{tf}"),
        None => format!("{symbol}_{kind}_{date}"),
    }
}

/// Aggregate view over the index. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_files: usize,
    pub total_size: u64,
    pub corrupted_files: usize,
    pub hit_rate: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Outcome of an integrity check on one cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Intact,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
}

impl IntegrityStatus {
    pub fn is_corrupted(&self) -> bool {
        !matches!(self, IntegrityStatus::Intact)
    }
}

/// What a corruption sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub missing: Vec<String>,
    pub corrupted: Vec<String>,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.missing.len() + self.corrupted.len()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    entries: BTreeMap<String, FileMetadata>,
    /// Keys whose last integrity check failed.
    flagged: HashSet<String>,
    stats: CacheStatistics,
}

impl IndexState {
    fn recompute_stats(&mut self) {
        self.flagged.retain(|k| self.entries.contains_key(k));
        self.stats = CacheStatistics {
            total_files: self.entries.len(),
            total_size: self.entries.values().map(|m| m.size).sum(),
            corrupted_files: self.flagged.len(),
            hit_rate: 0.0,
            last_updated: Some(Utc::now()),
        };
    }
}

/// Owner of the on-disk index and the only writer of [`FileMetadata`].
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    index_path: PathBuf,
    state: RwLock<IndexState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    /// Open (or create) the cache at `config.root`, loading an existing index.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let config = config.resolve();
        fs::create_dir_all(&config.root).map_err(|e| DataError::io(&config.root, e))?;
        let root = fs::canonicalize(&config.root).map_err(|e| DataError::io(&config.root, e))?;
        let config = CacheConfig { root, ..config };
        let index_path = config.root.join(INDEX_FILE);

        let entries = load_index(&index_path)?;
        let mut state = IndexState {
            entries,
            ..Default::default()
        };
        state.recompute_stats();
        info!(
            root = %config.root.display(),
            files = state.stats.total_files,
            "opened cache index"
        );

        Ok(Self {
            config,
            index_path,
            state: RwLock::new(state),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Root directory of the cache (absolute).
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Deterministic archive path. Does not require the entry to exist.
    ///
    /// The timeframe segment is only emitted for klines with a timeframe.
    pub fn file_path(
        &self,
        symbol: &str,
        kind: DataKind,
        date: &str,
        timeframe: Option<Timeframe>,
    ) -> PathBuf {
        let base = self
            .config
            .root
            .join(&self.config.exchange)
            .join(&self.config.market)
            .join(kind.as_str())
            .join(symbol);
        match (kind, timeframe) {
            (DataKind::Klines, Some(tf)) => base
                .join(tf.as_str())
                .join(format!("{symbol}-{tf}-{date}.zip")),
            _ => base.join(format!("{symbol}-{kind}-{date}.zip")),
        }
    }

    /// True only if the entry is indexed and its file is on disk.
    ///
    /// An indexed entry whose file has disappeared is evicted before returning.
    pub fn file_exists(
        &self,
        symbol: &str,
        kind: DataKind,
        date: &str,
        timeframe: Option<Timeframe>,
    ) -> bool {
        let key = index_key(symbol, kind, date, timeframe);
        let path = match self.read_state().entries.get(&key) {
            Some(meta) => meta.path.clone(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        if path.exists() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.evict_stale(&key);
        false
    }

    /// Remove `key` if its file is still absent. Persistence failures are logged,
    /// not returned: the entry is already gone from memory and the next
    /// successful write will carry the eviction to disk.
    fn evict_stale(&self, key: &str) {
        let mut state = self.write_state();
        let still_missing = state
            .entries
            .get(key)
            .is_some_and(|meta| !meta.path.exists());
        if !still_missing {
            return;
        }
        state.entries.remove(key);
        state.recompute_stats();
        debug!(key, "evicted stale cache entry");
        if let Err(e) = self.persist(&state.entries) {
            warn!(key, error = %e, "failed to persist index after eviction");
        }
    }

    /// Metadata for an entry, if indexed. Does not touch the disk.
    pub fn get_metadata(
        &self,
        symbol: &str,
        kind: DataKind,
        date: &str,
        timeframe: Option<Timeframe>,
    ) -> Option<FileMetadata> {
        let key = index_key(symbol, kind, date, timeframe);
        self.read_state().entries.get(&key).cloned()
    }

    /// All indexed entries for a symbol, in key order.
    pub fn entries_for_symbol(&self, symbol: &str) -> Vec<FileMetadata> {
        self.read_state()
            .entries
            .values()
            .filter(|m| m.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Validate and upsert an entry, then persist the index.
    ///
    /// On a persistence failure the in-memory index is rolled back.
    pub fn update_index(&self, metadata: FileMetadata) -> Result<()> {
        metadata.validate()?;
        let key = metadata.key();

        let mut state = self.write_state();
        let previous = state.entries.insert(key.clone(), metadata);
        state.flagged.remove(&key);

        if let Err(e) = self.persist(&state.entries) {
            match previous {
                Some(prev) => state.entries.insert(key, prev),
                None => state.entries.remove(&key),
            };
            state.recompute_stats();
            return Err(e);
        }

        state.recompute_stats();
        debug!(key, "index updated");
        Ok(())
    }

    /// Drop an entry from the index, optionally deleting its file.
    /// Returns whether an entry was present.
    pub fn remove_entry(
        &self,
        symbol: &str,
        kind: DataKind,
        date: &str,
        timeframe: Option<Timeframe>,
        delete_file: bool,
    ) -> Result<bool> {
        let key = index_key(symbol, kind, date, timeframe);
        let mut state = self.write_state();
        let Some(meta) = state.entries.remove(&key) else {
            return Ok(false);
        };
        if delete_file {
            remove_if_present(&meta.path)?;
        }
        state.recompute_stats();
        self.persist(&state.entries)?;
        Ok(true)
    }

    /// Size and checksum check against recorded metadata.
    ///
    /// `path` may be relative or go through symlinks; it is matched after
    /// canonicalization. A file that no longer exists is matched as given.
    ///
    /// Fails with [`DataError::NotIndexed`] if no entry references `path`.
    pub fn check_integrity(&self, path: &Path) -> Result<IntegrityStatus> {
        let resolved = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => path.to_path_buf(),
            Err(e) => return Err(DataError::io(path, e)),
        };
        let meta = self
            .read_state()
            .entries
            .values()
            .find(|m| m.path == path || m.path == resolved)
            .cloned()
            .ok_or_else(|| DataError::NotIndexed {
                path: path.to_path_buf(),
            })?;

        // Hash outside the lock; only the flag update needs it.
        let status = integrity_of(&meta)?;

        let key = meta.key();
        let mut state = self.write_state();
        if state.entries.contains_key(&key) {
            let changed = if status.is_corrupted() {
                state.flagged.insert(key)
            } else {
                state.flagged.remove(&key)
            };
            if changed {
                state.recompute_stats();
            }
        }
        if status.is_corrupted() {
            warn!(path = %path.display(), ?status, "cached file failed integrity check");
        }
        Ok(status)
    }

    /// Corrupted = size differs from the recorded size, or a checksum was
    /// recorded and the recomputed one differs.
    pub fn is_file_corrupted(&self, path: &Path) -> Result<bool> {
        Ok(self.check_integrity(path)?.is_corrupted())
    }

    /// Full sweep: entries whose file is missing or corrupted are deleted from
    /// disk and from the index. The index is persisted once at the end.
    ///
    /// A file that cannot be deleted keeps its (flagged) entry; the sweep
    /// still finishes and persists, then the first such error is returned.
    pub fn cleanup_corrupted(&self) -> Result<CleanupReport> {
        let mut state = self.write_state();
        let mut report = CleanupReport {
            scanned: state.entries.len(),
            ..Default::default()
        };

        let mut doomed = Vec::new();
        let mut stuck = Vec::new();
        let mut first_error = None;
        for (key, meta) in &state.entries {
            let reason = match integrity_of(meta) {
                Ok(IntegrityStatus::Intact) => continue,
                Ok(IntegrityStatus::Missing) => {
                    report.missing.push(key.clone());
                    doomed.push(key.clone());
                    continue;
                }
                Ok(status) => format!("{status:?}"),
                Err(e) => e.to_string(),
            };
            warn!(key, reason = %reason, "removing corrupted cache file");
            match remove_if_present(&meta.path) {
                Ok(()) => {
                    report.corrupted.push(key.clone());
                    doomed.push(key.clone());
                }
                Err(e) => {
                    warn!(key, error = %e, "could not remove corrupted cache file");
                    stuck.push(key.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        for key in &doomed {
            state.entries.remove(key);
            state.flagged.remove(key);
        }
        state.flagged.extend(stuck);
        state.recompute_stats();
        self.persist(&state.entries)?;

        info!(
            scanned = report.scanned,
            missing = report.missing.len(),
            corrupted = report.corrupted.len(),
            failed = first_error.is_some(),
            "cache cleanup complete"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Snapshot of the aggregate statistics.
    pub fn cache_stats(&self) -> CacheStatistics {
        let mut stats = self.read_state().stats.clone();
        let hits = self.hits.load(Ordering::Relaxed);
        let lookups = hits + self.misses.load(Ordering::Relaxed);
        stats.hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        stats
    }

    fn read_state(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite the whole index atomically. Callers hold the write lock.
    fn persist(&self, entries: &BTreeMap<String, FileMetadata>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| DataError::Serialization(format!("index serialization: {e}")))?;
        let tmp_path = self.index_path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| DataError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.index_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::io(&self.index_path, e)
        })
    }
}

fn load_index(path: &Path) -> Result<BTreeMap<String, FileMetadata>> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| DataError::Serialization(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(DataError::io(path, e)),
    }
}

fn integrity_of(meta: &FileMetadata) -> Result<IntegrityStatus> {
    let actual_size = match fs::metadata(&meta.path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IntegrityStatus::Missing),
        Err(e) => return Err(DataError::io(&meta.path, e)),
    };
    if actual_size != meta.size {
        return Ok(IntegrityStatus::SizeMismatch {
            expected: meta.size,
            actual: actual_size,
        });
    }
    if !meta.checksum.is_empty() {
        let actual = file_checksum(&meta.path)?;
        if actual != meta.checksum {
            return Ok(IntegrityStatus::ChecksumMismatch {
                expected: meta.checksum.clone(),
                actual,
            });
        }
    }
    Ok(IntegrityStatus::Intact)
}

/// Hex BLAKE3 of a file, streamed through the hasher.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| DataError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| DataError::io(path, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

pub(crate) fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DataError::io(path, e)),
    }
}
