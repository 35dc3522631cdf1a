//! Memory probes and streaming memory metrics.
//!
//! The streaming reader never reads process memory directly; it asks a
//! [`MemoryProbe`]. Production wiring uses [`ProcessMemoryProbe`] (resident set
//! size via `sysinfo`); tests inject a [`FixedMemoryProbe`] to simulate
//! pressure deterministically.
//!
//! The reader asks before every row, so the process probe serves a cached
//! reading and only goes back to the OS once its refresh interval has passed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How long a process reading stays fresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Source of "how much memory is this process using right now".
pub trait MemoryProbe: Send + Sync {
    /// Current usage in bytes.
    fn used_bytes(&self) -> u64;
}

/// Resident set size of the current process, sampled at most once per
/// refresh interval.
pub struct ProcessMemoryProbe {
    pid: Pid,
    refresh_interval: Duration,
    epoch: Instant,
    /// Nanoseconds after `epoch` at which the cached reading goes stale.
    stale_at_ns: AtomicU64,
    cached_bytes: AtomicU64,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self::with_refresh_interval(DEFAULT_REFRESH_INTERVAL)
    }

    /// A zero interval refreshes on every reading.
    pub fn with_refresh_interval(refresh_interval: Duration) -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            refresh_interval,
            epoch: Instant::now(),
            stale_at_ns: AtomicU64::new(0),
            cached_bytes: AtomicU64::new(0),
            system: Mutex::new(System::new()),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    fn refresh(&self, sys: &mut System, now_ns: u64) -> u64 {
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        let bytes = sys.process(self.pid).map(|p| p.memory()).unwrap_or(0);
        self.cached_bytes.store(bytes, Ordering::Relaxed);
        let interval_ns = self.refresh_interval.as_nanos() as u64;
        self.stale_at_ns
            .store(now_ns.saturating_add(interval_ns), Ordering::Release);
        bytes
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> u64 {
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        if now_ns < self.stale_at_ns.load(Ordering::Acquire) {
            return self.cached_bytes.load(Ordering::Relaxed);
        }
        // Another thread already refreshing: its reading is as good as ours.
        match self.system.try_lock() {
            Ok(mut sys) => self.refresh(&mut sys, now_ns),
            Err(std::sync::TryLockError::Poisoned(e)) => self.refresh(&mut e.into_inner(), now_ns),
            Err(std::sync::TryLockError::WouldBlock) => self.cached_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Probe that reports whatever it was last set to.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn from_mb(mb: u64) -> Self {
        Self {
            bytes: AtomicU64::new(mb * 1024 * 1024),
        }
    }

    pub fn set_mb(&self, mb: u64) {
        self.bytes.store(mb * 1024 * 1024, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Memory observed during streaming. Reset between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryMetrics {
    pub current_mb: f64,
    pub peak_mb: f64,
    pub active_buffers: usize,
    pub last_sample: Option<DateTime<Utc>>,
}

impl MemoryMetrics {
    /// Record one probe reading and return it in MB.
    pub(crate) fn record(&mut self, used_bytes: u64) -> f64 {
        let mb = used_bytes as f64 / BYTES_PER_MB;
        self.current_mb = mb;
        if mb > self.peak_mb {
            self.peak_mb = mb;
        }
        self.last_sample = Some(Utc::now());
        mb
    }
}
