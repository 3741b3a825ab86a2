//! Per-file operation counters.
//!
//! Counters are plain atomics updated with relaxed ordering; a snapshot is
//! not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters for one cached file.
#[derive(Debug, Default)]
pub struct CachedFileCounters {
    read_count: AtomicU64,
    bytes_read: AtomicU64,
    cached_read_count: AtomicU64,
    cached_bytes_read: AtomicU64,
    write_count: AtomicU64,
    bytes_written: AtomicU64,
    copy_count: AtomicU64,
    bytes_copied: AtomicU64,
    cached_copy_count: AtomicU64,
    cached_bytes_copied: AtomicU64,
}

impl CachedFileCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed read of `bytes`, optionally served entirely from cache.
    pub fn record_read(&self, bytes: u64, from_cache: bool) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        if from_cache {
            self.cached_read_count.fetch_add(1, Ordering::Relaxed);
            self.cached_bytes_read.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Record a completed write of `bytes`.
    pub fn record_write(&self, bytes: u64) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a completed copy of `bytes`, optionally satisfied from cache.
    pub fn record_copy(&self, bytes: u64, from_cache: bool) {
        self.copy_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        if from_cache {
            self.cached_copy_count.fetch_add(1, Ordering::Relaxed);
            self.cached_bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            read_count: self.read_count.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            cached_read_count: self.cached_read_count.load(Ordering::Relaxed),
            cached_bytes_read: self.cached_bytes_read.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            copy_count: self.copy_count.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            cached_copy_count: self.cached_copy_count.load(Ordering::Relaxed),
            cached_bytes_copied: self.cached_bytes_copied.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CachedFileCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub read_count: u64,
    pub bytes_read: u64,
    pub cached_read_count: u64,
    pub cached_bytes_read: u64,
    pub write_count: u64,
    pub bytes_written: u64,
    pub copy_count: u64,
    pub bytes_copied: u64,
    pub cached_copy_count: u64,
    pub cached_bytes_copied: u64,
}

impl CountersSnapshot {
    /// Every counter as `(operation, source, kind, value)`.
    ///
    /// `source` is `"all"` or `"cache"`, `kind` is `"count"` or `"bytes"`.
    pub fn samples(&self) -> [(&'static str, &'static str, &'static str, u64); 10] {
        [
            ("read", "all", "count", self.read_count),
            ("read", "all", "bytes", self.bytes_read),
            ("read", "cache", "count", self.cached_read_count),
            ("read", "cache", "bytes", self.cached_bytes_read),
            ("write", "all", "count", self.write_count),
            ("write", "all", "bytes", self.bytes_written),
            ("copy", "all", "count", self.copy_count),
            ("copy", "all", "bytes", self.bytes_copied),
            ("copy", "cache", "count", self.cached_copy_count),
            ("copy", "cache", "bytes", self.cached_bytes_copied),
        ]
    }

    /// Fraction of read bytes served from cache.
    pub fn read_hit_ratio(&self) -> f64 {
        if self.bytes_read == 0 {
            0.0
        } else {
            self.cached_bytes_read as f64 / self.bytes_read as f64
        }
    }
}

impl std::fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "reads:  {} ({} bytes), cached {} ({} bytes)",
            self.read_count, self.bytes_read, self.cached_read_count, self.cached_bytes_read
        )?;
        writeln!(
            f,
            "writes: {} ({} bytes)",
            self.write_count, self.bytes_written
        )?;
        write!(
            f,
            "copies: {} ({} bytes), cached {} ({} bytes)",
            self.copy_count, self.bytes_copied, self.cached_copy_count, self.cached_bytes_copied
        )
    }
}
