//! In-Memory Read Cache
//!
//! Reference [`ReadCache`] shared by any number of files. Entries are kept
//! per file in an ordered map keyed by starting offset, so covering and
//! "equal or next" lookups are a single range scan.
//!
//! # Design
//!
//! - `DashMap<FileId, BTreeMap<..>>` so files never contend with each other
//! - Inserting an entry replaces every entry it overlaps
//! - Capacity is a hard byte limit; an insert that does not fit fails with
//!   `Error::CacheFull` (entries it overlapped are still dropped)
//! - Eviction watchers fire whenever their entry leaves the cache

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::domain::ports::{EvictionRegistration, FileId, ReadCache};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Read cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCacheConfig {
    /// Maximum number of cached bytes across all files
    pub capacity_bytes: u64,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Read cache statistics.
#[derive(Debug, Default)]
pub struct ReadCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub rejected: AtomicU64,
    pub evictions: AtomicU64,
}

impl ReadCacheStats {
    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Hit ratio over all covering lookups.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

struct CachedEntry {
    data: Bytes,
    access_count: u64,
    watchers: Vec<oneshot::Sender<()>>,
}

impl CachedEntry {
    fn end(&self, start: u64) -> u64 {
        start.saturating_add(self.data.len() as u64)
    }

    fn notify_evicted(self) {
        for watcher in self.watchers {
            let _ = watcher.send(());
        }
    }
}

/// Byte-range read cache shared between files.
pub struct InMemoryReadCache {
    config: ReadCacheConfig,
    files: DashMap<FileId, BTreeMap<u64, CachedEntry>>,
    current_bytes: AtomicU64,
    stats: ReadCacheStats,
}

impl InMemoryReadCache {
    /// Create an empty cache.
    pub fn new(config: ReadCacheConfig) -> Self {
        Self {
            config,
            files: DashMap::new(),
            current_bytes: AtomicU64::new(0),
            stats: ReadCacheStats::default(),
        }
    }

    /// Bytes currently cached across all files.
    pub fn size_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Number of entries cached for `file`.
    pub fn entry_count(&self, file: FileId) -> usize {
        self.files.get(&file).map(|entries| entries.len()).unwrap_or(0)
    }

    /// How many times the entry starting at `offset` has been touched.
    pub fn access_count(&self, file: FileId, offset: u64) -> Option<u64> {
        self.files
            .get(&file)
            .and_then(|entries| entries.get(&offset).map(|entry| entry.access_count))
    }

    /// Drop every entry belonging to `file`.
    pub fn purge_file(&self, file: FileId) {
        if let Some((_, entries)) = self.files.remove(&file) {
            let mut freed = 0u64;
            for (_, entry) in entries {
                freed += entry.data.len() as u64;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                entry.notify_evicted();
            }
            self.current_bytes.fetch_sub(freed, Ordering::Relaxed);
            debug!(%file, freed, "Purged file from read cache");
        }
    }

    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }

    /// Remove entries overlapping `[start, end)` from one file's map.
    fn remove_overlapping(&self, entries: &mut BTreeMap<u64, CachedEntry>, start: u64, end: u64) {
        let mut doomed = Vec::new();
        // The entry starting before `start` may still reach into the range
        if let Some((&key, entry)) = entries.range(..start).next_back() {
            if entry.end(key) > start {
                doomed.push(key);
            }
        }
        doomed.extend(entries.range(start..end).map(|(&key, _)| key));

        for key in doomed {
            if let Some(entry) = entries.remove(&key) {
                self.current_bytes
                    .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                entry.notify_evicted();
            }
        }
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let capacity = self.config.capacity_bytes;
        self.current_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|_| Error::CacheFull {
                requested: bytes,
                capacity,
            })
    }
}

impl Default for InMemoryReadCache {
    fn default() -> Self {
        Self::new(ReadCacheConfig::default())
    }
}

impl ReadCache for InMemoryReadCache {
    fn query(&self, file: FileId, offset: u64) -> Option<(u64, Bytes)> {
        let found = self.files.get(&file).and_then(|entries| {
            entries
                .range(..=offset)
                .next_back()
                .filter(|(&start, entry)| entry.end(start) > offset)
                .map(|(&start, entry)| (start, entry.data.clone()))
        });
        self.stats.record_lookup(found.is_some());
        found
    }

    fn query_equal_or_next(&self, file: FileId, offset: u64) -> Option<u64> {
        self.files
            .get(&file)
            .and_then(|entries| entries.range(offset..).next().map(|(&start, _)| start))
    }

    fn add(&self, file: FileId, offset: u64, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let length = data.len() as u64;
        let end = offset.saturating_add(length);

        let mut entries = self.files.entry(file).or_default();
        self.remove_overlapping(&mut entries, offset, end);

        if let Err(e) = self.reserve(length) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(%file, offset, length, "Read cache rejected entry");
            return Err(e);
        }

        entries.insert(
            offset,
            CachedEntry {
                data,
                access_count: 0,
                watchers: Vec::new(),
            },
        );
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        trace!(%file, offset, length, "Cached entry");
        Ok(())
    }

    fn remove_range(&self, file: FileId, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        if let Some(mut entries) = self.files.get_mut(&file) {
            self.remove_overlapping(&mut entries, offset, offset.saturating_add(length));
        }
    }

    fn register_for_eviction(&self, file: FileId, offset: u64) -> Result<EvictionRegistration> {
        let mut entries = self
            .files
            .get_mut(&file)
            .ok_or(Error::NotCached { offset })?;

        let (start, entry) = entries
            .range_mut(..=offset)
            .next_back()
            .filter(|(&start, entry)| entry.end(start) > offset)
            .ok_or(Error::NotCached { offset })?;

        let (tx, rx) = oneshot::channel();
        entry.watchers.push(tx);
        Ok(EvictionRegistration::new(file, *start, rx))
    }

    fn touch(&self, registration: &EvictionRegistration) {
        if let Some(mut entries) = self.files.get_mut(&registration.file()) {
            if let Some(entry) = entries.get_mut(&registration.offset()) {
                entry.access_count += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
