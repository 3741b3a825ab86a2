//! Domain Ports (Port/Adapter Pattern)
//!
//! The cached block file depends on three collaborators it does not
//! implement itself. They are expressed as traits here; `crate::adapters`
//! provides reference implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CachedBlockFile                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │     RangeLock   │    ReadCache    │    BlockFile     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  InMemoryRangeLock │ InMemoryReadCache │ MemoryBlockFile    │
//! │                                        │ FsBlockFile        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::buffer::IoBuffer;
use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Globally unique identity of one underlying file.
///
/// Every read-cache key is scoped by a `FileId`, so files sharing one cache
/// never observe each other's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority of a physical transfer on the lower file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoPriority {
    /// Latency-sensitive I/O, never throttled by the background queue.
    Foreground,
    /// Throughput I/O, limited by the background queue length.
    #[default]
    Background,
}

impl std::fmt::Display for IoPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoPriority::Foreground => write!(f, "foreground"),
            IoPriority::Background => write!(f, "background"),
        }
    }
}

/// Whether successful writes populate the read cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Written bytes are inserted into the cache.
    #[default]
    CacheOnWrite,
    /// Written ranges are purged from the cache instead.
    NoCacheOnWrite,
}

impl std::fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WritePolicy::CacheOnWrite => write!(f, "cache-on-write"),
            WritePolicy::NoCacheOnWrite => write!(f, "no-cache-on-write"),
        }
    }
}

impl FromStr for WritePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cache-on-write" | "cache" => Ok(WritePolicy::CacheOnWrite),
            "no-cache-on-write" | "no-cache" => Ok(WritePolicy::NoCacheOnWrite),
            other => Err(Error::Config(format!("unknown write policy: {}", other))),
        }
    }
}

/// Proof of exclusive ownership of `[offset, offset + length)`.
///
/// Tokens are issued by a [`RangeLock`] and must be handed back to the same
/// lock through [`RangeLock::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct RangeToken {
    id: u64,
    offset: u64,
    length: u64,
}

impl RangeToken {
    pub fn new(id: u64, offset: u64, length: u64) -> Self {
        Self { id, offset, length }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Exclusive end of the range, saturating at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Pending notification that a cache entry has been removed.
#[derive(Debug)]
pub struct EvictionRegistration {
    file: FileId,
    offset: u64,
    notified: oneshot::Receiver<()>,
}

impl EvictionRegistration {
    /// `offset` is the start of the registered cache entry.
    pub fn new(file: FileId, offset: u64, notified: oneshot::Receiver<()>) -> Self {
        Self {
            file,
            offset,
            notified,
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns `true` once the entry has been removed from the cache.
    pub fn is_evicted(&mut self) -> bool {
        !matches!(
            self.notified.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }

    /// Wait until the entry is removed from the cache.
    ///
    /// Returns `Error::Cancelled` if the cache was dropped first.
    pub async fn evicted(self) -> Result<()> {
        self.notified.await.map_err(|_| Error::Cancelled)
    }
}

// =============================================================================
// Port Traits
// =============================================================================

/// Byte-range lock manager for one file.
///
/// Grants mutually exclusive access to `[offset, offset + length)`.
/// Overlapping requests queue; the order among overlapping waiters is up to
/// the implementation.
#[async_trait]
pub trait RangeLock: Send + Sync {
    /// Acquire the range, waiting for overlapping holders to release.
    ///
    /// Dropping the returned future before it completes cancels the pending
    /// acquire; the range is never left held in that case.
    async fn acquire(&self, offset: u64, length: u64) -> RangeToken;

    /// Release a previously acquired range. Never fails.
    fn release(&self, token: RangeToken);
}

/// Shared read cache keyed by `(FileId, offset)`.
///
/// Entries are immutable once inserted. Every method is synchronous and
/// non-blocking.
pub trait ReadCache: Send + Sync {
    /// Look up the entry covering `offset`.
    ///
    /// Returns the entry's starting offset and its bytes.
    fn query(&self, file: FileId, offset: u64) -> Option<(u64, Bytes)>;

    /// Starting offset of the first entry that starts at or after `offset`.
    fn query_equal_or_next(&self, file: FileId, offset: u64) -> Option<u64>;

    /// Insert `data` at `offset`. Best-effort: callers tolerate failure.
    fn add(&self, file: FileId, offset: u64, data: Bytes) -> Result<()>;

    /// Remove every entry overlapping `[offset, offset + length)`.
    fn remove_range(&self, file: FileId, offset: u64, length: u64);

    /// Register for notification when the entry covering `offset` is removed.
    fn register_for_eviction(&self, file: FileId, offset: u64) -> Result<EvictionRegistration>;

    /// Record an access to the entry held by `registration`.
    fn touch(&self, registration: &EvictionRegistration);
}

/// The lower, non-cached block file that performs physical transfers.
#[async_trait]
pub trait BlockFile: Send + Sync {
    /// File name, for diagnostics and metric labels.
    fn name(&self) -> &str;

    /// Current file size in bytes.
    fn size(&self) -> u64;

    /// Whether writes are durable when they complete.
    fn is_write_through(&self) -> bool;

    /// Read `buf.len()` bytes at `offset` into `buf`.
    ///
    /// `cancel` is honored until the transfer is issued; after that the
    /// transfer runs to completion.
    async fn read(
        &self,
        priority: IoPriority,
        offset: u64,
        buf: BytesMut,
        cancel: CancellationToken,
    ) -> Result<Bytes>;

    /// Write every element of `data`, back to back, starting at `offset`.
    async fn write(
        &self,
        priority: IoPriority,
        offset: u64,
        data: IoBuffer,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Copy `length` bytes from `source` to `target` within the file.
    async fn copy(
        &self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Truncate or extend the file.
    async fn set_file_size(&self, size: u64) -> Result<()>;

    /// Flush any volatile state to stable storage.
    async fn flush(&self) -> Result<()>;

    /// Cancel every queued transfer that has not been issued yet.
    fn cancel_all(&self);

    /// Close the file; subsequent transfers fail with `Error::FileClosed`.
    fn close(&self);

    /// Limit the number of concurrently outstanding background transfers.
    fn set_background_queue_length(&self, length: usize);
}
