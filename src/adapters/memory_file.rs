//! In-Memory Block File
//!
//! A [`BlockFile`] backed by a growable byte vector. It behaves like a real
//! lower file as far as the cached layer can observe:
//!
//! - All I/O is limited by `max_concurrent_io`
//! - Background I/O is additionally limited by a resizable queue length
//! - Cancellation is honored while an I/O is queued, never after it starts
//! - `close` fails every later I/O with `Error::FileClosed`
//!
//! ```text
//!   request ──► [closed?] ──► [io permit] ──► [background slot] ──► transfer
//!                                 ▲                  ▲
//!                         cancel / cancel_all   cancel / cancel_all
//! ```
//!
//! Every physical transfer is counted in [`MemoryFileStats`] so tests can
//! assert how many transfers a cached operation actually issued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::domain::buffer::IoBuffer;
use crate::domain::ports::{BlockFile, IoPriority};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an in-memory block file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlockFileConfig {
    /// File name reported to diagnostics
    pub name: String,

    /// Maximum concurrent I/O operations
    pub max_concurrent_io: usize,

    /// Maximum concurrent background I/O operations
    pub background_queue_length: usize,

    /// Whether writes are durable on completion
    pub write_through: bool,

    /// Hard limit on the file size
    pub max_size: u64,

    /// Artificial latency added to every issued transfer
    #[serde(with = "duration_millis")]
    pub io_latency: Duration,
}

impl Default for MemoryBlockFileConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            max_concurrent_io: 64,
            background_queue_length: 2,
            write_through: true,
            max_size: 1 << 40, // 1 TiB
            io_latency: Duration::ZERO,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Physical transfer statistics.
#[derive(Debug, Default)]
pub struct MemoryFileStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub copies: AtomicU64,
    pub resizes: AtomicU64,
    pub flushes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_copied: AtomicU64,
    /// I/Os cancelled before they were issued
    pub cancelled: AtomicU64,
}

impl MemoryFileStats {
    fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_copy(&self, bytes: u64) {
        self.copies.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Reads, writes and copies issued so far.
    pub fn physical_transfers(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
            + self.writes.load(Ordering::Relaxed)
            + self.copies.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Background Queue
// =============================================================================

struct BackgroundGate {
    limit: usize,
    in_flight: usize,
}

struct BackgroundSlot<'a> {
    file: &'a MemoryBlockFile,
}

impl std::fmt::Debug for BackgroundSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSlot").finish_non_exhaustive()
    }
}

impl Drop for BackgroundSlot<'_> {
    fn drop(&mut self) {
        self.file.background.lock().in_flight -= 1;
        self.file.background_released.notify_waiters();
    }
}

/// Resources held while one transfer runs.
struct Admission<'a> {
    _permit: SemaphorePermit<'a>,
    _background: Option<BackgroundSlot<'a>>,
}

// =============================================================================
// Block File
// =============================================================================

/// Block file held entirely in memory.
pub struct MemoryBlockFile {
    config: MemoryBlockFileConfig,
    data: RwLock<Vec<u8>>,
    io_permits: Semaphore,
    background: Mutex<BackgroundGate>,
    background_released: Notify,
    cancel_all: Mutex<CancellationToken>,
    closed: AtomicBool,
    stats: MemoryFileStats,
}

impl MemoryBlockFile {
    /// Create an empty file.
    pub fn new(config: MemoryBlockFileConfig) -> Self {
        Self::with_contents(config, Vec::new())
    }

    /// Create a file holding `contents`.
    pub fn with_contents(config: MemoryBlockFileConfig, contents: Vec<u8>) -> Self {
        Self {
            io_permits: Semaphore::new(config.max_concurrent_io.max(1)),
            background: Mutex::new(BackgroundGate {
                limit: config.background_queue_length,
                in_flight: 0,
            }),
            background_released: Notify::new(),
            cancel_all: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
            stats: MemoryFileStats::default(),
            data: RwLock::new(contents),
            config,
        }
    }

    pub fn config(&self) -> &MemoryBlockFileConfig {
        &self.config
    }

    pub fn stats(&self) -> &MemoryFileStats {
        &self.stats
    }

    /// Snapshot of the whole file.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Snapshot of `[offset, offset + length)`, clipped to the file size.
    pub fn contents_at(&self, offset: u64, length: u64) -> Vec<u8> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        data[start..end].to_vec()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::FileClosed)
        } else {
            Ok(())
        }
    }

    /// Convert a byte interval to vector indices.
    fn span(&self, offset: u64, length: u64) -> Result<(usize, usize)> {
        let out_of_bounds = || Error::OutOfBounds {
            offset,
            length,
            size: self.size(),
        };
        let end = offset.checked_add(length).ok_or_else(out_of_bounds)?;
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = usize::try_from(end).map_err(|_| out_of_bounds())?;
        Ok((start, end))
    }

    fn check_max_size(&self, offset: u64, end: u64) -> Result<()> {
        if end > self.config.max_size {
            return Err(Error::OutOfBounds {
                offset,
                length: end - offset,
                size: self.config.max_size,
            });
        }
        Ok(())
    }

    async fn background_slot(&self) -> BackgroundSlot<'_> {
        loop {
            let released = self.background_released.notified();
            {
                let mut gate = self.background.lock();
                if gate.in_flight < gate.limit.max(1) {
                    gate.in_flight += 1;
                    return BackgroundSlot { file: self };
                }
            }
            released.await;
        }
    }

    async fn wait_for_slot(&self, priority: IoPriority) -> Result<Admission<'_>> {
        let permit = self
            .io_permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("semaphore error: {}", e)))?;
        let background = match priority {
            IoPriority::Foreground => None,
            IoPriority::Background => Some(self.background_slot().await),
        };
        Ok(Admission {
            _permit: permit,
            _background: background,
        })
    }

    /// Queue an I/O until it may be issued, or until it is cancelled.
    async fn admit(&self, priority: IoPriority, cancel: &CancellationToken) -> Result<Admission<'_>> {
        self.ensure_open()?;
        let cancel_all = self.cancel_all.lock().clone();

        let admission = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = cancel_all.cancelled() => Err(Error::Cancelled),
            admission = self.wait_for_slot(priority) => admission,
        };
        if admission.is_err() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        let admission = admission?;

        // Closed while queued
        self.ensure_open()?;
        if !self.config.io_latency.is_zero() {
            tokio::time::sleep(self.config.io_latency).await;
        }
        Ok(admission)
    }
}

impl Default for MemoryBlockFile {
    fn default() -> Self {
        Self::new(MemoryBlockFileConfig::default())
    }
}

#[async_trait]
impl BlockFile for MemoryBlockFile {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn is_write_through(&self) -> bool {
        self.config.write_through
    }

    #[instrument(skip(self, buf, cancel), fields(file = %self.config.name, length = buf.len()))]
    async fn read(
        &self,
        priority: IoPriority,
        offset: u64,
        mut buf: BytesMut,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        let length = buf.len() as u64;
        let _admission = self.admit(priority, &cancel).await?;

        let (start, end) = self.span(offset, length)?;
        {
            let data = self.data.read();
            if end > data.len() {
                return Err(Error::OutOfBounds {
                    offset,
                    length,
                    size: data.len() as u64,
                });
            }
            buf.copy_from_slice(&data[start..end]);
        }

        self.stats.record_read(length);
        trace!(offset, length, "Physical read");
        Ok(buf.freeze())
    }

    #[instrument(skip(self, data, cancel), fields(file = %self.config.name, length = data.size()))]
    async fn write(
        &self,
        priority: IoPriority,
        offset: u64,
        data: IoBuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        let length = data.size();
        let _admission = self.admit(priority, &cancel).await?;

        let (_, end) = self.span(offset, length)?;
        self.check_max_size(offset, end as u64)?;
        {
            let mut storage = self.data.write();
            if end > storage.len() {
                storage.resize(end, 0);
            }
            for (at, element) in data.elements_at(offset) {
                let at = at as usize;
                storage[at..at + element.len()].copy_from_slice(element);
            }
        }

        self.stats.record_write(length);
        trace!(offset, length, "Physical write");
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(file = %self.config.name))]
    async fn copy(
        &self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _admission = self.admit(priority, &cancel).await?;

        let (source_start, source_end) = self.span(source, length)?;
        let (target_start, target_end) = self.span(target, length)?;
        self.check_max_size(target, target_end as u64)?;
        {
            let mut storage = self.data.write();
            if source_end > storage.len() {
                return Err(Error::OutOfBounds {
                    offset: source,
                    length,
                    size: storage.len() as u64,
                });
            }
            if target_end > storage.len() {
                storage.resize(target_end, 0);
            }
            storage.copy_within(source_start..source_end, target_start);
        }

        self.stats.record_copy(length);
        trace!(source, target, length, "Physical copy");
        Ok(())
    }

    async fn set_file_size(&self, size: u64) -> Result<()> {
        self.ensure_open()?;
        self.check_max_size(0, size)?;
        let (_, new_len) = self.span(0, size)?;

        self.data.write().resize(new_len, 0);
        self.stats.resizes.fetch_add(1, Ordering::Relaxed);
        debug!(file = %self.config.name, size, "Resized file");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cancel_all(&self) {
        let mut token = self.cancel_all.lock();
        token.cancel();
        *token = CancellationToken::new();
        debug!(file = %self.config.name, "Cancelled queued I/O");
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_all();
    }

    fn set_background_queue_length(&self, length: usize) {
        self.background.lock().limit = length;
        self.background_released.notify_waiters();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_write_extends_and_reads_back() {
        let file = MemoryBlockFile::default();
        let data: IoBuffer = vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]
            .into_iter()
            .collect();

        file.write(IoPriority::Foreground, 4, data, token())
            .await
            .unwrap();
        assert_eq!(file.size(), 15);

        let read = file
            .read(IoPriority::Foreground, 0, BytesMut::zeroed(15), token())
            .await
            .unwrap();
        assert_eq!(&read[..], b"\0\0\0\0hello world");
        assert_eq!(file.stats().physical_transfers(), 2);
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        let file = MemoryBlockFile::with_contents(MemoryBlockFileConfig::default(), vec![0; 10]);
        let result = file
            .read(IoPriority::Background, 5, BytesMut::zeroed(10), token())
            .await;
        assert_matches!(result, Err(Error::OutOfBounds { size: 10, .. }));
    }

    #[tokio::test]
    async fn test_copy_within_file() {
        let file =
            MemoryBlockFile::with_contents(MemoryBlockFileConfig::default(), b"abcdef".to_vec());
        file.copy(IoPriority::Background, 0, 8, 3, token())
            .await
            .unwrap();
        assert_eq!(file.contents(), b"abcdef\0\0abc");
        assert_eq!(file.stats().copies.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_issue() {
        let file = MemoryBlockFile::default();
        let cancel = token();
        cancel.cancel();

        let result = file
            .write(IoPriority::Foreground, 0, IoBuffer::from(vec![1u8; 4]), cancel)
            .await;
        assert_matches!(result, Err(Error::Cancelled));
        assert_eq!(file.size(), 0);
        assert_eq!(file.stats().cancelled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_closed_file_rejects_io() {
        let file = MemoryBlockFile::default();
        file.close();
        assert_matches!(file.flush().await, Err(Error::FileClosed));
        assert_matches!(file.set_file_size(10).await, Err(Error::FileClosed));
    }

    #[tokio::test]
    async fn test_background_queue_limit() {
        let file = MemoryBlockFile::default();
        file.set_background_queue_length(1);

        let first = file.background_slot().await;
        let mut second = tokio_test::task::spawn(file.background_slot());
        tokio_test::assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let _slot = tokio_test::assert_ready!(second.poll());
    }

    #[tokio::test]
    async fn test_max_size_enforced() {
        let file = MemoryBlockFile::new(MemoryBlockFileConfig {
            max_size: 16,
            ..Default::default()
        });
        assert_matches!(
            file.set_file_size(17).await,
            Err(Error::OutOfBounds { size: 16, .. })
        );
        file.set_file_size(16).await.unwrap();
        assert_eq!(file.size(), 16);
    }
}
