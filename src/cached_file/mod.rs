//! Cached Block File
//!
//! A write-through, read-populated byte-range cache layered over a lower
//! [`BlockFile`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CachedBlockFile                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  read ──────────► ReadRequest ─────┐                             │
//! │  read_single ──┐                   │      ┌──────────────────┐   │
//! │  write ────────┼► TransferRequest ─┼────► │    RangeLock     │   │
//! │  copy ─────────┘                   │      └──────────────────┘   │
//! │  set_file_size ─► SetFileSizeReq ──┘      ┌──────────────────┐   │
//! │                                    ├────► │    ReadCache     │   │
//! │                                    │      │ (shared, FileId) │   │
//! │                                    │      └──────────────────┘   │
//! │                                    │      ┌──────────────────┐   │
//! │                                    └────► │  Lower BlockFile │   │
//! │                                           └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every data operation takes the range lock over the bytes it touches
//! before looking at the cache or the lower file, so overlapping requests
//! of any kind are fully serialized. Writes always reach the lower file.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(InMemoryReadCache::default());
//! let lower = Arc::new(MemoryBlockFile::default());
//! let file = CachedBlockFile::new(FileId::new(), lower, cache, CachedFileConfig::default())?;
//!
//! file.write(IoPriority::Foreground, 0, Bytes::from_static(b"hello"), None)?.await?;
//! let data = file.read(IoPriority::Foreground, 0, 5, None)?.await?;
//! ```

mod completion;
mod counters;
mod range;
mod read;
mod set_file_size;
mod transfer;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, Instrument};

pub use completion::{Completion, RequestPool, RequestSlot};
pub use counters::{CachedFileCounters, CountersSnapshot};
pub use read::{ReadRequest, ReadState};
pub use set_file_size::{SetFileSizeRequest, SetFileSizeState};
pub use transfer::{TransferKind, TransferRequest, TransferState};

use crate::adapters::InMemoryRangeLock;
use crate::domain::buffer::IoBuffer;
use crate::domain::ports::{
    BlockFile, EvictionRegistration, FileId, IoPriority, RangeLock, ReadCache, WritePolicy,
};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a cached block file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFileConfig {
    /// Whether successful writes populate the read cache
    pub write_policy: WritePolicy,

    /// Maximum number of live request objects
    pub max_outstanding_requests: usize,
}

impl Default for CachedFileConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::CacheOnWrite,
            max_outstanding_requests: 1024,
        }
    }
}

impl CachedFileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_requests == 0 {
            return Err(Error::Config(
                "max_outstanding_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Shared Context
// =============================================================================

/// State shared by the facade and every request it starts.
pub(crate) struct FileContext {
    pub(crate) file_id: FileId,
    pub(crate) file: Arc<dyn BlockFile>,
    pub(crate) cache: Arc<dyn ReadCache>,
    pub(crate) range_lock: Arc<dyn RangeLock>,
    pub(crate) write_policy: WritePolicy,
    pub(crate) counters: CachedFileCounters,
}

// =============================================================================
// Cached Block File
// =============================================================================

/// Cached view of one lower block file.
pub struct CachedBlockFile {
    ctx: Arc<FileContext>,
    pool: RequestPool,
    config: CachedFileConfig,
}

impl CachedBlockFile {
    /// Create a cached file with its own [`InMemoryRangeLock`].
    pub fn new(
        file_id: FileId,
        file: Arc<dyn BlockFile>,
        cache: Arc<dyn ReadCache>,
        config: CachedFileConfig,
    ) -> Result<Self> {
        Self::with_range_lock(file_id, file, cache, Arc::new(InMemoryRangeLock::new()), config)
    }

    /// Create a cached file over an externally supplied range lock.
    pub fn with_range_lock(
        file_id: FileId,
        file: Arc<dyn BlockFile>,
        cache: Arc<dyn ReadCache>,
        range_lock: Arc<dyn RangeLock>,
        config: CachedFileConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            %file_id,
            name = file.name(),
            write_policy = %config.write_policy,
            max_outstanding_requests = config.max_outstanding_requests,
            "Opened cached block file"
        );

        Ok(Self {
            ctx: Arc::new(FileContext {
                file_id,
                file,
                cache,
                range_lock,
                write_policy: config.write_policy,
                counters: CachedFileCounters::new(),
            }),
            pool: RequestPool::new(config.max_outstanding_requests),
            config,
        })
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn file_id(&self) -> FileId {
        self.ctx.file_id
    }

    pub fn name(&self) -> &str {
        self.ctx.file.name()
    }

    /// Current size of the lower file.
    pub fn size(&self) -> u64 {
        self.ctx.file.size()
    }

    pub fn is_write_through(&self) -> bool {
        self.ctx.file.is_write_through()
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.ctx.write_policy
    }

    pub fn config(&self) -> &CachedFileConfig {
        &self.config
    }

    pub fn lower_file(&self) -> &Arc<dyn BlockFile> {
        &self.ctx.file
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.ctx.counters.snapshot()
    }

    /// Request slots not held by any live request object.
    pub fn available_requests(&self) -> usize {
        self.pool.available()
    }

    // =========================================================================
    // Request Allocation
    // =========================================================================

    pub fn allocate_read_request(&self) -> Result<ReadRequest> {
        self.pool.try_allocate().map(ReadRequest::new)
    }

    pub fn allocate_transfer_request(&self) -> Result<TransferRequest> {
        self.pool.try_allocate().map(TransferRequest::new)
    }

    pub fn allocate_set_file_size_request(&self) -> Result<SetFileSizeRequest> {
        self.pool.try_allocate().map(SetFileSizeRequest::new)
    }

    fn transfer_request(&self, request: Option<TransferRequest>) -> Result<TransferRequest> {
        match request {
            Some(mut request) => {
                request.reuse();
                Ok(request)
            }
            None => self.allocate_transfer_request(),
        }
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    /// Read `[offset, offset + length)`.
    ///
    /// The result may be assembled from several elements, some of them
    /// shared with the read cache.
    pub fn read(
        &self,
        priority: IoPriority,
        offset: u64,
        length: u64,
        request: Option<ReadRequest>,
    ) -> Result<Completion<IoBuffer, ReadRequest>> {
        check_range(offset, length)?;
        let mut request = match request {
            Some(mut request) => {
                request.reuse();
                request
            }
            None => self.allocate_read_request()?,
        };
        request.initialize(priority, offset, length);

        let ctx = Arc::clone(&self.ctx);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let span = debug_span!("read", file = %ctx.file_id, offset, length);
        Ok(Completion::spawn(
            cancel,
            async move {
                let result = request.execute(&ctx, &token).await;
                (result, request)
            }
            .instrument(span),
        ))
    }

    /// Read `buffer.len()` bytes at `offset` into a single contiguous element.
    pub fn read_single(
        &self,
        priority: IoPriority,
        offset: u64,
        buffer: BytesMut,
        request: Option<TransferRequest>,
    ) -> Result<Completion<Bytes, TransferRequest>> {
        let length = buffer.len() as u64;
        check_range(offset, length)?;
        let mut request = self.transfer_request(request)?;
        request.initialize_read_single(priority, offset, buffer);

        let span = debug_span!("read_single", file = %self.ctx.file_id, offset, length);
        Ok(self.start_transfer(request, span, |output| output.unwrap_or_default()))
    }

    /// Write one contiguous element at `offset`.
    pub fn write(
        &self,
        priority: IoPriority,
        offset: u64,
        data: Bytes,
        request: Option<TransferRequest>,
    ) -> Result<Completion<(), TransferRequest>> {
        self.write_buffer(priority, offset, IoBuffer::from_element(data), request)
    }

    /// Write every element of `data`, back to back, at `offset`.
    pub fn write_buffer(
        &self,
        priority: IoPriority,
        offset: u64,
        data: IoBuffer,
        request: Option<TransferRequest>,
    ) -> Result<Completion<(), TransferRequest>> {
        let length = data.size();
        check_range(offset, length)?;
        let mut request = self.transfer_request(request)?;
        request.initialize_write(priority, offset, data);

        let span = debug_span!("write", file = %self.ctx.file_id, offset, length);
        Ok(self.start_transfer(request, span, |_| ()))
    }

    /// Copy `length` bytes from `source` to `target`.
    ///
    /// # Panics
    ///
    /// Panics if the source and target ranges overlap.
    pub fn copy(
        &self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
        request: Option<TransferRequest>,
    ) -> Result<Completion<(), TransferRequest>> {
        check_range(source, length)?;
        check_range(target, length)?;
        assert!(
            source + length <= target || target + length <= source,
            "copy ranges overlap: source {} target {} length {}",
            source,
            target,
            length
        );
        let mut request = self.transfer_request(request)?;
        request.initialize_copy(priority, source, target, length);

        let span = debug_span!("copy", file = %self.ctx.file_id, source, target, length);
        Ok(self.start_transfer(request, span, |_| ()))
    }

    /// Truncate or extend the lower file.
    pub fn set_file_size(
        &self,
        new_size: u64,
        request: Option<SetFileSizeRequest>,
    ) -> Result<Completion<(), SetFileSizeRequest>> {
        let mut request = match request {
            Some(mut request) => {
                request.reuse();
                request
            }
            None => self.allocate_set_file_size_request()?,
        };
        request.initialize(new_size);

        let ctx = Arc::clone(&self.ctx);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let span = debug_span!("set_file_size", file = %ctx.file_id, new_size);
        Ok(Completion::spawn(
            cancel,
            async move {
                let result = request.execute(&ctx, &token).await;
                (result, request)
            }
            .instrument(span),
        ))
    }

    fn start_transfer<T, F>(
        &self,
        mut request: TransferRequest,
        span: tracing::Span,
        output: F,
    ) -> Completion<T, TransferRequest>
    where
        T: Send + 'static,
        F: FnOnce(Option<Bytes>) -> T + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        Completion::spawn(
            cancel,
            async move {
                let result = request.execute(&ctx, &token).await.map(output);
                (result, request)
            }
            .instrument(span),
        )
    }

    // =========================================================================
    // Pass-through Operations
    // =========================================================================

    pub async fn flush(&self) -> Result<()> {
        self.ctx.file.flush().await
    }

    /// Cancel queued I/O on the lower file.
    pub fn cancel_all(&self) {
        self.ctx.file.cancel_all();
    }

    pub fn close(&self) {
        debug!(file = %self.ctx.file_id, "Closing cached block file");
        self.ctx.file.close();
    }

    pub fn set_background_queue_length(&self, length: usize) {
        self.ctx.file.set_background_queue_length(length);
    }

    /// Drop cached bytes of `[offset, offset + length)` without locking.
    pub fn purge_cache(&self, offset: u64, length: u64) {
        self.ctx
            .cache
            .remove_range(self.ctx.file_id, offset, length);
    }

    pub fn register_for_eviction(&self, offset: u64) -> Result<EvictionRegistration> {
        self.ctx.cache.register_for_eviction(self.ctx.file_id, offset)
    }

    pub fn touch(&self, registration: &EvictionRegistration) {
        self.ctx.cache.touch(registration);
    }
}

impl std::fmt::Debug for CachedBlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBlockFile")
            .field("file_id", &self.ctx.file_id)
            .field("name", &self.ctx.file.name())
            .field("config", &self.config)
            .finish()
    }
}

fn check_range(offset: u64, length: u64) -> Result<()> {
    if offset.checked_add(length).is_none() {
        return Err(Error::OutOfBounds {
            offset,
            length,
            size: u64::MAX,
        });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
