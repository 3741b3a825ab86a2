//! Transfer request: read-single, write and copy.
//!
//! # State machine
//!
//! ```text
//!   Idle ─► AcquireFirstRange ─► [copy] AcquireSecondRange ─► CheckCache
//!                                                                │
//!              ┌──────────────── hit (read-single) ◄─────────────┤
//!              │                                                 │
//!              │        hit (copy) becomes a write at the target │
//!              │                                                 ▼
//!              │                                            Transfer
//!              │                                                 │
//!              └──────────────────────► Finalize ◄───────────────┘
//! ```
//!
//! A copy locks the lower of its two ranges first. A copy blocked on its
//! second range only ever waits for holders whose range ends past the end of
//! its own first range, so waits cannot form a cycle as long as the lock
//! grants against held ranges alone.

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::completion::RequestSlot;
use super::range::HeldRange;
use super::FileContext;
use crate::domain::buffer::IoBuffer;
use crate::domain::ports::{IoPriority, WritePolicy};
use crate::error::Result;

/// Operation a [`TransferRequest`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    ReadSingle,
    Write,
    Copy,
}

/// Progress of a [`TransferRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AcquireFirstRange,
    AcquireSecondRange,
    CheckCache,
    Transfer,
    Finalize,
    Done,
}

/// Reusable request object for read-single, write and copy operations.
pub struct TransferRequest {
    _slot: RequestSlot,
    state: TransferState,
    /// Operation as issued
    kind: TransferKind,
    /// Operation being performed; a cache-satisfied copy becomes a write
    mode: TransferKind,
    priority: IoPriority,
    /// Read offset, write offset or copy source
    offset: u64,
    /// Write offset or copy target
    target_offset: u64,
    length: u64,
    payload: IoBuffer,
    destination: Option<BytesMut>,
    cache_hit: bool,
}

impl TransferRequest {
    pub(crate) fn new(slot: RequestSlot) -> Self {
        Self {
            _slot: slot,
            state: TransferState::Idle,
            kind: TransferKind::ReadSingle,
            mode: TransferKind::ReadSingle,
            priority: IoPriority::default(),
            offset: 0,
            target_offset: 0,
            length: 0,
            payload: IoBuffer::new(),
            destination: None,
            cache_hit: false,
        }
    }

    /// Reset the request so it can be started again.
    pub fn reuse(&mut self) {
        self.state = TransferState::Idle;
        self.kind = TransferKind::ReadSingle;
        self.mode = TransferKind::ReadSingle;
        self.priority = IoPriority::default();
        self.offset = 0;
        self.target_offset = 0;
        self.length = 0;
        self.payload = IoBuffer::new();
        self.destination = None;
        self.cache_hit = false;
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Whether the last run was satisfied from the read cache.
    pub fn was_cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub(crate) fn initialize_read_single(
        &mut self,
        priority: IoPriority,
        offset: u64,
        destination: BytesMut,
    ) {
        self.kind = TransferKind::ReadSingle;
        self.mode = TransferKind::ReadSingle;
        self.priority = priority;
        self.offset = offset;
        self.target_offset = offset;
        self.length = destination.len() as u64;
        self.destination = Some(destination);
    }

    pub(crate) fn initialize_write(&mut self, priority: IoPriority, offset: u64, data: IoBuffer) {
        self.kind = TransferKind::Write;
        self.mode = TransferKind::Write;
        self.priority = priority;
        self.offset = offset;
        self.target_offset = offset;
        self.length = data.size();
        self.payload = data;
    }

    pub(crate) fn initialize_copy(
        &mut self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
    ) {
        self.kind = TransferKind::Copy;
        self.mode = TransferKind::Copy;
        self.priority = priority;
        self.offset = source;
        self.target_offset = target;
        self.length = length;
    }

    /// Run the transfer. Yields the bytes read for read-single.
    pub(crate) async fn execute(
        &mut self,
        ctx: &FileContext,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let (first, second) = match self.kind {
            TransferKind::Copy => (
                self.offset.min(self.target_offset),
                Some(self.offset.max(self.target_offset)),
            ),
            TransferKind::ReadSingle | TransferKind::Write => (self.offset, None),
        };

        self.state = TransferState::AcquireFirstRange;
        let first_range = HeldRange::acquire(&ctx.range_lock, first, self.length, cancel).await?;
        let second_range = match second {
            Some(second) => {
                self.state = TransferState::AcquireSecondRange;
                Some(HeldRange::acquire(&ctx.range_lock, second, self.length, cancel).await?)
            }
            None => None,
        };

        let result = self.transfer(ctx, cancel).await;

        drop(second_range);
        drop(first_range);
        self.record_counters(ctx);
        self.state = TransferState::Done;
        result
    }

    async fn transfer(&mut self, ctx: &FileContext, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        self.state = TransferState::CheckCache;
        if matches!(self.kind, TransferKind::ReadSingle | TransferKind::Copy) {
            if let Some(cached) = self.lookup_cached(ctx) {
                self.cache_hit = true;
                if self.kind == TransferKind::ReadSingle {
                    trace!(offset = self.offset, length = self.length, "Read-single served from cache");
                    self.state = TransferState::Finalize;
                    return Ok(Some(cached));
                }
                debug!(
                    source = self.offset,
                    target = self.target_offset,
                    length = self.length,
                    "Copy satisfied from cache"
                );
                self.mode = TransferKind::Write;
                self.payload = IoBuffer::from_element(cached);
            }
        }

        self.state = TransferState::Transfer;
        let result = match self.mode {
            TransferKind::ReadSingle => {
                let destination = self
                    .destination
                    .take()
                    .unwrap_or_else(|| BytesMut::zeroed(self.length as usize));
                ctx.file
                    .read(self.priority, self.offset, destination, cancel.clone())
                    .await
                    .map(Some)
            }
            TransferKind::Write => ctx
                .file
                .write(
                    self.priority,
                    self.target_offset,
                    self.payload.clone(),
                    cancel.clone(),
                )
                .await
                .map(|_| None),
            TransferKind::Copy => ctx
                .file
                .copy(
                    self.priority,
                    self.offset,
                    self.target_offset,
                    self.length,
                    cancel.clone(),
                )
                .await
                .map(|_| None),
        };

        self.state = TransferState::Finalize;
        self.update_cache(ctx, &result);
        result
    }

    /// A view of the source bytes, if one cache entry covers all of them.
    fn lookup_cached(&self, ctx: &FileContext) -> Option<Bytes> {
        let (start, entry) = ctx.cache.query(ctx.file_id, self.offset)?;
        let delta = self.offset - start;
        let available = entry.len() as u64 - delta;
        if available < self.length {
            return None;
        }
        let delta = delta as usize;
        Some(entry.slice(delta..delta + self.length as usize))
    }

    /// Keep the cache coherent with the physical outcome.
    fn update_cache(&self, ctx: &FileContext, result: &Result<Option<Bytes>>) {
        if let Err(e) = result {
            if e.is_cancelled() {
                return;
            }
            warn!(
                kind = ?self.kind,
                offset = self.target_offset,
                length = self.length,
                error = %e,
                "Transfer failed"
            );
        }

        match (self.mode, result) {
            (TransferKind::ReadSingle, Ok(Some(data))) => {
                if ctx.cache.query(ctx.file_id, self.offset).is_none() {
                    if let Err(e) = ctx.cache.add(ctx.file_id, self.offset, data.clone()) {
                        debug!(offset = self.offset, error = %e, "Read cache add failed");
                    }
                }
            }
            (TransferKind::ReadSingle, _) => {}
            (TransferKind::Write, Ok(_)) => {
                ctx.cache
                    .remove_range(ctx.file_id, self.target_offset, self.length);
                if ctx.write_policy == WritePolicy::CacheOnWrite {
                    for (at, element) in self.payload.elements_at(self.target_offset) {
                        if let Err(e) = ctx.cache.add(ctx.file_id, at, element.clone()) {
                            debug!(offset = at, error = %e, "Read cache add failed");
                        }
                    }
                }
            }
            // Target contents are unknown after a failure
            (TransferKind::Write, Err(_)) | (TransferKind::Copy, _) => {
                ctx.cache
                    .remove_range(ctx.file_id, self.target_offset, self.length);
            }
        }
    }

    fn record_counters(&self, ctx: &FileContext) {
        match self.kind {
            TransferKind::ReadSingle => ctx.counters.record_read(self.length, self.cache_hit),
            TransferKind::Write => ctx.counters.record_write(self.length),
            TransferKind::Copy => ctx.counters.record_copy(self.length, self.cache_hit),
        }
    }
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .field("target_offset", &self.target_offset)
            .field("length", &self.length)
            .field("cache_hit", &self.cache_hit)
            .finish()
    }
}
