//! Read request.
//!
//! Assembles `[offset, offset + length)` from cache hits and physical
//! sub-reads of the gaps between them.
//!
//! ```text
//!   range:     [offset ────────────────────────────────────── end)
//!   cache:         ███████            ████████
//!   segments:  [read][cached ][ read  ][cached ][    read     ]
//!                ▲                ▲                  ▲
//!                └── sub-reads issued concurrently ──┘
//! ```
//!
//! # State machine
//!
//! `Idle → AcquireRange → ScanAndDispatch → AwaitSubReads → Finalize → Done`
//!
//! A pure cache hit skips `AwaitSubReads`. The in-progress count is seeded to
//! one for the scan, so the request cannot finish before every gap has been
//! dispatched.

use bytes::{Bytes, BytesMut};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::completion::RequestSlot;
use super::range::HeldRange;
use super::FileContext;
use crate::domain::buffer::IoBuffer;
use crate::domain::ports::IoPriority;
use crate::error::{Error, Result};

/// Progress of a [`ReadRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    AcquireRange,
    ScanAndDispatch,
    AwaitSubReads,
    Finalize,
    Done,
}

enum Segment {
    /// View into a cache entry
    Cached {
        entry: Bytes,
        delta: usize,
        length: usize,
    },
    /// Gap whose sub-read is outstanding
    Pending { offset: u64 },
    /// Gap filled by a completed sub-read
    Fetched { offset: u64, data: Bytes },
}

/// Reusable request object for [`CachedBlockFile::read`](super::CachedBlockFile::read).
pub struct ReadRequest {
    _slot: RequestSlot,
    state: ReadState,
    priority: IoPriority,
    offset: u64,
    length: u64,
    segments: Vec<Segment>,
    sub_reads: JoinSet<(usize, Result<Bytes>)>,
    in_progress: usize,
}

impl ReadRequest {
    pub(crate) fn new(slot: RequestSlot) -> Self {
        Self {
            _slot: slot,
            state: ReadState::Idle,
            priority: IoPriority::default(),
            offset: 0,
            length: 0,
            segments: Vec::new(),
            sub_reads: JoinSet::new(),
            in_progress: 0,
        }
    }

    /// Reset the request so it can be started again.
    pub fn reuse(&mut self) {
        self.state = ReadState::Idle;
        self.priority = IoPriority::default();
        self.offset = 0;
        self.length = 0;
        self.segments.clear();
        self.sub_reads.abort_all();
        self.sub_reads.detach_all();
        self.in_progress = 0;
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub(crate) fn initialize(&mut self, priority: IoPriority, offset: u64, length: u64) {
        self.priority = priority;
        self.offset = offset;
        self.length = length;
    }

    pub(crate) async fn execute(
        &mut self,
        ctx: &FileContext,
        cancel: &CancellationToken,
    ) -> Result<IoBuffer> {
        self.state = ReadState::AcquireRange;
        let range = HeldRange::acquire(&ctx.range_lock, self.offset, self.length, cancel).await?;

        self.state = ReadState::ScanAndDispatch;
        self.in_progress = 1;
        self.scan_and_dispatch(ctx, cancel);
        self.in_progress -= 1;

        if self.in_progress == 0 {
            let buffer = self.assemble();
            drop(range);
            ctx.counters.record_read(self.length, true);
            self.state = ReadState::Done;
            trace!(offset = self.offset, length = self.length, "Read served from cache");
            return Ok(buffer);
        }

        self.state = ReadState::AwaitSubReads;
        let first_error = self.await_sub_reads().await;

        self.state = ReadState::Finalize;
        self.populate_cache(ctx);
        drop(range);
        ctx.counters.record_read(self.length, false);
        self.state = ReadState::Done;

        if let Some(e) = first_error {
            return Err(e);
        }

        let buffer = self.assemble();
        assert_eq!(
            buffer.size(),
            self.length,
            "read assembled {} bytes for a {} byte request",
            buffer.size(),
            self.length
        );
        Ok(buffer)
    }

    /// Walk the range, referencing hits and issuing a sub-read per gap.
    fn scan_and_dispatch(&mut self, ctx: &FileContext, cancel: &CancellationToken) {
        let end = self.offset + self.length;
        let mut position = self.offset;

        while position < end {
            if let Some((start, entry)) = ctx.cache.query(ctx.file_id, position) {
                let delta = (position - start) as usize;
                let available = (entry.len() - delta) as u64;
                let take = available.min(end - position);
                self.segments.push(Segment::Cached {
                    entry,
                    delta,
                    length: take as usize,
                });
                position += take;
                continue;
            }

            let gap_end = ctx
                .cache
                .query_equal_or_next(ctx.file_id, position)
                .filter(|next| *next > position && *next < end)
                .unwrap_or(end);
            let gap = gap_end - position;

            let index = self.segments.len();
            self.segments.push(Segment::Pending { offset: position });
            self.in_progress += 1;

            let file = ctx.file.clone();
            let priority = self.priority;
            let cancel = cancel.clone();
            let at = position;
            self.sub_reads.spawn(async move {
                let result = file
                    .read(priority, at, BytesMut::zeroed(gap as usize), cancel)
                    .await;
                (index, result)
            });
            trace!(offset = position, length = gap, "Issued sub-read");
            position = gap_end;
        }
    }

    /// Retire every sub-read, returning the first failure.
    async fn await_sub_reads(&mut self) -> Option<Error> {
        let mut first_error = None;

        while let Some(joined) = self.sub_reads.join_next().await {
            self.in_progress -= 1;
            match joined {
                Ok((index, Ok(data))) => {
                    if let Some(segment) = self.segments.get_mut(index) {
                        if let Segment::Pending { offset } = *segment {
                            *segment = Segment::Fetched { offset, data };
                        }
                    }
                }
                Ok((index, Err(e))) => {
                    if !e.is_cancelled() {
                        warn!(segment = index, error = %e, "Sub-read failed");
                    }
                    first_error.get_or_insert(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    first_error.get_or_insert(Error::Internal(format!("sub-read task failed: {}", e)));
                }
            }
        }

        first_error
    }

    /// Cache every fetched gap not already covered.
    fn populate_cache(&self, ctx: &FileContext) {
        for segment in &self.segments {
            if let Segment::Fetched { offset, data } = segment {
                if ctx.cache.query(ctx.file_id, *offset).is_some() {
                    continue;
                }
                if let Err(e) = ctx.cache.add(ctx.file_id, *offset, data.clone()) {
                    debug!(offset, length = data.len(), error = %e, "Read cache add failed");
                }
            }
        }
    }

    fn assemble(&self) -> IoBuffer {
        let mut buffer = IoBuffer::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Cached {
                    entry,
                    delta,
                    length,
                } => buffer.push_reference(entry, *delta, *length),
                Segment::Fetched { data, .. } => buffer.push(data.clone()),
                Segment::Pending { .. } => {}
            }
        }
        buffer
    }
}

impl std::fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadRequest")
            .field("state", &self.state)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("in_progress", &self.in_progress)
            .finish()
    }
}
