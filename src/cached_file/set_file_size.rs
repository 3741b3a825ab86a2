//! Set-file-size request.
//!
//! Holds `[new_size, u64::MAX)` for the duration of the resize, so I/O in
//! the region being truncated drains first and no new I/O can start there.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::completion::RequestSlot;
use super::range::HeldRange;
use super::FileContext;
use crate::error::Result;

/// Progress of a [`SetFileSizeRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFileSizeState {
    Idle,
    AcquireTrailingRange,
    Resize,
    ReleaseRange,
    Done,
}

/// Reusable request object for [`CachedBlockFile::set_file_size`](super::CachedBlockFile::set_file_size).
#[derive(Debug)]
pub struct SetFileSizeRequest {
    _slot: RequestSlot,
    state: SetFileSizeState,
    new_size: u64,
}

impl SetFileSizeRequest {
    pub(crate) fn new(slot: RequestSlot) -> Self {
        Self {
            _slot: slot,
            state: SetFileSizeState::Idle,
            new_size: 0,
        }
    }

    /// Reset the request so it can be started again.
    pub fn reuse(&mut self) {
        self.state = SetFileSizeState::Idle;
        self.new_size = 0;
    }

    pub fn state(&self) -> SetFileSizeState {
        self.state
    }

    pub(crate) fn initialize(&mut self, new_size: u64) {
        self.new_size = new_size;
    }

    pub(crate) async fn execute(&mut self, ctx: &FileContext, cancel: &CancellationToken) -> Result<()> {
        let trailing = u64::MAX - self.new_size;

        self.state = SetFileSizeState::AcquireTrailingRange;
        let range = HeldRange::acquire(&ctx.range_lock, self.new_size, trailing, cancel).await?;

        // Not cancellable once issued
        self.state = SetFileSizeState::Resize;
        let result = ctx.file.set_file_size(self.new_size).await;
        if result.is_ok() {
            ctx.cache.remove_range(ctx.file_id, self.new_size, trailing);
        }

        self.state = SetFileSizeState::ReleaseRange;
        drop(range);

        self.state = SetFileSizeState::Done;
        debug!(new_size = self.new_size, ok = result.is_ok(), "Set file size finished");
        result
    }
}
