//! RAII guard over a range-lock token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::domain::ports::{RangeLock, RangeToken};
use crate::error::{Error, Result};

/// A held byte range, released when dropped.
pub(crate) struct HeldRange {
    lock: Arc<dyn RangeLock>,
    token: Option<RangeToken>,
}

impl HeldRange {
    /// Acquire `[offset, offset + length)`, giving up if `cancel` fires first.
    pub(crate) async fn acquire(
        lock: &Arc<dyn RangeLock>,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(offset, length, "Range acquire cancelled");
                return Err(Error::Cancelled);
            }
            token = lock.acquire(offset, length) => token,
        };

        Ok(Self {
            lock: Arc::clone(lock),
            token: Some(token),
        })
    }
}

impl Drop for HeldRange {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.lock.release(token);
        }
    }
}
