//! In-Memory Range Lock
//!
//! Reference [`RangeLock`] granting exclusive access to byte ranges of one
//! file. A request is granted as soon as it overlaps no held range. Queued
//! waiters never block a request, so a caller holding one range can always
//! obtain a second disjoint one once the holders release. On release the
//! queue is scanned in arrival order.
//!
//! ```text
//!   held:     [0 ─────── 100)
//!   waiters:        [50 ──────── 150)   (blocked by held)
//!                                 [120 ── 200)   (granted at once)
//! ```

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::domain::ports::{RangeLock, RangeToken};

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u64,
    end: u64,
}

impl Span {
    fn new(offset: u64, length: u64) -> Self {
        Self {
            start: offset,
            end: offset.saturating_add(length),
        }
    }

    #[inline]
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

struct Waiter {
    id: u64,
    span: Span,
    granted: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    next_id: u64,
    held: HashMap<u64, Span>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn conflicts(&self, span: &Span) -> bool {
        self.held.values().any(|held| held.overlaps(span))
    }

    /// Grant every waiter that no longer conflicts, in arrival order.
    fn dispatch(&mut self) {
        let mut index = 0;
        while index < self.waiters.len() {
            let span = self.waiters[index].span;
            if self.conflicts(&span) {
                index += 1;
                continue;
            }

            if let Some(waiter) = self.waiters.remove(index) {
                // A failed send means the acquirer is gone
                if waiter.granted.send(()).is_ok() {
                    self.held.insert(waiter.id, waiter.span);
                }
            }
        }
    }

    /// Forget an abandoned acquire, whether still queued or already granted.
    fn abandon(&mut self, id: u64) {
        if let Some(position) = self.waiters.iter().position(|waiter| waiter.id == id) {
            self.waiters.remove(position);
        } else {
            self.held.remove(&id);
        }
        self.dispatch();
    }
}

/// Byte-range lock for a single file.
#[derive(Default)]
pub struct InMemoryRangeLock {
    state: Mutex<LockState>,
}

impl InMemoryRangeLock {
    /// Create a new lock with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranges currently held.
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Number of acquires currently waiting.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Cleans up an acquire whose future is dropped before completion.
struct PendingAcquire<'a> {
    lock: &'a InMemoryRangeLock,
    id: u64,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!(id = self.id, "Range acquire abandoned");
            self.lock.state.lock().abandon(self.id);
        }
    }
}

#[async_trait]
impl RangeLock for InMemoryRangeLock {
    async fn acquire(&self, offset: u64, length: u64) -> RangeToken {
        let span = Span::new(offset, length);
        let (id, granted) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            if !state.conflicts(&span) {
                state.held.insert(id, span);
                return RangeToken::new(id, offset, length);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                span,
                granted: tx,
            });
            (id, rx)
        };

        trace!(id, offset, length, "Waiting for overlapping range");
        let mut pending = PendingAcquire {
            lock: self,
            id,
            armed: true,
        };
        // Senders are only dropped unsent by our own abandon path
        let _ = granted.await;
        pending.armed = false;

        RangeToken::new(id, offset, length)
    }

    fn release(&self, token: RangeToken) {
        let mut state = self.state.lock();
        state.held.remove(&token.id());
        state.dispatch();
    }
}

// =============================================================================
// Tests
// =============================================================================
