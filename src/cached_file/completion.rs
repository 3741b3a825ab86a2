//! Request pool and completion handles.
//!
//! Every request object holds a [`RequestSlot`] drawn from its file's
//! bounded [`RequestPool`]. Once started, a request runs as a spawned task
//! and its outcome is delivered through a [`Completion`], which hands the
//! request object back for reuse.

use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

// =============================================================================
// Request Pool
// =============================================================================

/// Bounded pool of request slots.
#[derive(Debug, Clone)]
pub struct RequestPool {
    permits: Arc<Semaphore>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Take a slot without waiting.
    ///
    /// Fails with `Error::InsufficientResources` when the pool is exhausted.
    pub fn try_allocate(&self) -> Result<RequestSlot> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map(RequestSlot)
            .map_err(|_| Error::InsufficientResources)
    }

    /// Slots not held by any live request object.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// One unit of pool capacity, returned when dropped.
#[derive(Debug)]
pub struct RequestSlot(OwnedSemaphorePermit);

// =============================================================================
// Completion
// =============================================================================

/// Handle to a started request.
///
/// Awaiting the handle yields the request's result. Dropping it detaches the
/// request, which still runs to completion and releases everything it holds.
#[derive(Debug)]
#[must_use = "dropping a completion detaches the request"]
pub struct Completion<T, R> {
    handle: JoinHandle<(Result<T>, R)>,
    cancel: CancellationToken,
}

impl<T, R> Completion<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn spawn<F>(cancel: CancellationToken, request: F) -> Self
    where
        F: Future<Output = (Result<T>, R)> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(request),
            cancel,
        }
    }

    /// Request cancellation.
    ///
    /// Honored only while the request waits for a range or for a physical
    /// transfer to be issued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result and take back the request object.
    ///
    /// The request is `None` only if its task was torn down by runtime
    /// shutdown. A panic inside the request is resumed on the caller.
    pub async fn wait_and_reclaim(self) -> (Result<T>, Option<R>) {
        match self.handle.await {
            Ok((result, request)) => (result, Some(request)),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => (
                Err(Error::Internal(format!("request task failed: {}", e))),
                None,
            ),
        }
    }
}

impl<T, R> IntoFuture for Completion<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait_and_reclaim().await.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_pool_exhaustion() {
        let pool = RequestPool::new(2);
        let a = pool.try_allocate().unwrap();
        let _b = pool.try_allocate().unwrap();
        assert_eq!(pool.available(), 0);
        assert_matches!(pool.try_allocate(), Err(Error::InsufficientResources));

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_allocate().is_ok());
    }

    #[tokio::test]
    async fn test_completion_returns_request() {
        let completion = Completion::spawn(CancellationToken::new(), async { (Ok(7u32), "request") });
        let (result, request) = completion.wait_and_reclaim().await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(request, Some("request"));
    }

    #[tokio::test]
    async fn test_completion_cancel_reaches_request() {
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        let completion = Completion::spawn(cancel, async move {
            observed.cancelled().await;
            (Err::<(), _>(Error::Cancelled), ())
        });

        completion.cancel();
        assert_matches!(completion.await, Err(Error::Cancelled));
    }

    #[tokio::test]
    #[should_panic(expected = "length mismatch")]
    async fn test_completion_resumes_panic() {
        let completion = Completion::spawn(CancellationToken::new(), async {
            if true {
                panic!("length mismatch");
            }
            (Ok(()), ())
        });
        let _ = completion.await;
    }
}
