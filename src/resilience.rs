//! Concurrency limits for inbound streams.
//!
//! Every gossip session and cursor holds a [`Bulkhead`] permit for its whole
//! lifetime, so a burst of peers dialing at once cannot exhaust the store's
//! connection pool or the runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), trtl_replica::resilience::BulkheadFull> {
//! use trtl_replica::resilience::Bulkhead;
//!
//! let bulkhead = Bulkhead::new(16);
//! let _permit = bulkhead.acquire().await?;
//! // serve the stream; dropping the permit frees the slot
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned once the bulkhead has been closed by server shutdown.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent streams")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many inbound streams are served at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// A zero limit is raised to one so the server can always make progress.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a free slot. Fails only after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Refuse new streams and fail everyone still queued.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_sessions_still_admits_one() {
        let bulkhead = Bulkhead::new(0);
        assert_eq!(bulkhead.max_concurrent(), 1);
        assert_eq!(bulkhead.available(), 1);
    }

    #[tokio::test]
    async fn extra_stream_queues_until_a_session_ends() {
        let bulkhead = Arc::new(Bulkhead::new(2));
        let first = bulkhead.acquire().await.unwrap();
        let _second = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.available(), 0);

        let queued = tokio::spawn({
            let bulkhead = Arc::clone(&bulkhead);
            async move { bulkhead.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("queued stream admitted")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_fails_queued_streams() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let _held = bulkhead.acquire().await.unwrap();

        let waiter = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move { waiter.acquire().await });
        tokio::task::yield_now().await;

        bulkhead.close();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "bulkhead full: max 1 concurrent streams");
        assert!(bulkhead.acquire().await.is_err());
    }
}
