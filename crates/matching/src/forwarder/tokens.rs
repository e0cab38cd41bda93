//! Forward token pools
//!
//! Counting semaphores bounding how many forwarded calls of one kind may be
//! outstanding to the parent partition at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::MatchContext;
use crate::error::MatchError;

/// Fixed-capacity pool of forward tokens
#[derive(Debug)]
pub struct ForwardTokenPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ForwardTokenPool {
    /// Create a pool with `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Configured number of tokens
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a token if one is free right now
    pub fn try_acquire(&self) -> Option<ForwardToken> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ForwardToken { _permit: permit })
    }

    /// Wait for a token or until the context is done
    pub async fn acquire(&self, ctx: &MatchContext) -> Result<ForwardToken, MatchError> {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::select! {
            permit = semaphore.acquire_owned() => permit
                .map(|permit| ForwardToken { _permit: permit })
                .map_err(|_| MatchError::Canceled),
            err = ctx.done() => Err(err),
        }
    }
}

/// One unit of forwarding capacity
///
/// Returned to its pool when released or dropped, so every exit path gives
/// it back exactly once.
#[derive(Debug)]
pub struct ForwardToken {
    _permit: OwnedSemaphorePermit,
}

impl ForwardToken {
    /// Return the token to its pool
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_try_acquire_until_drained() {
        let pool = ForwardTokenPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        a.release();
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let pool = ForwardTokenPool::new(1);
        {
            let _token = pool.try_acquire().unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_capacity_pool() {
        let pool = ForwardTokenPool::new(0);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(ForwardTokenPool::new(1));
        let held = pool.try_acquire().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            held.release();
        });

        let ctx = MatchContext::with_timeout(Duration::from_secs(1));
        assert!(pool.acquire(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let pool = ForwardTokenPool::new(1);
        let _held = pool.try_acquire().unwrap();

        let ctx = MatchContext::new();
        ctx.cancel();
        let err = pool.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, MatchError::Canceled));
        assert_eq!(pool.available(), 0);
    }
}
