//! Rate limiter whose rate can be changed at runtime

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;

use crate::context::MatchContext;
use crate::error::MatchError;

/// Token-bucket limiter (burst = rate) that can be resized
///
/// `None` means unlimited, `Some(0)` admits nothing.
pub(crate) struct DynamicRateLimiter {
    state: RwLock<LimiterState>,
}

#[derive(Clone)]
struct LimiterState {
    rate: Option<u32>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl LimiterState {
    fn build(rate: Option<u32>) -> Self {
        let limiter = rate
            .and_then(NonZeroU32::new)
            .map(|per_second| Arc::new(RateLimiter::direct(Quota::per_second(per_second))));
        Self { rate, limiter }
    }
}

impl DynamicRateLimiter {
    pub(crate) fn new(rate: Option<u32>) -> Self {
        Self {
            state: RwLock::new(LimiterState::build(rate)),
        }
    }

    pub(crate) fn rate(&self) -> Option<u32> {
        self.state.read().rate
    }

    /// Change the rate; a no-op when unchanged so the bucket keeps its state
    pub(crate) fn set_rate(&self, rate: Option<u32>) {
        if self.state.read().rate == rate {
            return;
        }
        let mut state = self.state.write();
        if state.rate != rate {
            *state = LimiterState::build(rate);
        }
    }

    /// Take one permit if available right now
    pub(crate) fn allow(&self) -> bool {
        let state = self.state.read().clone();
        match (state.rate, state.limiter) {
            (None, _) => true,
            (Some(_), Some(limiter)) => limiter.check().is_ok(),
            (Some(_), None) => false,
        }
    }

    /// Wait for one permit or until the context is done
    pub(crate) async fn wait(&self, ctx: &MatchContext) -> Result<(), MatchError> {
        let state = self.state.read().clone();
        match (state.rate, state.limiter) {
            (None, _) => Ok(()),
            (Some(_), Some(limiter)) => tokio::select! {
                _ = limiter.until_ready() => Ok(()),
                err = ctx.done() => Err(err),
            },
            (Some(_), None) => Err(ctx.done().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_unlimited_always_allows() {
        let limiter = DynamicRateLimiter::new(None);
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = DynamicRateLimiter::new(Some(2));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_zero_rate_rejects() {
        let limiter = DynamicRateLimiter::new(Some(0));
        assert!(!limiter.allow());
    }

    #[test]
    fn test_set_rate_rebuilds_only_on_change() {
        let limiter = DynamicRateLimiter::new(Some(1));
        assert!(limiter.allow());
        assert!(!limiter.allow());

        // same rate keeps the drained bucket
        limiter.set_rate(Some(1));
        assert!(!limiter.allow());

        limiter.set_rate(Some(5));
        assert_eq!(limiter.rate(), Some(5));
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let limiter = DynamicRateLimiter::new(Some(0));
        let ctx = MatchContext::with_timeout(Duration::from_millis(20));
        let err = limiter.wait(&ctx).await.unwrap_err();
        assert!(matches!(err, MatchError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_wait_admits_within_rate() {
        let limiter = DynamicRateLimiter::new(Some(100));
        let ctx = MatchContext::with_timeout(Duration::from_secs(1));
        assert!(limiter.wait(&ctx).await.is_ok());
    }
}
