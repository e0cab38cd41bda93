//! Matcher counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters kept by one [`TaskMatcher`](super::TaskMatcher)
#[derive(Debug, Default)]
pub struct MatcherMetrics {
    /// Tasks and queries paired with a local poller
    local_matches: AtomicU64,
    /// Tasks and queries accepted by the parent partition
    forwarded_matches: AtomicU64,
    /// Forward attempts that failed for reasons other than throttling
    forward_errors: AtomicU64,
    /// Forward attempts rejected by a rate limit
    throttled_forwards: AtomicU64,
    /// Polls sent to the parent partition
    forwarded_polls: AtomicU64,
    /// Offers that gave up waiting on the dispatch rate limit
    dispatch_throttled: AtomicU64,
}

/// Point-in-time copy of [`MatcherMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherMetricsSnapshot {
    pub local_matches: u64,
    pub forwarded_matches: u64,
    pub forward_errors: u64,
    pub throttled_forwards: u64,
    pub forwarded_polls: u64,
    pub dispatch_throttled: u64,
}

impl MatcherMetrics {
    pub(crate) fn record_local_match(&self) {
        self.local_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded_match(&self) {
        self.forwarded_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forward_error(&self) {
        self.forward_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled_forward(&self) {
        self.throttled_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded_poll(&self) {
        self.forwarded_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch_throttled(&self) {
        self.dispatch_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> MatcherMetricsSnapshot {
        MatcherMetricsSnapshot {
            local_matches: self.local_matches.load(Ordering::Relaxed),
            forwarded_matches: self.forwarded_matches.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            throttled_forwards: self.throttled_forwards.load(Ordering::Relaxed),
            forwarded_polls: self.forwarded_polls.load(Ordering::Relaxed),
            dispatch_throttled: self.dispatch_throttled.load(Ordering::Relaxed),
        }
    }
}
