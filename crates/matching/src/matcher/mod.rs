//! Per-partition matching
//!
//! This module provides:
//! - [`TaskMatcher`] - pairs tasks and queries with pollers on one partition
//! - [`OfferOutcome`] - result of a non-blocking offer
//! - [`MatcherMetrics`] - match and forwarding counters
//!
//! ```text
//!   producer ──offer/must_offer──┐          ┌──poll/poll_for_query── poller
//!                                ▼          ▼
//!                           ┌──────────────────┐
//!                           │   TaskMatcher    │
//!                           │ tasks | queries  │
//!                           └────────┬─────────┘
//!                                    │ no local pairing
//!                                    ▼
//!                              Forwarder ──► parent partition
//! ```

mod metrics;
mod rendezvous;
mod task_matcher;

pub use metrics::{MatcherMetrics, MatcherMetricsSnapshot};
pub use task_matcher::{OfferOutcome, TaskMatcher};
