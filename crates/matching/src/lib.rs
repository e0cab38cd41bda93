//! # Task Queue Matching
//!
//! Synchronous hand-off between task producers and long-polling workers for
//! one partition of a partitioned task queue.
//!
//! ## Features
//!
//! - **Sync match**: tasks and queries go straight to a waiting poller, no
//!   persistence involved
//! - **Partition tree**: unmatched tasks, polls and queries are forwarded one
//!   hop towards the root partition
//! - **Bounded forwarding**: token pools cap outstanding forwards, a rate
//!   limiter caps forwards per second
//! - **Backlog fallback**: an unmatched offer hands the task back for
//!   persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskMatcher                          │
//! │  (rendezvous of tasks, queries and pollers on a partition)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Forwarder                           │
//! │  (token pools, rate limit, single hop to the parent)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MatchingClient                         │
//! │  (transport to other partitions; in-memory for one process) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use everruns_matching::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use uuid::Uuid;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ns = Uuid::now_v7();
//! let config = ConfigHandle::new(MatcherConfig::new())?;
//! let matcher = Arc::new(TaskMatcher::new(
//!     PartitionId::new(ns, "orders", TaskQueueType::Workflow)?,
//!     config,
//!     None,
//! ));
//!
//! let poller = {
//!     let matcher = Arc::clone(&matcher);
//!     tokio::spawn(async move {
//!         matcher.poll(&MatchContext::with_timeout(Duration::from_secs(1))).await
//!     })
//! };
//! while matcher.waiting_pollers() == 0 {
//!     tokio::task::yield_now().await;
//! }
//!
//! let task = InternalTask::new(TaskInfo::new(ns, "wf-1", Uuid::now_v7(), 3), TaskSource::Producer);
//! let outcome = matcher.offer(&MatchContext::new(), task).await?;
//! assert!(outcome.is_matched());
//! assert!(poller.await??.is_started());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod matcher;
pub mod partition;
pub mod task;
pub mod transport;

mod limiter;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigHandle, MatcherConfig};
    pub use crate::context::MatchContext;
    pub use crate::error::MatchError;
    pub use crate::forwarder::Forwarder;
    pub use crate::matcher::{OfferOutcome, TaskMatcher};
    pub use crate::partition::{PartitionId, TaskQueueKind, TaskQueueType};
    pub use crate::task::{
        InternalTask, QueryRequest, QueryResponse, TaskError, TaskInfo, TaskSource,
    };
    pub use crate::transport::{InMemoryMatchingClient, MatchingClient};
}

// Re-export key types at crate root
pub use config::{ConfigError, ConfigHandle, MatcherConfig};
pub use context::MatchContext;
pub use error::MatchError;
pub use forwarder::{ForwardToken, ForwardTokenPool, Forwarder};
pub use matcher::{MatcherMetrics, MatcherMetricsSnapshot, OfferOutcome, TaskMatcher};
pub use partition::{
    PartitionError, PartitionId, TaskQueueKind, TaskQueueName, TaskQueueType, PARTITION_PREFIX,
};
pub use task::{
    InternalTask, Payload, PayloadError, QueryRequest, QueryResponse, StartedTask, TaskError,
    TaskInfo, TaskPayload, TaskSource,
};
pub use transport::{InMemoryMatchingClient, MatchingClient, TransportError};
