//! Tasks and query tasks
//!
//! This module provides:
//! - [`InternalTask`] - the unit of work handed from producer to poller
//! - [`TaskInfo`] / [`QueryRequest`] / [`StartedTask`] - payload shapes
//! - [`Payload`] - JSON-encoded query arguments and results

mod info;
mod internal;

pub use info::{
    Payload, PayloadError, QueryRequest, QueryResponse, QueryTaskInfo, StartedTask, TaskInfo,
};
pub use internal::{CompletionFn, InternalTask, TaskError, TaskPayload, TaskSource};

pub(crate) use internal::QueryOutcome;
