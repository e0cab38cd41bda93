//! MatchingClient trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::MatchContext;
use crate::partition::{TaskQueueKind, TaskQueueType};
use crate::task::{QueryRequest, QueryResponse, StartedTask, TaskError, TaskInfo, TaskSource};

/// Error type for calls to another partition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Remote side is overloaded or throttling this caller
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Remote side could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Remote partition had no poller for the task
    #[error("remote sync match failed")]
    SyncMatchFailed,

    /// Target partition or query is unknown to the remote side
    #[error("not found: {0}")]
    NotFound(String),

    /// Call was canceled
    #[error("call canceled")]
    Canceled,

    /// Call deadline passed
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// Any other remote failure
    #[error("internal error: {0}")]
    Internal(String),
}

/// Task queue addressed by a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueRef {
    /// Full partition name
    pub name: String,
    #[serde(default)]
    pub kind: TaskQueueKind,
}

impl TaskQueueRef {
    pub fn new(name: impl Into<String>, kind: TaskQueueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Hand a task to another partition for sync match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub namespace_id: Uuid,
    pub task_queue: TaskQueueRef,
    pub task: TaskInfo,
    pub source: TaskSource,
    /// Partition the task was forwarded from
    pub forwarded_from: String,
}

/// Long-poll another partition on behalf of a local poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub namespace_id: Uuid,
    pub task_queue: TaskQueueRef,
    pub poller_id: Option<String>,
    pub identity: Option<String>,
    /// Only accept query tasks
    #[serde(default)]
    pub query_only: bool,
    /// Partition the poll was forwarded from
    pub forwarded_from: String,
}

/// Result of a poll; `task` is empty when the poll timed out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub task: Option<StartedTask>,
}

impl PollResponse {
    pub fn is_empty(&self) -> bool {
        self.task.is_none()
    }
}

/// Offer a query to another partition and wait for its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWorkflowRequest {
    pub namespace_id: Uuid,
    pub task_queue: TaskQueueRef,
    pub task_type: TaskQueueType,
    pub task_id: String,
    pub query: QueryRequest,
    /// Partition the query was forwarded from
    pub forwarded_from: String,
}

/// How a poller finished a query it received through a forwarded poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryCompletion {
    Answered { response: QueryResponse },
    Failed { error: String },
}

impl From<Result<QueryResponse, TaskError>> for QueryCompletion {
    fn from(outcome: Result<QueryResponse, TaskError>) -> Self {
        match outcome {
            Ok(response) => Self::Answered { response },
            Err(err) => Self::Failed {
                error: err.to_string(),
            },
        }
    }
}

impl QueryCompletion {
    pub fn into_result(self) -> Result<QueryResponse, TaskError> {
        match self {
            Self::Answered { response } => Ok(response),
            Self::Failed { error } => Err(TaskError::Failed(error)),
        }
    }
}

/// Relay a query answer to the partition where the offerer waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespondQueryTaskCompletedRequest {
    pub namespace_id: Uuid,
    pub task_queue: TaskQueueRef,
    pub task_type: TaskQueueType,
    pub task_id: String,
    pub completion: QueryCompletion,
}

/// Calls a partition makes on other partitions of the same queue
///
/// Implementations must honor the context: return promptly with
/// [`TransportError::Canceled`] or [`TransportError::DeadlineExceeded`]
/// once it is done.
#[async_trait]
pub trait MatchingClient: Send + Sync + 'static {
    /// Sync-match a workflow task on the target partition
    async fn add_workflow_task(
        &self,
        ctx: &MatchContext,
        request: AddTaskRequest,
    ) -> Result<(), TransportError>;

    /// Sync-match an activity task on the target partition
    async fn add_activity_task(
        &self,
        ctx: &MatchContext,
        request: AddTaskRequest,
    ) -> Result<(), TransportError>;

    /// Poll the target partition for a workflow task or query
    async fn poll_workflow_task(
        &self,
        ctx: &MatchContext,
        request: PollRequest,
    ) -> Result<PollResponse, TransportError>;

    /// Poll the target partition for an activity task
    async fn poll_activity_task(
        &self,
        ctx: &MatchContext,
        request: PollRequest,
    ) -> Result<PollResponse, TransportError>;

    /// Offer a query on the target partition and wait for the answer
    async fn query_workflow(
        &self,
        ctx: &MatchContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryResponse, TransportError>;

    /// Deliver the answer to a query obtained through a forwarded poll
    async fn respond_query_task_completed(
        &self,
        ctx: &MatchContext,
        request: RespondQueryTaskCompletedRequest,
    ) -> Result<(), TransportError>;
}
