//! Task payloads exchanged between producers, pollers and partitions

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload encoding errors
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Payload was written with an encoding this crate cannot read
    #[error("unsupported payload encoding: {0}")]
    UnsupportedEncoding(String),

    /// JSON encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque, self-describing value carried by queries and their results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Encoding of `data`
    pub encoding: String,
    /// Encoded bytes
    pub data: Vec<u8>,
}

impl Payload {
    /// Encoding tag for JSON payloads
    pub const JSON: &'static str = "json/plain";

    /// Encode a value as JSON
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, PayloadError> {
        Ok(Self {
            encoding: Self::JSON.to_string(),
            data: serde_json::to_vec(value)?,
        })
    }

    /// Decode a JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        if self.encoding != Self::JSON {
            return Err(PayloadError::UnsupportedEncoding(self.encoding.clone()));
        }
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Immutable description of a workflow or activity task
///
/// This is what a poller needs to start working on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub namespace_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Event id of the scheduling event in the workflow history
    pub schedule_id: i64,
    /// Backlog id (0 for tasks that were never persisted)
    pub task_id: i64,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Describe a freshly scheduled task
    pub fn new(
        namespace_id: Uuid,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        schedule_id: i64,
    ) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
            schedule_id,
            task_id: 0,
            attempt: 1,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Set the backlog id
    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = task_id;
        self
    }

    /// Set the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the expiry time
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the task expired before being dispatched
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Query against a running workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub workflow_id: String,
    pub run_id: Option<Uuid>,
    pub query_type: String,
    pub query_args: Option<Payload>,
}

impl QueryRequest {
    /// Create a query without arguments
    pub fn new(workflow_id: impl Into<String>, query_type: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: None,
            query_type: query_type.into(),
            query_args: None,
        }
    }

    /// Attach encoded arguments
    pub fn with_args(mut self, args: Payload) -> Self {
        self.query_args = Some(args);
        self
    }
}

/// Answer to a query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_result: Option<Payload>,
}

impl QueryResponse {
    /// Wrap an encoded result
    pub fn new(result: Payload) -> Self {
        Self {
            query_result: Some(result),
        }
    }
}

/// Query as it sits in a partition's rendezvous
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTaskInfo {
    /// Id used to route the answer back to the waiting offerer
    pub task_id: String,
    pub request: QueryRequest,
}

/// Work already matched and started by a parent partition
///
/// Returned by forwarded polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartedTask {
    /// A workflow or activity task
    Task { info: TaskInfo },
    /// A query; its answer goes back to `partition`
    Query {
        task_id: String,
        request: QueryRequest,
        /// Partition where the query offerer is waiting
        partition: String,
    },
}
