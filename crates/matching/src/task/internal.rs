//! The unit of work owned by the matcher

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::trace;

use super::info::{QueryRequest, QueryResponse, QueryTaskInfo, StartedTask, TaskInfo};

/// Outcome reported through a task's completion
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Task was dropped before anyone finished it
    #[error("task abandoned before completion")]
    Abandoned,

    /// Poller or transport reported a failure
    #[error("{0}")]
    Failed(String),
}

/// Where a task entered the matcher from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Replayed from the durable backlog
    Backlog,
    /// Handed over directly by the producer (never persisted)
    Producer,
}

/// Completion callback; invoked exactly once with the task's fate
pub type CompletionFn = Box<dyn FnOnce(Result<(), TaskError>) + Send + Sync + 'static>;

pub(crate) type QueryOutcome = Result<Option<QueryResponse>, TaskError>;

/// What the task carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Workflow or activity task awaiting a poller
    Task(TaskInfo),
    /// Query awaiting a poller
    Query(QueryTaskInfo),
    /// Task matched and started by the parent partition
    Started(StartedTask),
}

enum Completion {
    Callback(CompletionFn),
    Query(oneshot::Sender<QueryOutcome>),
}

/// A task moving through the matcher
///
/// Ownership follows the task: the producer hands it to the matcher, the
/// matcher hands it to exactly one poller. Completion fires exactly once:
/// through [`finish`](Self::finish) / [`respond_query`](Self::respond_query),
/// or with [`TaskError::Abandoned`] when the task is dropped unfinished.
pub struct InternalTask {
    payload: TaskPayload,
    source: TaskSource,
    forwarded_from: Option<String>,
    completion: Option<Completion>,
    started: bool,
    finished: bool,
}

impl InternalTask {
    /// Create a workflow or activity task
    pub fn new(info: TaskInfo, source: TaskSource) -> Self {
        Self::with_payload(TaskPayload::Task(info), source)
    }

    /// Create a query task
    pub fn new_query(task_id: impl Into<String>, request: QueryRequest) -> Self {
        Self::with_payload(
            TaskPayload::Query(QueryTaskInfo {
                task_id: task_id.into(),
                request,
            }),
            TaskSource::Producer,
        )
    }

    /// Wrap a task the parent partition already started
    pub fn new_started(started: StartedTask) -> Self {
        let mut task = Self::with_payload(TaskPayload::Started(started), TaskSource::Producer);
        task.started = true;
        task
    }

    fn with_payload(payload: TaskPayload, source: TaskSource) -> Self {
        Self {
            payload,
            source,
            forwarded_from: None,
            completion: None,
            started: false,
            finished: false,
        }
    }

    /// Register the completion callback
    pub fn with_completion<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Result<(), TaskError>) + Send + Sync + 'static,
    {
        self.completion = Some(Completion::Callback(Box::new(f)));
        self
    }

    /// Mark the task as received from a child partition
    pub fn with_forwarded_from(mut self, partition: impl Into<String>) -> Self {
        self.forwarded_from = Some(partition.into());
        self
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub fn source(&self) -> TaskSource {
        self.source
    }

    /// Child partition this task was forwarded from
    pub fn forwarded_from(&self) -> Option<&str> {
        self.forwarded_from.as_deref()
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_from.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the task was obtained through a forwarded poll
    pub fn is_remote(&self) -> bool {
        matches!(self.payload, TaskPayload::Started(_))
    }

    pub fn is_query(&self) -> bool {
        matches!(
            self.payload,
            TaskPayload::Query(_) | TaskPayload::Started(StartedTask::Query { .. })
        )
    }

    /// Task description, for workflow and activity tasks
    pub fn info(&self) -> Option<&TaskInfo> {
        match &self.payload {
            TaskPayload::Task(info) | TaskPayload::Started(StartedTask::Task { info }) => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Query id and request, for query tasks
    pub fn query(&self) -> Option<(&str, &QueryRequest)> {
        match &self.payload {
            TaskPayload::Query(q) => Some((&q.task_id, &q.request)),
            TaskPayload::Started(StartedTask::Query {
                task_id, request, ..
            }) => Some((task_id, request)),
            _ => None,
        }
    }

    /// Started task shape handed to a poller of a child partition
    pub fn to_started(&self, partition: &str) -> StartedTask {
        match &self.payload {
            TaskPayload::Task(info) => StartedTask::Task { info: info.clone() },
            TaskPayload::Query(q) => StartedTask::Query {
                task_id: q.task_id.clone(),
                request: q.request.clone(),
                partition: partition.to_string(),
            },
            TaskPayload::Started(started) => started.clone(),
        }
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn attach_query_responder(&mut self, tx: oneshot::Sender<QueryOutcome>) {
        self.completion = Some(Completion::Query(tx));
    }

    /// Whether the offerer of this query stopped waiting for its answer
    pub(crate) fn is_query_abandoned(&self) -> bool {
        matches!(&self.completion, Some(Completion::Query(tx)) if tx.is_closed())
    }

    /// Report the task's fate and consume it
    ///
    /// For a locally offered query, `Ok(())` releases the offerer without an
    /// answer; use [`respond_query`](Self::respond_query) to send one.
    pub fn finish(mut self, result: Result<(), TaskError>) {
        self.complete(result.map(|()| None));
    }

    /// Answer a locally offered query and consume the task
    pub fn respond_query(mut self, outcome: Result<QueryResponse, TaskError>) {
        self.complete(outcome.map(Some));
    }

    fn complete(&mut self, outcome: QueryOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.completion.take() {
            Some(Completion::Callback(f)) => f(outcome.map(|_| ())),
            Some(Completion::Query(tx)) => {
                // Offerer may have given up already
                let _ = tx.send(outcome);
            }
            None => {}
        }
    }
}

impl Drop for InternalTask {
    fn drop(&mut self) {
        if !self.finished && self.completion.is_some() {
            trace!(forwarded_from = ?self.forwarded_from, "task dropped unfinished");
            self.complete(Err(TaskError::Abandoned));
        }
    }
}

impl std::fmt::Debug for InternalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalTask")
            .field("payload", &self.payload)
            .field("source", &self.source)
            .field("forwarded_from", &self.forwarded_from)
            .field("has_completion", &self.completion.is_some())
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use uuid::Uuid;

    use super::*;
    use crate::task::Payload;

    fn task_info() -> TaskInfo {
        TaskInfo::new(Uuid::now_v7(), "wf-1", Uuid::now_v7(), 3)
    }

    type LastResult = Arc<Mutex<Option<Result<(), TaskError>>>>;

    fn counting_task(calls: &Arc<AtomicUsize>, last: &LastResult) -> InternalTask {
        let calls = Arc::clone(calls);
        let last = Arc::clone(last);
        InternalTask::new(task_info(), TaskSource::Backlog).with_completion(move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            *last.lock().unwrap() = Some(result);
        })
    }

    #[test]
    fn test_finish_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));
        let task = counting_task(&calls, &last);

        task.finish(Ok(()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn test_drop_reports_abandoned() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));
        drop(counting_task(&calls, &last));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), Some(Err(TaskError::Abandoned)));
    }

    #[test]
    fn test_forwarded_flag() {
        let task = InternalTask::new(task_info(), TaskSource::Producer);
        assert!(!task.is_forwarded());

        let task = task.with_forwarded_from("/_sys/tq/1");
        assert!(task.is_forwarded());
        assert_eq!(task.forwarded_from(), Some("/_sys/tq/1"));
    }

    #[test]
    fn test_started_task_is_remote() {
        let task = InternalTask::new_started(StartedTask::Task { info: task_info() });
        assert!(task.is_started());
        assert!(task.is_remote());
        assert!(!task.is_query());
        assert!(task.info().is_some());
    }

    #[tokio::test]
    async fn test_query_responder_receives_answer() {
        let (tx, rx) = oneshot::channel();
        let mut task = InternalTask::new_query("q-1", QueryRequest::new("wf-1", "state"));
        task.attach_query_responder(tx);
        assert!(task.is_query());

        let answer = QueryResponse::new(Payload::encode("answer").unwrap());
        task.respond_query(Ok(answer.clone()));

        assert_eq!(rx.await.unwrap(), Ok(Some(answer)));
    }

    #[tokio::test]
    async fn test_query_finish_without_answer() {
        let (tx, rx) = oneshot::channel();
        let mut task = InternalTask::new_query("q-1", QueryRequest::new("wf-1", "state"));
        task.attach_query_responder(tx);

        task.finish(Ok(()));
        assert_eq!(rx.await.unwrap(), Ok(None));
    }

    #[tokio::test]
    async fn test_dropped_query_releases_offerer() {
        let (tx, rx) = oneshot::channel();
        let mut task = InternalTask::new_query("q-1", QueryRequest::new("wf-1", "state"));
        task.attach_query_responder(tx);

        drop(task);
        assert_eq!(rx.await.unwrap(), Err(TaskError::Abandoned));
    }

    #[test]
    fn test_to_started_keeps_origin_partition() {
        let task = InternalTask::new_query("q-9", QueryRequest::new("wf-1", "state"));
        match task.to_started("tq") {
            StartedTask::Query {
                task_id, partition, ..
            } => {
                assert_eq!(task_id, "q-9");
                assert_eq!(partition, "tq");
            }
            other => panic!("unexpected started task: {other:?}"),
        }
    }
}
