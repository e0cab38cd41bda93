//! In-process MatchingClient

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::client::*;
use crate::context::MatchContext;
use crate::error::MatchError;
use crate::matcher::{OfferOutcome, TaskMatcher};
use crate::partition::TaskQueueType;
use crate::task::{InternalTask, QueryResponse};

type PartitionKey = (Uuid, String, TaskQueueType);

/// Namespace, partition where the offerer waits, task type, query id
type QueryKey = (Uuid, String, TaskQueueType, String);

/// Routes calls to matchers living in the same process
///
/// Plays the part of the remote partition's request handler: forwarded
/// tasks are offered for sync match only (never persisted), forwarded polls
/// never forward again, and queries handed out through a forwarded poll are
/// held until their answer comes back or their offerer stops waiting.
///
/// Matchers are held weakly; a matcher's forwarder usually owns this client.
///
/// # Example
///
/// ```
/// use everruns_matching::InMemoryMatchingClient;
///
/// let client = InMemoryMatchingClient::new();
/// assert_eq!(client.partition_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryMatchingClient {
    matchers: RwLock<HashMap<PartitionKey, Weak<TaskMatcher>>>,
    pending_queries: Mutex<HashMap<QueryKey, InternalTask>>,
}

impl InMemoryMatchingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a matcher reachable under its partition name
    pub fn register(&self, matcher: &Arc<TaskMatcher>) {
        let partition = matcher.partition();
        let key = (
            partition.namespace_id,
            partition.name.name().to_string(),
            partition.task_type,
        );
        debug!(partition = %partition, "registering in-memory partition");
        self.matchers.write().insert(key, Arc::downgrade(matcher));
    }

    /// Number of registered partitions
    pub fn partition_count(&self) -> usize {
        self.matchers.read().len()
    }

    /// Queries handed to remote pollers and still awaiting an answer
    pub fn pending_query_count(&self) -> usize {
        self.release_abandoned_queries();
        self.pending_queries.lock().len()
    }

    /// Drop held queries whose offerer no longer waits for an answer
    fn release_abandoned_queries(&self) {
        let released: Vec<InternalTask> = {
            let mut pending = self.pending_queries.lock();
            let abandoned: Vec<QueryKey> = pending
                .iter()
                .filter(|(_, task)| task.is_query_abandoned())
                .map(|(key, _)| key.clone())
                .collect();
            abandoned
                .iter()
                .filter_map(|key| pending.remove(key))
                .collect()
        };
        if !released.is_empty() {
            debug!(count = released.len(), "released queries abandoned by their offerer");
        }
    }

    fn matcher(
        &self,
        namespace_id: Uuid,
        task_queue: &TaskQueueRef,
        task_type: TaskQueueType,
    ) -> Result<Arc<TaskMatcher>, TransportError> {
        let key = (namespace_id, task_queue.name.clone(), task_type);
        self.matchers
            .read()
            .get(&key)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::NotFound(format!("{}:{task_type}", task_queue.name)))
    }

    async fn add_task(
        &self,
        ctx: &MatchContext,
        task_type: TaskQueueType,
        request: AddTaskRequest,
    ) -> Result<(), TransportError> {
        let matcher = self.matcher(request.namespace_id, &request.task_queue, task_type)?;
        let task = InternalTask::new(request.task, request.source)
            .with_forwarded_from(request.forwarded_from);

        match matcher.offer(ctx, task).await {
            Ok(OfferOutcome::Matched) => Ok(()),
            Ok(OfferOutcome::Unmatched(_)) => Err(TransportError::SyncMatchFailed),
            Err(err) => Err(to_transport_error(err)),
        }
    }

    async fn poll(
        &self,
        ctx: &MatchContext,
        task_type: TaskQueueType,
        request: PollRequest,
    ) -> Result<PollResponse, TransportError> {
        let matcher = self.matcher(request.namespace_id, &request.task_queue, task_type)?;
        let mut poll_ctx = ctx.clone().with_forwarded_from(request.forwarded_from);
        if let (Some(poller_id), Some(identity)) = (request.poller_id, request.identity) {
            poll_ctx = poll_ctx.with_poller(poller_id, identity);
        }

        let result = if request.query_only {
            matcher.poll_for_query(&poll_ctx).await
        } else {
            matcher.poll(&poll_ctx).await
        };

        let task = match result {
            Ok(task) => task,
            // long poll expired: empty response
            Err(err) if err.is_cancellation() => return Ok(PollResponse::default()),
            Err(err) => return Err(to_transport_error(err)),
        };

        let started = task.to_started(&request.task_queue.name);
        match task.query().map(|(task_id, _)| task_id.to_string()) {
            Some(task_id) => {
                trace!(%task_id, "holding query until the remote poller answers");
                self.release_abandoned_queries();
                let key = (
                    request.namespace_id,
                    request.task_queue.name,
                    task_type,
                    task_id,
                );
                self.pending_queries.lock().insert(key, task);
            }
            None => task.finish(Ok(())),
        }
        Ok(PollResponse {
            task: Some(started),
        })
    }
}

/// Map a matcher error onto the wire
fn to_transport_error(err: MatchError) -> TransportError {
    match err {
        MatchError::Canceled => TransportError::Canceled,
        MatchError::DeadlineExceeded => TransportError::DeadlineExceeded,
        MatchError::ForwarderSlowDown => TransportError::ResourceExhausted(err.to_string()),
        MatchError::RemoteSyncMatchFailed => TransportError::SyncMatchFailed,
        MatchError::Transport(inner) => inner,
        other => TransportError::Internal(other.to_string()),
    }
}

#[async_trait]
impl MatchingClient for InMemoryMatchingClient {
    async fn add_workflow_task(
        &self,
        ctx: &MatchContext,
        request: AddTaskRequest,
    ) -> Result<(), TransportError> {
        self.add_task(ctx, TaskQueueType::Workflow, request).await
    }

    async fn add_activity_task(
        &self,
        ctx: &MatchContext,
        request: AddTaskRequest,
    ) -> Result<(), TransportError> {
        self.add_task(ctx, TaskQueueType::Activity, request).await
    }

    async fn poll_workflow_task(
        &self,
        ctx: &MatchContext,
        request: PollRequest,
    ) -> Result<PollResponse, TransportError> {
        self.poll(ctx, TaskQueueType::Workflow, request).await
    }

    async fn poll_activity_task(
        &self,
        ctx: &MatchContext,
        request: PollRequest,
    ) -> Result<PollResponse, TransportError> {
        self.poll(ctx, TaskQueueType::Activity, request).await
    }

    async fn query_workflow(
        &self,
        ctx: &MatchContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryResponse, TransportError> {
        let matcher = self.matcher(request.namespace_id, &request.task_queue, request.task_type)?;
        let task = InternalTask::new_query(request.task_id, request.query)
            .with_forwarded_from(request.forwarded_from);

        match matcher.offer_query(ctx, task).await {
            Ok(response) => Ok(response.unwrap_or_default()),
            Err(err) => Err(to_transport_error(err)),
        }
    }

    async fn respond_query_task_completed(
        &self,
        _ctx: &MatchContext,
        request: RespondQueryTaskCompletedRequest,
    ) -> Result<(), TransportError> {
        self.release_abandoned_queries();
        let key = (
            request.namespace_id,
            request.task_queue.name,
            request.task_type,
            request.task_id,
        );
        let Some(task) = self.pending_queries.lock().remove(&key) else {
            warn!(task_id = %key.3, partition = %key.1, "answer for unknown query");
            return Err(TransportError::NotFound(key.3));
        };
        task.respond_query(request.completion.into_result());
        Ok(())
    }
}
