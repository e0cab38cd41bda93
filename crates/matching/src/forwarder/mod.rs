//! Forwarding to the parent partition
//!
//! This module provides:
//! - [`Forwarder`] - sends unmatched tasks, polls and queries one hop up
//! - [`ForwardTokenPool`] / [`ForwardToken`] - bounds on outstanding forwards
//!
//! ```text
//!            root (tq)
//!           /    |    \
//!  /_sys/tq/1  ...  /_sys/tq/20      degree = 20
//!       |
//!  /_sys/tq/21 ...                   parent((p + degree - 1) / degree - 1)
//! ```
//!
//! Forwarding is single-hop: a partition never forwards anything that
//! already arrived from a child.

mod tokens;

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, instrument, trace};

use crate::config::ConfigHandle;
use crate::context::MatchContext;
use crate::error::MatchError;
use crate::limiter::DynamicRateLimiter;
use crate::partition::{PartitionId, TaskQueueKind, TaskQueueType};
use crate::task::{InternalTask, QueryResponse, TaskError};
use crate::transport::{
    AddTaskRequest, MatchingClient, PollRequest, QueryWorkflowRequest,
    RespondQueryTaskCompletedRequest, TaskQueueRef, TransportError,
};

pub use tokens::{ForwardToken, ForwardTokenPool};

/// Forwards work from one partition to its parent
///
/// Token acquisition is the caller's job; the forwarder only checks the
/// rate limit and performs the call.
pub struct Forwarder {
    partition: PartitionId,
    config: ConfigHandle,
    client: Arc<dyn MatchingClient>,
    add_tokens: RwLock<Arc<ForwardTokenPool>>,
    poll_tokens: RwLock<Arc<ForwardTokenPool>>,
    limiter: DynamicRateLimiter,
}

impl Forwarder {
    /// Create a forwarder for `partition`
    pub fn new(
        partition: PartitionId,
        config: ConfigHandle,
        client: Arc<dyn MatchingClient>,
    ) -> Self {
        let current = config.current();
        Self {
            add_tokens: RwLock::new(Arc::new(ForwardTokenPool::new(
                current.forwarder_max_outstanding_tasks,
            ))),
            poll_tokens: RwLock::new(Arc::new(ForwardTokenPool::new(
                current.forwarder_max_outstanding_polls,
            ))),
            limiter: DynamicRateLimiter::new(Some(current.forwarder_max_rate_per_second)),
            partition,
            config,
            client,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Pool gating forwarded tasks and queries
    ///
    /// Rebuilt when the configured limit changes; tokens of the old pool
    /// return to it harmlessly.
    pub fn add_token_pool(&self) -> Arc<ForwardTokenPool> {
        let limit = self.config.current().forwarder_max_outstanding_tasks;
        Self::refresh_pool(&self.add_tokens, limit, "add")
    }

    /// Pool gating forwarded polls
    pub fn poll_token_pool(&self) -> Arc<ForwardTokenPool> {
        let limit = self.config.current().forwarder_max_outstanding_polls;
        Self::refresh_pool(&self.poll_tokens, limit, "poll")
    }

    fn refresh_pool(
        slot: &RwLock<Arc<ForwardTokenPool>>,
        limit: usize,
        kind: &'static str,
    ) -> Arc<ForwardTokenPool> {
        {
            let pool = slot.read();
            if pool.capacity() == limit {
                return Arc::clone(&pool);
            }
        }
        let mut pool = slot.write();
        if pool.capacity() != limit {
            debug!(kind, old = pool.capacity(), new = limit, "resizing forward token pool");
            *pool = Arc::new(ForwardTokenPool::new(limit));
        }
        Arc::clone(&pool)
    }

    /// Parent partition name, if this partition may forward at all
    fn parent_name(&self) -> Result<String, MatchError> {
        if self.partition.kind == TaskQueueKind::Sticky {
            return Err(MatchError::ForwardingUnsupported);
        }
        let degree = self.config.current().forwarder_max_children_per_node;
        self.partition.parent(degree).ok_or(MatchError::NoParent)
    }

    fn parent_ref(&self) -> Result<TaskQueueRef, MatchError> {
        Ok(TaskQueueRef::new(self.parent_name()?, self.partition.kind))
    }

    fn admit(&self) -> Result<(), MatchError> {
        let rate = self.config.current().forwarder_max_rate_per_second;
        self.limiter.set_rate(Some(rate));
        if self.limiter.allow() {
            Ok(())
        } else {
            trace!(rate, "forward rejected by rate limiter");
            Err(MatchError::ForwarderSlowDown)
        }
    }

    fn source_name(&self) -> String {
        self.partition.name.name().to_string()
    }

    /// Run a call against the parent, giving up when the context is done
    async fn call<T, F>(&self, ctx: &MatchContext, call: F) -> Result<T, MatchError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            result = call => result.map_err(MatchError::from),
            err = ctx.done() => Err(err),
        }
    }

    /// Forward an unmatched task to the parent for sync match
    ///
    /// `Ok(())` means a poller at the parent took it.
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn forward_task(
        &self,
        ctx: &MatchContext,
        task: &InternalTask,
    ) -> Result<(), MatchError> {
        if let Some(from) = task.forwarded_from() {
            error!(forwarded_from = from, "refusing to forward an already forwarded task");
            return Err(MatchError::AlreadyForwarded(from.to_string()));
        }
        let info = task.info().ok_or(MatchError::InvalidTaskKind)?;
        let task_queue = self.parent_ref()?;
        self.admit()?;

        let request = AddTaskRequest {
            namespace_id: self.partition.namespace_id,
            task_queue,
            task: info.clone(),
            source: task.source(),
            forwarded_from: self.source_name(),
        };
        trace!(parent = %request.task_queue.name, "forwarding task");

        let result = match self.partition.task_type {
            TaskQueueType::Workflow => {
                self.call(ctx, self.client.add_workflow_task(ctx, request))
                    .await
            }
            TaskQueueType::Activity => {
                self.call(ctx, self.client.add_activity_task(ctx, request))
                    .await
            }
        };
        if let Err(err) = &result {
            debug!(error = %err, "forwarded task not matched");
        }
        result
    }

    /// Forward a poll to the parent
    ///
    /// Returns the started task on success or [`MatchError::NoTasks`] when
    /// the parent had nothing before the poll expired.
    #[instrument(skip_all, fields(partition = %self.partition.name, query_only = query_only))]
    pub async fn forward_poll(
        &self,
        ctx: &MatchContext,
        query_only: bool,
    ) -> Result<InternalTask, MatchError> {
        if let Some(from) = ctx.forwarded_from() {
            error!(forwarded_from = from, "refusing to forward an already forwarded poll");
            return Err(MatchError::AlreadyForwarded(from.to_string()));
        }
        let task_queue = self.parent_ref()?;

        let request = PollRequest {
            namespace_id: self.partition.namespace_id,
            task_queue,
            poller_id: ctx.poller_id().map(str::to_string),
            identity: ctx.identity().map(str::to_string),
            query_only,
            forwarded_from: self.source_name(),
        };
        trace!(parent = %request.task_queue.name, "forwarding poll");

        let response = match self.partition.task_type {
            TaskQueueType::Workflow => {
                self.call(ctx, self.client.poll_workflow_task(ctx, request))
                    .await?
            }
            TaskQueueType::Activity => {
                self.call(ctx, self.client.poll_activity_task(ctx, request))
                    .await?
            }
        };
        match response.task {
            Some(started) => Ok(InternalTask::new_started(started)),
            None => Err(MatchError::NoTasks),
        }
    }

    /// Forward a query to the parent and wait for its answer
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn forward_query(
        &self,
        ctx: &MatchContext,
        task: &InternalTask,
    ) -> Result<QueryResponse, MatchError> {
        if let Some(from) = task.forwarded_from() {
            error!(forwarded_from = from, "refusing to forward an already forwarded query");
            return Err(MatchError::AlreadyForwarded(from.to_string()));
        }
        let (task_id, query) = task.query().ok_or(MatchError::InvalidTaskKind)?;
        let task_queue = self.parent_ref()?;
        self.admit()?;

        let request = QueryWorkflowRequest {
            namespace_id: self.partition.namespace_id,
            task_queue,
            task_type: self.partition.task_type,
            task_id: task_id.to_string(),
            query: query.clone(),
            forwarded_from: self.source_name(),
        };
        trace!(parent = %request.task_queue.name, task_id, "forwarding query");

        self.call(ctx, self.client.query_workflow(ctx, request))
            .await
    }

    /// Send a query answer back to the partition where its offerer waits
    #[instrument(skip_all, fields(partition = %self.partition.name, to = partition, task_id = task_id))]
    pub async fn forward_query_completion(
        &self,
        ctx: &MatchContext,
        partition: &str,
        task_id: &str,
        outcome: Result<QueryResponse, TaskError>,
    ) -> Result<(), MatchError> {
        let request = RespondQueryTaskCompletedRequest {
            namespace_id: self.partition.namespace_id,
            task_queue: TaskQueueRef::new(partition, self.partition.kind),
            task_type: self.partition.task_type,
            task_id: task_id.to_string(),
            completion: outcome.into(),
        };
        self.call(ctx, self.client.respond_query_task_completed(ctx, request))
            .await
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("partition", &self.partition)
            .field("add_tokens", &self.add_tokens.read().available())
            .field("poll_tokens", &self.poll_tokens.read().available())
            .finish()
    }
}
