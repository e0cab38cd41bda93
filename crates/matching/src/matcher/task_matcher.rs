//! Per-partition task matcher

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use super::metrics::MatcherMetrics;
use super::rendezvous::{Rendezvous, Waiter};
use crate::config::{ConfigError, ConfigHandle};
use crate::context::MatchContext;
use crate::error::MatchError;
use crate::forwarder::{ForwardToken, Forwarder};
use crate::limiter::DynamicRateLimiter;
use crate::partition::{PartitionId, TaskQueueKind};
use crate::task::{
    InternalTask, QueryOutcome, QueryResponse, StartedTask, TaskError, TaskPayload, TaskSource,
};

/// Result of a non-blocking [`TaskMatcher::offer`]
#[derive(Debug)]
pub enum OfferOutcome {
    /// A poller (local or at the parent) owns the task
    Matched,
    /// Nobody took the task; the caller keeps it, usually for the backlog
    Unmatched(InternalTask),
}

impl OfferOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched)
    }

    /// The task handed back, if it was not matched
    pub fn into_unmatched(self) -> Option<InternalTask> {
        match self {
            Self::Matched => None,
            Self::Unmatched(task) => Some(task),
        }
    }
}

/// Pairs tasks and queries with pollers on one partition
///
/// Tasks and queries wait on separate rendezvous points; a regular poller
/// waits on both, a query poller on queries only. Whatever cannot be paired
/// locally may be forwarded one hop up through the [`Forwarder`], gated by
/// its token pools. A task is either parked locally or in flight to the
/// parent, never both, so it is delivered at most once.
///
/// # Example
///
/// ```
/// use everruns_matching::{
///     ConfigHandle, InternalTask, MatchContext, MatcherConfig, OfferOutcome, PartitionId,
///     TaskInfo, TaskMatcher, TaskQueueType, TaskSource,
/// };
/// use std::time::Duration;
/// use uuid::Uuid;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ns = Uuid::now_v7();
/// let partition = PartitionId::new(ns, "orders", TaskQueueType::Activity)?;
/// let matcher = TaskMatcher::new(partition, ConfigHandle::new(MatcherConfig::new())?, None);
///
/// let task = InternalTask::new(TaskInfo::new(ns, "wf-1", Uuid::now_v7(), 5), TaskSource::Producer);
/// let ctx = MatchContext::with_timeout(Duration::from_millis(10));
/// match matcher.offer(&ctx, task).await? {
///     OfferOutcome::Matched => println!("dispatched"),
///     OfferOutcome::Unmatched(task) => println!("persist {:?}", task.info()),
/// }
/// # Ok(())
/// # }
/// ```
pub struct TaskMatcher {
    partition: PartitionId,
    config: ConfigHandle,
    forwarder: Option<Arc<Forwarder>>,
    tasks: Rendezvous<InternalTask>,
    queries: Rendezvous<InternalTask>,
    dispatch_limiter: DynamicRateLimiter,
    metrics: MatcherMetrics,
}

enum Race {
    Taken,
    Token(ForwardToken),
    Done(MatchError),
}

enum PollRace {
    Local(InternalTask),
    Forwarded(Result<InternalTask, MatchError>),
    Done(MatchError),
}

/// A poller registered on this partition's rendezvous points
struct LocalPoll<'a> {
    tasks: Option<Waiter<'a, InternalTask>>,
    queries: Option<Waiter<'a, InternalTask>>,
}

impl LocalPoll<'_> {
    async fn recv(&mut self) -> InternalTask {
        match (self.tasks.as_mut(), self.queries.as_mut()) {
            (Some(tasks), Some(queries)) => tokio::select! {
                task = tasks.recv() => task,
                query = queries.recv() => query,
            },
            (Some(waiter), None) | (None, Some(waiter)) => waiter.recv().await,
            (None, None) => std::future::pending().await,
        }
    }

    /// Deregister; returns an item that was handed over meanwhile
    fn cancel(mut self) -> Option<InternalTask> {
        if let Some(task) = self.tasks.take().and_then(Waiter::cancel) {
            return Some(task);
        }
        self.queries.take().and_then(Waiter::cancel)
    }
}

/// Wait for an add token; never resolves without a forwarder
async fn wait_for_add_token(forwarder: Option<&Forwarder>, ctx: &MatchContext) -> ForwardToken {
    let Some(forwarder) = forwarder else {
        return std::future::pending().await;
    };
    let pool = forwarder.add_token_pool();
    match pool.acquire(ctx).await {
        Ok(token) => token,
        // the caller's own context branch resolves
        Err(_) => std::future::pending().await,
    }
}

impl TaskMatcher {
    /// Create a matcher; `forwarder` is `None` for partitions that never
    /// forward
    pub fn new(
        partition: PartitionId,
        config: ConfigHandle,
        forwarder: Option<Arc<Forwarder>>,
    ) -> Self {
        let dispatch_rate = config.current().dispatch_rate_per_second;
        Self {
            partition,
            config,
            forwarder,
            tasks: Rendezvous::new(),
            queries: Rendezvous::new(),
            dispatch_limiter: DynamicRateLimiter::new(dispatch_rate),
            metrics: MatcherMetrics::default(),
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn forwarder(&self) -> Option<&Arc<Forwarder>> {
        self.forwarder.as_ref()
    }

    pub fn metrics(&self) -> &MatcherMetrics {
        &self.metrics
    }

    /// Change the dispatch rate; `None` removes the limit
    ///
    /// A zero rate is rejected, same as in [`MatcherConfig::validate`].
    ///
    /// [`MatcherConfig::validate`]: crate::MatcherConfig::validate
    pub fn update_dispatch_rate(&self, rate: Option<u32>) -> Result<(), MatchError> {
        if rate == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "dispatch_rate_per_second",
                reason: "must be positive or unset",
            }
            .into());
        }
        debug!(partition = %self.partition.name, ?rate, "updating dispatch rate");
        self.dispatch_limiter.set_rate(rate);
        Ok(())
    }

    pub fn dispatch_rate(&self) -> Option<u32> {
        self.dispatch_limiter.rate()
    }

    /// Pollers waiting for tasks
    pub fn waiting_pollers(&self) -> usize {
        self.tasks.waiting_takers()
    }

    /// Pollers waiting for queries (regular pollers included)
    pub fn waiting_query_pollers(&self) -> usize {
        self.queries.waiting_takers()
    }

    /// Tasks currently offered and waiting for a poller
    pub fn parked_tasks(&self) -> usize {
        self.tasks.parked_items()
    }

    /// Forwarder, if this partition may forward right now
    fn forwarding_allowed(&self) -> Option<&Arc<Forwarder>> {
        let forwarder = self.forwarder.as_ref()?;
        if self.partition.is_root()
            || self.partition.kind == TaskQueueKind::Sticky
            || !self.config.current().forwarding_enabled
        {
            return None;
        }
        Some(forwarder)
    }

    /// Forwarder for `task`; forwarded work is never forwarded again
    fn forwarder_for(&self, task: &InternalTask) -> Option<&Arc<Forwarder>> {
        if task.is_forwarded() {
            return None;
        }
        self.forwarding_allowed()
    }

    fn record_forward_failure(&self, err: &MatchError) {
        if err.is_throttle() {
            self.metrics.record_throttled_forward();
        } else {
            self.metrics.record_forward_error();
        }
    }

    async fn wait_dispatch(&self, ctx: &MatchContext) -> Result<(), MatchError> {
        self.dispatch_limiter.wait(ctx).await.inspect_err(|_| {
            self.metrics.record_dispatch_throttled();
        })
    }

    /// Try to hand a task to a poller without waiting for one
    ///
    /// Pairs with a local poller if one is waiting, otherwise makes one
    /// best-effort forward to the parent when a token is free. On the root
    /// partition a forwarded backlog task waits for a local poller until the
    /// context is done.
    ///
    /// A task handed to the parent is finished with `Ok(())` here. An
    /// unmatched task is returned to the caller untouched.
    #[instrument(skip_all, fields(partition = %self.partition.name, forwarded = task.is_forwarded()))]
    pub async fn offer(
        &self,
        ctx: &MatchContext,
        task: InternalTask,
    ) -> Result<OfferOutcome, MatchError> {
        if !task.is_forwarded() {
            self.wait_dispatch(ctx).await?;
        }

        let task = match self.tasks.give(task).await {
            Ok(()) => {
                trace!("task matched with local poller");
                self.metrics.record_local_match();
                return Ok(OfferOutcome::Matched);
            }
            Err(task) => task,
        };

        let Some(forwarder) = self.forwarder_for(&task) else {
            if self.forwarding_allowed().is_none()
                && task.is_forwarded()
                && task.source() == TaskSource::Backlog
            {
                return self.offer_or_timeout(ctx, task).await;
            }
            return Ok(OfferOutcome::Unmatched(task));
        };

        let Some(token) = forwarder.add_token_pool().try_acquire() else {
            trace!("no add token free, leaving task unmatched");
            return Ok(OfferOutcome::Unmatched(task));
        };
        let result = forwarder.forward_task(ctx, &task).await;
        token.release();

        match result {
            Ok(()) => {
                trace!("task matched through parent partition");
                self.metrics.record_forwarded_match();
                task.finish(Ok(()));
                Ok(OfferOutcome::Matched)
            }
            Err(err) if err.is_not_matched() || err.is_not_forwardable() => {
                self.record_forward_failure(&err);
                Ok(OfferOutcome::Unmatched(task))
            }
            Err(err) => {
                self.metrics.record_forward_error();
                warn!(error = %err, "forwarding task failed");
                Err(err)
            }
        }
    }

    /// Park a task until a local poller takes it or the context is done
    async fn offer_or_timeout(
        &self,
        ctx: &MatchContext,
        task: InternalTask,
    ) -> Result<OfferOutcome, MatchError> {
        let mut parked = self.tasks.park(task);
        let done = tokio::select! {
            biased;
            _ = parked.taken() => None,
            err = ctx.done() => Some(err),
        };
        match done {
            None => {
                self.metrics.record_local_match();
                Ok(OfferOutcome::Matched)
            }
            Some(err) => match parked.withdraw().await {
                Some(task) => {
                    trace!(error = %err, "no local poller before the context ended");
                    Ok(OfferOutcome::Unmatched(task))
                }
                None => {
                    self.metrics.record_local_match();
                    Ok(OfferOutcome::Matched)
                }
            },
        }
    }

    /// Hand a backlog task to some poller, waiting as long as it takes
    ///
    /// Alternates between waiting locally and forwarding to the parent.
    /// After a failed forward the task waits only for local pollers until
    /// the retry window (`must_offer_forward_retry`) passes. Returns an error
    /// only when the context is done; the task is then dropped and its
    /// completion reports [`TaskError::Abandoned`].
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn must_offer(&self, ctx: &MatchContext, task: InternalTask) -> Result<(), MatchError> {
        self.wait_dispatch(ctx).await?;

        let mut task = match self.tasks.give(task).await {
            Ok(()) => {
                self.metrics.record_local_match();
                return Ok(());
            }
            Err(task) => task,
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        loop {
            let forwarder = self.forwarder_for(&task).cloned();
            let mut parked = self.tasks.park(task);
            let race = tokio::select! {
                biased;
                _ = parked.taken() => Race::Taken,
                err = ctx.done() => Race::Done(err),
                token = wait_for_add_token(forwarder.as_deref(), ctx) => Race::Token(token),
            };

            let token = match race {
                Race::Taken => {
                    self.metrics.record_local_match();
                    return Ok(());
                }
                Race::Done(err) => {
                    return match parked.withdraw().await {
                        Some(_) => Err(err),
                        None => {
                            self.metrics.record_local_match();
                            Ok(())
                        }
                    };
                }
                Race::Token(token) => match parked.withdraw().await {
                    Some(withdrawn) => {
                        task = withdrawn;
                        token
                    }
                    None => {
                        self.metrics.record_local_match();
                        return Ok(());
                    }
                },
            };
            let Some(forwarder) = forwarder else {
                continue;
            };

            let window = self.config.current().must_offer_forward_retry;
            let attempt = ctx.child_with_timeout(window);
            let result = forwarder.forward_task(&attempt, &task).await;
            token.release();

            let err = match result {
                Ok(()) => {
                    trace!("backlog task matched through parent partition");
                    self.metrics.record_forwarded_match();
                    task.finish(Ok(()));
                    return Ok(());
                }
                Err(err) => err,
            };
            if let Some(done) = ctx.err() {
                return Err(done);
            }
            self.record_forward_failure(&err);
            debug!(error = %err, "forward failed, matching locally until the retry window ends");

            let mut parked = self.tasks.park(task);
            let outcome = tokio::select! {
                biased;
                _ = parked.taken() => Some(Ok(())),
                err = ctx.done() => Some(Err(err)),
                _ = attempt.done() => None,
            };
            match (outcome, parked.withdraw().await) {
                (_, None) => {
                    self.metrics.record_local_match();
                    return Ok(());
                }
                (Some(Err(err)), Some(_)) => return Err(err),
                (_, Some(withdrawn)) => task = withdrawn,
            }
        }
    }

    /// Wait for a task or query
    ///
    /// Local pairing and a forwarded poll (when a poll token is free) race;
    /// whichever delivers first wins. Forwarded polls are answered locally
    /// only. The returned task is marked started.
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn poll(&self, ctx: &MatchContext) -> Result<InternalTask, MatchError> {
        self.poll_inner(ctx, false).await
    }

    /// Wait for a query only
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn poll_for_query(&self, ctx: &MatchContext) -> Result<InternalTask, MatchError> {
        self.poll_inner(ctx, true).await
    }

    async fn poll_inner(
        &self,
        ctx: &MatchContext,
        query_only: bool,
    ) -> Result<InternalTask, MatchError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut local = LocalPoll {
            tasks: (!query_only).then(|| self.tasks.register()),
            queries: Some(self.queries.register()),
        };

        let forwarder = match ctx.forwarded_from() {
            Some(_) => None,
            None => self.forwarding_allowed(),
        };
        let forward = self.forward_poll(forwarder, ctx, query_only);
        tokio::pin!(forward);

        let race = tokio::select! {
            biased;
            task = local.recv() => PollRace::Local(task),
            err = ctx.done() => PollRace::Done(err),
            result = &mut forward => PollRace::Forwarded(result),
        };

        match race {
            PollRace::Local(task) => Ok(Self::started(task)),
            PollRace::Done(err) => Self::give_up(local, err),
            PollRace::Forwarded(Ok(task)) => {
                trace!("poll matched through parent partition");
                Ok(task)
            }
            PollRace::Forwarded(Err(err)) if err.is_cancellation() => Self::give_up(local, err),
            PollRace::Forwarded(Err(err)) if err.is_not_matched() || err.is_not_forwardable() => {
                trace!(error = %err, "forwarded poll came back empty");
                let race = tokio::select! {
                    biased;
                    task = local.recv() => Ok(task),
                    err = ctx.done() => Err(err),
                };
                match race {
                    Ok(task) => Ok(Self::started(task)),
                    Err(err) => Self::give_up(local, err),
                }
            }
            PollRace::Forwarded(Err(err)) => {
                warn!(error = %err, "forwarded poll failed");
                Self::give_up(local, err)
            }
        }
    }

    /// Forward a poll once a poll token is free; never resolves without a
    /// forwarder
    async fn forward_poll(
        &self,
        forwarder: Option<&Arc<Forwarder>>,
        ctx: &MatchContext,
        query_only: bool,
    ) -> Result<InternalTask, MatchError> {
        let Some(forwarder) = forwarder else {
            return std::future::pending().await;
        };
        let pool = forwarder.poll_token_pool();
        let token = pool.acquire(ctx).await?;
        self.metrics.record_forwarded_poll();
        let result = forwarder.forward_poll(ctx, query_only).await;
        token.release();
        result
    }

    fn started(mut task: InternalTask) -> InternalTask {
        task.mark_started();
        task
    }

    fn give_up(local: LocalPoll<'_>, err: MatchError) -> Result<InternalTask, MatchError> {
        match local.cancel() {
            Some(task) => Ok(Self::started(task)),
            None => Err(err),
        }
    }

    /// Offer a query and wait for its answer
    ///
    /// Returns `Ok(Some(_))` with the answer, or `Ok(None)` when the poller
    /// finished the query without one (also the case when the poller side
    /// was reached after forwarding got throttled).
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn offer_query(
        &self,
        ctx: &MatchContext,
        mut task: InternalTask,
    ) -> Result<Option<QueryResponse>, MatchError> {
        if !matches!(task.payload(), TaskPayload::Query(_)) {
            return Err(MatchError::InvalidTaskKind);
        }
        let (tx, rx) = oneshot::channel();
        task.attach_query_responder(tx);

        let mut forwarder = self.forwarder_for(&task).cloned();
        let mut task = match self.queries.give(task).await {
            Ok(()) => return self.await_query_answer(ctx, rx).await,
            Err(task) => task,
        };

        loop {
            let mut parked = self.queries.park(task);
            let race = tokio::select! {
                biased;
                _ = parked.taken() => Race::Taken,
                err = ctx.done() => Race::Done(err),
                token = wait_for_add_token(forwarder.as_deref(), ctx) => Race::Token(token),
            };

            let token = match race {
                Race::Taken => return self.await_query_answer(ctx, rx).await,
                Race::Done(err) => {
                    return match parked.withdraw().await {
                        Some(_) => Err(err),
                        None => self.await_query_answer(ctx, rx).await,
                    };
                }
                Race::Token(token) => match parked.withdraw().await {
                    Some(withdrawn) => {
                        task = withdrawn;
                        token
                    }
                    None => return self.await_query_answer(ctx, rx).await,
                },
            };
            let Some(fwdr) = forwarder.as_ref() else {
                continue;
            };

            let result = fwdr.forward_query(ctx, &task).await;
            token.release();
            match result {
                Ok(response) => {
                    self.metrics.record_forwarded_match();
                    task.finish(Ok(()));
                    return Ok(Some(response));
                }
                Err(err) if err.is_throttle() => {
                    self.metrics.record_throttled_forward();
                    debug!("query forward throttled, matching locally only");
                    forwarder = None;
                }
                Err(err) => {
                    self.metrics.record_forward_error();
                    warn!(error = %err, "forwarding query failed");
                    return Err(err);
                }
            }
        }
    }

    async fn await_query_answer(
        &self,
        ctx: &MatchContext,
        rx: oneshot::Receiver<QueryOutcome>,
    ) -> Result<Option<QueryResponse>, MatchError> {
        self.metrics.record_local_match();
        tokio::select! {
            biased;
            outcome = rx => match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(MatchError::Task(err)),
                Err(_) => Err(MatchError::Task(TaskError::Abandoned)),
            },
            err = ctx.done() => Err(err),
        }
    }

    /// Answer a query obtained from [`poll`](Self::poll) or
    /// [`poll_for_query`](Self::poll_for_query)
    ///
    /// Queries obtained through a forwarded poll are answered through the
    /// forwarder, to the partition where the offerer waits.
    #[instrument(skip_all, fields(partition = %self.partition.name))]
    pub async fn respond_query(
        &self,
        ctx: &MatchContext,
        task: InternalTask,
        outcome: Result<QueryResponse, TaskError>,
    ) -> Result<(), MatchError> {
        if matches!(task.payload(), TaskPayload::Query(_)) {
            task.respond_query(outcome);
            return Ok(());
        }
        let (task_id, partition) = match task.payload() {
            TaskPayload::Started(StartedTask::Query {
                task_id, partition, ..
            }) => (task_id.clone(), partition.clone()),
            _ => return Err(MatchError::InvalidTaskKind),
        };
        let forwarder = self.forwarder.as_ref().ok_or(MatchError::NoParent)?;
        forwarder
            .forward_query_completion(ctx, &partition, &task_id, outcome)
            .await
    }
}

impl std::fmt::Debug for TaskMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMatcher")
            .field("partition", &self.partition)
            .field("forwarding", &self.forwarder.is_some())
            .field("waiting_pollers", &self.waiting_pollers())
            .field("parked_tasks", &self.parked_tasks())
            .finish()
    }
}
