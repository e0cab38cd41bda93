//! Integration tests for partitions wired through InMemoryMatchingClient
//!
//! Run with: cargo test -p everruns-matching --test in_memory_test
//!
//! The child partition `/_sys/tq/1` forwards to the root partition `tq`
//! (degree 20); both live in this process and reach each other through the
//! in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use everruns_matching::transport::{QueryCompletion, RespondQueryTaskCompletedRequest, TaskQueueRef};
use everruns_matching::{
    ConfigHandle, Forwarder, InMemoryMatchingClient, InternalTask, MatchContext, MatchError,
    MatcherConfig, MatchingClient, PartitionId, Payload, QueryRequest, QueryResponse, TaskInfo,
    TaskMatcher, TaskQueueKind, TaskQueueType, TaskSource, TransportError,
};

struct Cluster {
    ns: Uuid,
    client: Arc<InMemoryMatchingClient>,
    root: Arc<TaskMatcher>,
    child: Arc<TaskMatcher>,
}

fn cluster_with(register_root: bool) -> Cluster {
    let ns = Uuid::now_v7();
    let config = ConfigHandle::new(
        MatcherConfig::new()
            .with_max_rate_per_second(100)
            .with_max_children_per_node(20)
            .with_must_offer_forward_retry(Duration::from_millis(200)),
    )
    .unwrap();
    let client = Arc::new(InMemoryMatchingClient::new());

    let root_id = PartitionId::new(ns, "tq", TaskQueueType::Workflow).unwrap();
    let root = Arc::new(TaskMatcher::new(root_id, config.clone(), None));

    let child_id = PartitionId::new(ns, "/_sys/tq/1", TaskQueueType::Workflow).unwrap();
    let forwarder = Forwarder::new(
        child_id.clone(),
        config.clone(),
        Arc::clone(&client) as Arc<dyn MatchingClient>,
    );
    let child = Arc::new(TaskMatcher::new(child_id, config, Some(Arc::new(forwarder))));

    if register_root {
        client.register(&root);
    }
    client.register(&child);

    Cluster {
        ns,
        client,
        root,
        child,
    }
}

fn cluster() -> Cluster {
    cluster_with(true)
}

fn task(ns: Uuid, workflow_id: &str, source: TaskSource) -> InternalTask {
    InternalTask::new(TaskInfo::new(ns, workflow_id, Uuid::now_v7(), 4), source)
}

fn ctx(timeout: Duration) -> MatchContext {
    MatchContext::with_timeout(timeout)
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[test]
fn test_partitions_are_registered() {
    let c = cluster();
    assert_eq!(c.client.partition_count(), 2);
    assert_eq!(c.client.pending_query_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_offer_reaches_root_poller() {
    let c = cluster();
    let poller = {
        let root = Arc::clone(&c.root);
        tokio::spawn(async move { root.poll(&ctx(Duration::from_secs(2))).await })
    };
    wait_until(|| c.root.waiting_pollers() == 1).await;

    let completions = Arc::new(AtomicUsize::new(0));
    let offered = {
        let completions = Arc::clone(&completions);
        task(c.ns, "wf-remote", TaskSource::Producer).with_completion(move |result| {
            assert_eq!(result, Ok(()));
            completions.fetch_add(1, Ordering::SeqCst);
        })
    };
    let offer = {
        let child = Arc::clone(&c.child);
        tokio::spawn(async move { child.offer(&ctx(Duration::from_secs(2)), offered).await })
    };

    assert!(offer.await.unwrap().unwrap().is_matched());
    let polled = poller.await.unwrap().unwrap();
    assert_eq!(polled.forwarded_from(), Some("/_sys/tq/1"));
    assert_eq!(polled.info().unwrap().workflow_id, "wf-remote");
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(c.child.metrics().snapshot().forwarded_matches, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_must_offer_reaches_late_root_poller() {
    let c = cluster();
    let must_offer = {
        let child = Arc::clone(&c.child);
        let backlog = task(c.ns, "wf-backlog", TaskSource::Backlog);
        tokio::spawn(async move {
            child
                .must_offer(&ctx(Duration::from_secs(5)), backlog)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let polled = c
        .root
        .poll(&ctx(Duration::from_secs(4)))
        .await
        .unwrap();
    must_offer.await.unwrap().unwrap();
    assert_eq!(polled.info().unwrap().workflow_id, "wf-backlog");
    assert_eq!(polled.forwarded_from(), Some("/_sys/tq/1"));
    assert_eq!(polled.source(), TaskSource::Backlog);
}

#[tokio::test]
async fn test_query_answered_by_child_poller() {
    let c = cluster();
    let poller = {
        let child = Arc::clone(&c.child);
        tokio::spawn(async move {
            let ctx = ctx(Duration::from_secs(2));
            let query = child.poll_for_query(&ctx).await.unwrap();
            assert!(query.is_remote());
            assert!(query.is_query());
            let answer = QueryResponse::new(Payload::encode("answer").unwrap());
            child.respond_query(&ctx, query, Ok(answer)).await
        })
    };
    wait_until(|| c.root.waiting_query_pollers() == 1).await;

    let query = InternalTask::new_query("q-1", QueryRequest::new("wf-1", "state"));
    let response = c
        .root
        .offer_query(&ctx(Duration::from_secs(2)), query)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        response.query_result.unwrap().decode::<String>().unwrap(),
        "answer"
    );
    poller.await.unwrap().unwrap();
    assert_eq!(c.client.pending_query_count(), 0);
}

#[tokio::test]
async fn test_query_dropped_by_remote_poller_is_released() {
    let c = cluster();
    let poller = {
        let child = Arc::clone(&c.child);
        tokio::spawn(async move {
            let query = child
                .poll_for_query(&ctx(Duration::from_secs(2)))
                .await
                .unwrap();
            drop(query);
        })
    };
    wait_until(|| c.root.waiting_query_pollers() == 1).await;

    let query = InternalTask::new_query("q-2", QueryRequest::new("wf-1", "state"));
    let err = c
        .root
        .offer_query(&ctx(Duration::from_millis(100)), query)
        .await
        .unwrap_err();

    assert!(matches!(err, MatchError::DeadlineExceeded));
    poller.await.unwrap();
    assert_eq!(c.client.pending_query_count(), 0);
}

#[tokio::test]
async fn test_query_answer_routed_by_partition() {
    let c = cluster();
    let poller = {
        let child = Arc::clone(&c.child);
        tokio::spawn(async move {
            child
                .poll_for_query(&ctx(Duration::from_secs(2)))
                .await
                .unwrap()
        })
    };
    wait_until(|| c.root.waiting_query_pollers() == 1).await;

    let offer = {
        let root = Arc::clone(&c.root);
        tokio::spawn(async move {
            let query = InternalTask::new_query("q-3", QueryRequest::new("wf-1", "state"));
            root.offer_query(&ctx(Duration::from_secs(2)), query).await
        })
    };
    let query = poller.await.unwrap();
    assert_eq!(c.client.pending_query_count(), 1);

    // same id, other partition: not the held query
    let misrouted = RespondQueryTaskCompletedRequest {
        namespace_id: c.ns,
        task_queue: TaskQueueRef::new("/_sys/tq/2", TaskQueueKind::Normal),
        task_type: TaskQueueType::Workflow,
        task_id: "q-3".into(),
        completion: QueryCompletion::Answered {
            response: QueryResponse::default(),
        },
    };
    let err = c
        .client
        .respond_query_task_completed(&MatchContext::new(), misrouted)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::NotFound("q-3".into()));
    assert_eq!(c.client.pending_query_count(), 1);

    let answer = QueryResponse::new(Payload::encode("state-3").unwrap());
    c.child
        .respond_query(&ctx(Duration::from_secs(1)), query, Ok(answer))
        .await
        .unwrap();
    let response = offer.await.unwrap().unwrap().unwrap();
    assert_eq!(
        response.query_result.unwrap().decode::<String>().unwrap(),
        "state-3"
    );
}

#[tokio::test]
async fn test_unregistered_parent_is_not_found() {
    let c = cluster_with(false);
    let err = c
        .child
        .offer(
            &ctx(Duration::from_secs(1)),
            task(c.ns, "wf-1", TaskSource::Producer),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MatchError::Transport(TransportError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_pairing_returns_forwarded_handoff() {
    let c = cluster();
    let poller = {
        let child = Arc::clone(&c.child);
        tokio::spawn(async move { child.poll(&ctx(Duration::from_secs(2))).await })
    };
    wait_until(|| c.root.waiting_pollers() == 1 && c.child.waiting_pollers() == 1).await;

    let completions = Arc::new(AtomicUsize::new(0));
    let at_root = {
        let completions = Arc::clone(&completions);
        task(c.ns, "wf-A", TaskSource::Producer).with_completion(move |_| {
            completions.fetch_add(1, Ordering::SeqCst);
        })
    };
    let at_child = task(c.ns, "wf-B", TaskSource::Producer);

    // both hand-offs land before the poller runs; its local side wins
    let root_ctx = ctx(Duration::from_secs(1));
    let child_ctx = ctx(Duration::from_secs(1));
    let (root_outcome, child_outcome) = tokio::join!(
        c.root.offer(&root_ctx, at_root),
        c.child.offer(&child_ctx, at_child),
    );

    assert!(child_outcome.unwrap().is_matched());
    let polled = poller.await.unwrap().unwrap();
    assert_eq!(polled.info().unwrap().workflow_id, "wf-B");
    assert!(!polled.is_remote());

    let returned = root_outcome.unwrap().into_unmatched().unwrap();
    assert_eq!(returned.info().unwrap().workflow_id, "wf-A");
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert_eq!(c.root.parked_tasks(), 0);
    assert_eq!(c.root.waiting_pollers(), 0);
}
