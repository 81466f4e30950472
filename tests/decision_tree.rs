//! Decision Tree Integration Tests
//!
//! Tests for branch selection, short-circuiting and error aggregation
//! across composed decision trees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use requeue::core::{
    chain, Action, ActionError, Condition, DecisionTree, NoopAction, Operator, Outcome,
    RemoveAction,
};
use requeue::queue::{JobSource, Queue, QueueError};
use requeue::Job;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counts invocations
#[derive(Default)]
struct Spy {
    calls: AtomicUsize,
}

impl Spy {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for Spy {
    fn name(&self) -> &str {
        "spy"
    }

    async fn run(&self, _cancel: CancellationToken, _job: Arc<Job>) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records the raw bytes of every push and removal
#[derive(Default)]
struct RecordingQueue {
    pushed: Mutex<Vec<Vec<u8>>>,
    removed: Mutex<Vec<Vec<u8>>>,
    fail: bool,
}

#[async_trait]
impl JobSource for RecordingQueue {
    async fn fetch(
        &self,
        _cancel: CancellationToken,
        _jobs: mpsc::Sender<Arc<Job>>,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

#[async_trait]
impl Queue for RecordingQueue {
    fn name(&self) -> &str {
        "recording"
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.pushed.lock().unwrap().push(job.raw().to_vec());
        Ok(())
    }

    async fn remove(&self, job: &Job) -> Result<bool, QueueError> {
        if self.fail {
            return Err(QueueError::Store("unavailable".to_string()));
        }
        self.removed.lock().unwrap().push(job.raw().to_vec());
        Ok(true)
    }

    fn source(self: Arc<Self>) -> Arc<dyn JobSource> {
        self
    }
}

fn too_many_retries() -> Arc<Condition> {
    Arc::new(Condition::new(
        "too_many_retries",
        "retry_count",
        Operator::GreaterThan,
        2,
    ))
}

fn job(raw: &str) -> Arc<Job> {
    Arc::new(Job::from_bytes(raw).unwrap())
}

#[tokio::test]
async fn test_stop_on_true_skips_next() {
    let next = Arc::new(Spy::default());
    let action = DecisionTree::gate("gate", too_many_retries())
        .stop_on_true(true)
        .compose(next.clone());

    action
        .run(CancellationToken::new(), job(r#"{"retry_count": 3}"#))
        .await
        .unwrap();
    assert_eq!(next.calls(), 0);

    action
        .run(CancellationToken::new(), job(r#"{"retry_count": 1}"#))
        .await
        .unwrap();
    assert_eq!(next.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_job_is_removed_not_executed() {
    let queue = Arc::new(RecordingQueue::default());
    let executor = Arc::new(Spy::default());

    let trees = vec![DecisionTree::new(
        "too_many_retries",
        too_many_retries(),
        Arc::new(RemoveAction::new(queue.clone())),
        Arc::new(NoopAction::default()),
    )
    .stop_on_true(true)];
    let action = chain(trees, executor.clone());

    let raw = r#"{"retry_count": 4, "jid": "abc"}"#;
    action.run(CancellationToken::new(), job(raw)).await.unwrap();

    assert_eq!(executor.calls(), 0);
    assert_eq!(*queue.removed.lock().unwrap(), vec![raw.as_bytes().to_vec()]);
}

#[tokio::test]
async fn test_retryable_job_reaches_executor() {
    let queue = Arc::new(RecordingQueue::default());
    let executor = Arc::new(Spy::default());

    let trees = vec![DecisionTree::new(
        "too_many_retries",
        too_many_retries(),
        Arc::new(RemoveAction::new(queue.clone())),
        Arc::new(NoopAction::default()),
    )
    .stop_on_true(true)];
    let action = chain(trees, executor.clone());

    action
        .run(CancellationToken::new(), job(r#"{"retry_count": 1, "jid": "abc"}"#))
        .await
        .unwrap();

    assert_eq!(executor.calls(), 1);
    assert!(queue.removed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_failure_is_reported_and_chain_continues() {
    let queue = Arc::new(RecordingQueue {
        fail: true,
        ..RecordingQueue::default()
    });
    let next = Arc::new(Spy::default());

    let action = DecisionTree::gate("gate", too_many_retries())
        .on_true(Arc::new(RemoveAction::new(queue)))
        .compose(next.clone());

    let errors = action
        .run(CancellationToken::new(), job(r#"{"retry_count": 9}"#))
        .await
        .unwrap_err();

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(ActionError::Queue { queue, .. }) if queue == "recording"
    ));
    assert_eq!(next.calls(), 1);
}

#[tokio::test]
async fn test_three_trees_run_in_order_until_stop() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Record {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Action for Record {
        fn name(&self) -> &str {
            self.label
        }

        async fn run(&self, _cancel: CancellationToken, _job: Arc<Job>) -> Outcome {
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    let record = |label| -> Arc<dyn Action> {
        Arc::new(Record {
            label,
            order: order.clone(),
        })
    };
    let always = Arc::new(|_: &Job| true);

    let trees = vec![
        DecisionTree::gate("one", always.clone()).on_true(record("one")),
        DecisionTree::gate("two", always.clone()).on_true(record("two")),
        DecisionTree::gate("three", always.clone())
            .on_true(record("three"))
            .stop_on_true(true),
        DecisionTree::gate("four", always).on_true(record("four")),
    ];
    let action = chain(trees, record("terminal"));

    action
        .run(CancellationToken::new(), job(r#"{}"#))
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["one", "two", "three"]);
}
