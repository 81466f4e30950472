//! Pipeline Integration Tests
//!
//! End-to-end runs of configured pipelines over in-memory queues with real
//! shell executors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use requeue::config::Config;
use requeue::core::{build_pipeline, BuiltPipeline, PipelineStats};
use requeue::Job;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(output: &Path, command: &str) -> Config {
    let yaml = format!(
        r#"
name: e2e
dataSources:
  - name: local
    memory: {{}}
queues:
  - name: retry
    dataSource: local
    type: zset
    pollIntervalMs: 500
  - name: dead
    dataSource: local
    type: list
conditionals:
  - name: too_many
    operator: ">"
    element: retry_count
    comparison: 2
  - name: has_jid
    operator: contains
    element: jid
    comparison: ""
executors:
  - name: resubmit
    command: "{command} >> {output}"
    timeoutSeconds: 5
pipeline:
  getItems: retry
  decisionTree:
    - name: too_many
      success: {{ pushItems: dead }}
      failure: {{ executor: resubmit }}
    - name: has_jid
      success: {{ removeItems: retry, return: true }}
"#,
        command = command,
        output = output.display()
    );
    Config::from_yaml(&yaml).unwrap()
}

async fn wait_for(stats: &PipelineStats, done: impl Fn(u64, u64) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = stats.snapshot();
            if done(snapshot.dispatched, snapshot.succeeded + snapshot.failed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

async fn seed(built: &BuiltPipeline, raw: &str) -> Job {
    let job = Job::from_bytes(raw).unwrap();
    built.queues["retry"].push(&job).await.unwrap();
    job
}

#[tokio::test]
async fn test_routes_jobs_by_retry_count() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("resubmitted.log");
    let built = build_pipeline(&config(&output, "echo {jid}")).await.unwrap();

    let retryable = seed(&built, r#"{"jid":"a","retry_count":1}"#).await;
    let exhausted = seed(&built, r#"{"jid":"b","retry_count":5}"#).await;

    let built = Arc::new(built);
    let cancel = CancellationToken::new();
    let run = {
        let built = built.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { built.pipeline.start(cancel).await })
    };

    let stats = built.pipeline.stats();
    wait_for(&stats, |_, finished| finished >= 2).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.failed, 0);

    let log = std::fs::read_to_string(&output).unwrap();
    assert!(log.lines().any(|line| line == "a"));
    assert!(!log.lines().any(|line| line == "b"));

    // Both jobs left the retry queue; the exhausted one moved to dead
    let queues = &built.queues;
    assert!(!queues["retry"].remove(&retryable).await.unwrap());
    assert!(!queues["retry"].remove(&exhausted).await.unwrap());
    assert!(queues["dead"].remove(&exhausted).await.unwrap());
    assert!(!queues["dead"].remove(&retryable).await.unwrap());
}

#[tokio::test]
async fn test_executor_failure_is_counted_and_chain_continues() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("never.log");
    let built = build_pipeline(&config(&output, "exit 1;")).await.unwrap();

    let job = seed(&built, r#"{"jid":"c","retry_count":0}"#).await;

    let built = Arc::new(built);
    let cancel = CancellationToken::new();
    let run = {
        let built = built.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { built.pipeline.start(cancel).await })
    };

    let stats = built.pipeline.stats();
    wait_for(&stats, |_, finished| finished >= 1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    assert!(stats.snapshot().failed >= 1);

    // The failing branch did not stop the chain, so the job was still removed
    assert!(!built.queues["retry"].remove(&job).await.unwrap());
}

#[tokio::test]
async fn test_cancel_waits_for_in_flight_jobs() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("slow.log");
    let built = build_pipeline(&config(&output, "sleep 0.3 && echo {jid}"))
        .await
        .unwrap();

    seed(&built, r#"{"jid":"slow","retry_count":0}"#).await;

    let built = Arc::new(built);
    let cancel = CancellationToken::new();
    let run = {
        let built = built.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { built.pipeline.start(cancel).await })
    };

    let stats = built.pipeline.stats();
    wait_for(&stats, |dispatched, _| dispatched >= 1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    // start() returned only after the slow executor finished
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.in_flight(), 0);
    let log = std::fs::read_to_string(&output).unwrap();
    assert!(log.lines().any(|line| line == "slow"));
}
