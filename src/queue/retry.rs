//! Score-ordered retry queue.
//!
//! Entries are scored with the earliest time they may run again. Fetching is
//! windowed and non-consuming: every poll returns all entries due within the
//! lookahead, and an entry keeps coming back until it is removed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::domain::{FieldPath, FieldValue, Job};

use super::{decode_members, poll_into, FetchOptions, JobSource, Queue, QueueError, ScoreStore};

/// Backoff scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffOptions {
    /// How far past now a fetch looks (default: 48 hours)
    #[serde(default = "default_lookahead_seconds")]
    pub lookahead_seconds: u64,

    /// Fixed delay added to every backoff
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: f64,

    /// Job field holding the retry count
    #[serde(default = "default_backoff_field")]
    pub backoff_field: String,
}

fn default_lookahead_seconds() -> u64 {
    48 * 60 * 60
}
fn default_base_delay_seconds() -> f64 {
    15.0
}
fn default_backoff_field() -> String {
    "retry_count".to_string()
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            lookahead_seconds: default_lookahead_seconds(),
            base_delay_seconds: default_base_delay_seconds(),
            backoff_field: default_backoff_field(),
        }
    }
}

/// Current time as fractional Unix seconds
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Backoff exponent for a job, or `None` when the job is due immediately.
///
/// Booleans, `null` and a missing field mean no backoff. A number is used as
/// the exponent. Any other kind counts as a single retry.
pub fn backoff_exponent(job: &Job, field: &FieldPath) -> Option<f64> {
    match job.lookup(field) {
        Err(_) | Ok(FieldValue::Null) | Ok(FieldValue::Bool(_)) => None,
        Ok(FieldValue::Number(n)) => Some(n),
        Ok(_) => Some(1.0),
    }
}

/// `2^exponent + base_delay + now`. Infinite once the exponent passes 1023.
pub fn backoff_score(exponent: f64, base_delay: f64, now: f64) -> f64 {
    exponent.exp2() + base_delay + now
}

/// Retry queue over a score store
pub struct RetryQueue {
    name: String,
    store: Arc<dyn ScoreStore>,
    backoff: BackoffOptions,
    backoff_field: FieldPath,
    fetch: FetchOptions,
}

impl RetryQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ScoreStore>,
        backoff: BackoffOptions,
        fetch: FetchOptions,
    ) -> Self {
        let backoff_field = FieldPath::parse(&backoff.backoff_field);
        Self {
            name: name.into(),
            store,
            backoff,
            backoff_field,
            fetch,
        }
    }

    pub fn backoff(&self) -> &BackoffOptions {
        &self.backoff
    }

    /// Score a job would be stored with at `now`
    pub fn score_for(&self, job: &Job, now: f64) -> f64 {
        match backoff_exponent(job, &self.backoff_field) {
            Some(exponent) => backoff_score(exponent, self.backoff.base_delay_seconds, now),
            None => 0.0,
        }
    }

    /// Store a job with its backoff score, returning the score used
    #[instrument(skip(self, job), fields(queue = %self.name, jid = job.id().unwrap_or("-")))]
    pub async fn insert(&self, job: &Job) -> Result<f64, QueueError> {
        let score = self.score_for(job, now_seconds());
        if !score.is_finite() {
            return Err(QueueError::InvalidScore(score));
        }
        self.store.add(job.raw(), score).await?;
        debug!(score, "Scheduled retry");
        Ok(score)
    }

    /// One windowed read: everything due by `now + lookahead`
    pub async fn fetch_batch(&self, now: f64) -> Result<Vec<Arc<Job>>, QueueError> {
        let max = now + self.backoff.lookahead_seconds as f64;
        let entries = self
            .store
            .range_by_score(max, self.fetch.batch_size)
            .await?;

        decode_members(&self.name, entries.into_iter().map(|e| e.member))
    }
}

#[async_trait]
impl JobSource for RetryQueue {
    async fn fetch(
        &self,
        cancel: CancellationToken,
        jobs: mpsc::Sender<Arc<Job>>,
    ) -> Result<(), QueueError> {
        info!(queue = %self.name, "Starting retry queue fetch");
        poll_into(&self.name, &self.fetch, &cancel, &jobs, || {
            self.fetch_batch(now_seconds())
        })
        .await
    }
}

#[async_trait]
impl Queue for RetryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.insert(job).await.map(|_| ())
    }

    async fn remove(&self, job: &Job) -> Result<bool, QueueError> {
        let removed = self.store.remove(job.raw()).await?;
        info!(
            queue = %self.name,
            jid = job.id().unwrap_or("-"),
            removed,
            "Removed from retry queue"
        );
        Ok(removed)
    }

    fn source(self: Arc<Self>) -> Arc<dyn JobSource> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryScoreStore;

    fn queue(store: Arc<MemoryScoreStore>) -> RetryQueue {
        RetryQueue::new("retry", store, BackoffOptions::default(), FetchOptions::default())
    }

    fn job(json: &str) -> Job {
        Job::from_bytes(json).unwrap()
    }

    #[test]
    fn test_backoff_policy() {
        let q = queue(Arc::new(MemoryScoreStore::new()));
        let now = 1_000.0;

        assert_eq!(q.score_for(&job(r#"{}"#), now), 0.0);
        assert_eq!(q.score_for(&job(r#"{"retry_count": null}"#), now), 0.0);
        assert_eq!(q.score_for(&job(r#"{"retry_count": false}"#), now), 0.0);

        assert_eq!(q.score_for(&job(r#"{"retry_count": 3}"#), now), 8.0 + 15.0 + now);
        assert_eq!(q.score_for(&job(r#"{"retry_count": true}"#), now), 0.0);
        assert_eq!(q.score_for(&job(r#"{"retry_count": "x"}"#), now), 2.0 + 15.0 + now);
    }

    #[test]
    fn test_more_retries_score_later() {
        let q = queue(Arc::new(MemoryScoreStore::new()));
        let now = now_seconds();

        for r in 0..20 {
            let low = q.score_for(&job(&format!(r#"{{"retry_count": {}}}"#, r)), now);
            let high = q.score_for(&job(&format!(r#"{{"retry_count": {}}}"#, r + 1)), now);
            assert!(high > low, "retry {} should score above retry {}", r + 1, r);
        }
    }

    #[test]
    fn test_custom_backoff_field() {
        let backoff = BackoffOptions {
            backoff_field: "retry".to_string(),
            base_delay_seconds: 0.0,
            ..BackoffOptions::default()
        };
        let q = RetryQueue::new(
            "retry",
            Arc::new(MemoryScoreStore::new()),
            backoff,
            FetchOptions::default(),
        );

        assert_eq!(q.score_for(&job(r#"{"retry": 2, "retry_count": 9}"#), 0.0), 4.0);
    }

    #[tokio::test]
    async fn test_overflowing_backoff_is_rejected() {
        let store = Arc::new(MemoryScoreStore::new());
        let q = queue(store.clone());

        let huge = job(r#"{"jid":"huge","retry_count": 1024}"#);
        assert!(matches!(
            q.insert(&huge).await,
            Err(QueueError::InvalidScore(score)) if score.is_infinite()
        ));
        assert!(store.is_empty().await);

        let largest = job(r#"{"jid":"largest","retry_count": 1000}"#);
        assert!(q.insert(&largest).await.unwrap().is_finite());
    }

    #[tokio::test]
    async fn test_window_excludes_far_future() {
        let store = Arc::new(MemoryScoreStore::new());
        let q = queue(store.clone());

        let now = now_seconds();
        store.add(br#"{"jid":"due"}"#, now).await.unwrap();
        store
            .add(br#"{"jid":"later"}"#, now + 3.0 * 24.0 * 3600.0)
            .await
            .unwrap();

        let batch = q.fetch_batch(now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id(), Some("due"));
    }

    #[tokio::test]
    async fn test_undecodable_entry_fails_batch() {
        let store = Arc::new(MemoryScoreStore::new());
        let q = queue(store.clone());
        store.add(b"not json", 0.0).await.unwrap();

        assert!(matches!(
            q.fetch_batch(now_seconds()).await,
            Err(QueueError::Decode(_))
        ));
    }
}
