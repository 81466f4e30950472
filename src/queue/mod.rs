//! Job sources and queues.
//!
//! This module contains:
//! - JobSource: anything that streams jobs into a pipeline
//! - Queue: a JobSource that also accepts pushes and removals
//! - ScoreStore / ListStore: storage backends (memory, Redis)
//! - RetryQueue: score-ordered queue with backoff scheduling
//! - ListQueue: plain list-ordered queue

pub mod list;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Job, JobError};

pub use list::ListQueue;
pub use memory::{MemoryListStore, MemoryScoreStore};
pub use retry::{backoff_exponent, backoff_score, now_seconds, BackoffOptions, RetryQueue};

/// Errors raised by stores and queues
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Failed to decode job: {0}")]
    Decode(#[from] JobError),

    #[error("Backoff score {0} cannot be stored")]
    InvalidScore(f64),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Something that streams jobs into a pipeline.
///
/// `fetch` runs until cancelled or until the receiving side goes away, then
/// returns, dropping its sender so the channel closes.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch(
        &self,
        cancel: CancellationToken,
        jobs: mpsc::Sender<Arc<Job>>,
    ) -> Result<(), QueueError>;
}

/// A named queue that jobs can be fetched from, pushed to and removed from
#[async_trait]
pub trait Queue: JobSource {
    fn name(&self) -> &str;

    /// Add a job. Re-adding an existing job is not an error.
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Remove the entry holding exactly this job's bytes.
    /// Returns false when nothing was removed.
    async fn remove(&self, job: &Job) -> Result<bool, QueueError>;

    /// View this queue as a plain job source
    fn source(self: Arc<Self>) -> Arc<dyn JobSource>;
}

/// A stored member with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub member: Vec<u8>,
    pub score: f64,
}

/// Score-ordered storage
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Entries with score <= `max`, lowest score first, at most `limit`
    async fn range_by_score(&self, max: f64, limit: usize) -> Result<Vec<ScoredEntry>, QueueError>;

    /// Insert a member, or update its score if already present
    async fn add(&self, member: &[u8], score: f64) -> Result<(), QueueError>;

    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError>;
}

/// List-ordered storage
#[async_trait]
pub trait ListStore: Send + Sync {
    /// First `limit` members in list order
    async fn range(&self, limit: usize) -> Result<Vec<Vec<u8>>, QueueError>;

    async fn push(&self, member: &[u8]) -> Result<(), QueueError>;

    /// Remove the first occurrence of a member
    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError>;
}

/// Polling settings shared by every queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Maximum entries read per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_batch_size() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl FetchOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Decode stored members. An undecodable member fails the whole batch.
pub(crate) fn decode_members<I>(queue: &str, members: I) -> Result<Vec<Arc<Job>>, QueueError>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    members
        .into_iter()
        .map(|member| {
            Job::from_bytes(member).map(Arc::new).map_err(|e| {
                warn!(queue, error = %e, "Undecodable entry in queue");
                QueueError::from(e)
            })
        })
        .collect()
}

/// Shared polling loop: read a batch, deliver it, sleep, repeat.
pub(crate) async fn poll_into<F, Fut>(
    queue: &str,
    options: &FetchOptions,
    cancel: &CancellationToken,
    jobs: &mpsc::Sender<Arc<Job>>,
    mut next_batch: F,
) -> Result<(), QueueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Arc<Job>>, QueueError>>,
{
    loop {
        if cancel.is_cancelled() {
            debug!(queue, "Fetch cancelled");
            return Ok(());
        }

        let batch = next_batch().await?;
        debug!(queue, count = batch.len(), "Fetched batch");

        for job in batch {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        debug!(queue, "Receiver closed, stopping fetch");
                        return Ok(());
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(options.poll_interval()) => {}
        }
    }
}
