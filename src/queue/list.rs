//! List-ordered queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::Job;

use super::{decode_members, poll_into, FetchOptions, JobSource, ListStore, Queue, QueueError};

/// Queue over a list store. Fetch reads the leading entries without
/// consuming them; removal drops the first matching entry.
pub struct ListQueue {
    name: String,
    store: Arc<dyn ListStore>,
    fetch: FetchOptions,
}

impl ListQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn ListStore>, fetch: FetchOptions) -> Self {
        Self {
            name: name.into(),
            store,
            fetch,
        }
    }

    pub async fn fetch_batch(&self) -> Result<Vec<Arc<Job>>, QueueError> {
        let members = self.store.range(self.fetch.batch_size).await?;
        decode_members(&self.name, members)
    }
}

#[async_trait]
impl JobSource for ListQueue {
    async fn fetch(
        &self,
        cancel: CancellationToken,
        jobs: mpsc::Sender<Arc<Job>>,
    ) -> Result<(), QueueError> {
        info!(queue = %self.name, "Starting list queue fetch");
        poll_into(&self.name, &self.fetch, &cancel, &jobs, || self.fetch_batch()).await
    }
}

#[async_trait]
impl Queue for ListQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.store.push(job.raw()).await
    }

    async fn remove(&self, job: &Job) -> Result<bool, QueueError> {
        let removed = self.store.remove(job.raw()).await?;
        info!(
            queue = %self.name,
            jid = job.id().unwrap_or("-"),
            removed,
            "Removed from list queue"
        );
        Ok(removed)
    }

    fn source(self: Arc<Self>) -> Arc<dyn JobSource> {
        self
    }
}
