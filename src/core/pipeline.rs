//! Pipeline orchestration.
//!
//! A pipeline pulls jobs from a source and hands each one to the composed
//! decision chain on its own task. Jobs are not ordered relative to each
//! other; within one job the chain runs in declaration order.
//!
//! Sources redeliver entries until they are removed, so a job can arrive
//! again while its chain is still running. Such deliveries are skipped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::domain::Job;
use crate::queue::{JobSource, QueueError};

use super::action::{run_in_task, SharedAction};

/// Errors that stop a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job source failed: {0}")]
    Source(#[from] QueueError),

    #[error("Fetch task failed: {0}")]
    FetchTask(String),
}

/// Outcome counters for one pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Deliveries dropped because the same job was still being handled
    pub skipped: u64,
}

impl StatsSnapshot {
    /// Jobs dispatched but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.dispatched
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Raw payloads of the jobs currently being handled
#[derive(Debug, Default)]
struct Claims(Mutex<HashSet<Vec<u8>>>);

impl Claims {
    /// Claim a payload, or `None` if it is already claimed
    fn claim(self: &Arc<Self>, raw: &[u8]) -> Option<Claim> {
        if !self.lock().insert(raw.to_vec()) {
            return None;
        }
        Some(Claim {
            claims: self.clone(),
            raw: raw.to_vec(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Vec<u8>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its payload when dropped
struct Claim {
    claims: Arc<Claims>,
    raw: Vec<u8>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.raw);
    }
}

fn default_channel_capacity() -> usize {
    64
}

/// A job source wired to a decision chain
pub struct Pipeline {
    name: String,
    source: Arc<dyn JobSource>,
    chain: SharedAction,
    channel_capacity: usize,
    stats: Arc<PipelineStats>,
    claims: Arc<Claims>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, source: Arc<dyn JobSource>, chain: SharedAction) -> Self {
        Self {
            name: name.into(),
            source,
            chain,
            channel_capacity: default_channel_capacity(),
            stats: Arc::new(PipelineStats::default()),
            claims: Arc::new(Claims::default()),
        }
    }

    /// Size of the buffer between the fetch task and dispatch
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &SharedAction {
        &self.chain
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until cancelled or until the source fails.
    ///
    /// Jobs already dispatched are allowed to finish before this returns.
    #[instrument(skip(self, cancel), fields(pipeline = %self.name))]
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::channel::<Arc<Job>>(self.channel_capacity);

        let source = self.source.clone();
        let fetch_cancel = cancel.child_token();
        let mut fetch =
            tokio::spawn(async move { source.fetch(fetch_cancel, tx).await }.in_current_span());
        let mut fetch_done = false;

        let mut in_flight: JoinSet<()> = JoinSet::new();
        info!("Pipeline started");

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Pipeline cancelled");
                    break Ok(());
                }

                joined = &mut fetch, if !fetch_done => {
                    fetch_done = true;
                    match fetch_result(joined) {
                        Ok(()) => debug!("Source finished, draining delivered jobs"),
                        Err(e) => {
                            error!(error = %e, "Job source failed");
                            break Err(e);
                        }
                    }
                }

                received = rx.recv() => match received {
                    Some(job) => self.dispatch(&mut in_flight, &cancel, job),
                    None => {
                        if fetch_done {
                            break Ok(());
                        }
                        fetch_done = true;
                        let finished = fetch_result((&mut fetch).await);
                        if let Err(e) = &finished {
                            error!(error = %e, "Job source failed");
                        }
                        break finished;
                    }
                },

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatch task failed");
                    }
                }
            }
        };

        drop(rx);
        if !fetch_done {
            if let Err(e) = fetch_result(fetch.await) {
                warn!(error = %e, "Job source failed during shutdown");
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch task failed");
            }
        }

        let stats = self.stats.snapshot();
        info!(
            dispatched = stats.dispatched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "Pipeline stopped"
        );

        result
    }

    fn dispatch(&self, in_flight: &mut JoinSet<()>, cancel: &CancellationToken, job: Arc<Job>) {
        let Some(claim) = self.claims.claim(job.raw()) else {
            self.stats.record_skipped();
            debug!(jid = job.id().unwrap_or("-"), "Job already in flight, skipping");
            return;
        };

        let dispatch_id = Uuid::new_v4();
        let span = info_span!(
            "dispatch",
            %dispatch_id,
            jid = job.id().unwrap_or("-")
        );

        let chain = self.chain.clone();
        let stats = self.stats.clone();
        let cancel = cancel.clone();
        stats.record_dispatched();

        in_flight.spawn(
            async move {
                let _claim = claim;
                let started = Instant::now();
                match run_in_task(chain, cancel, job).await {
                    Ok(()) => {
                        stats.record_success();
                        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Job handled");
                    }
                    Err(errors) => {
                        stats.record_failure();
                        for e in errors.iter() {
                            error!(error = %e, "Action failed");
                        }
                        warn!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            errors = errors.len(),
                            "Job handling failed"
                        );
                    }
                }
            }
            .instrument(span),
        );
    }
}

fn fetch_result(joined: Result<Result<(), QueueError>, JoinError>) -> Result<(), PipelineError> {
    match joined {
        Ok(result) => result.map_err(PipelineError::from),
        Err(e) => Err(PipelineError::FetchTask(e.to_string())),
    }
}
