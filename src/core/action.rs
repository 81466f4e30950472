//! Actions: the things a job can be routed to.
//!
//! Every action reports exactly one [`Outcome`]. Errors from nested actions
//! are gathered into [`ActionErrors`] and handed back up, never dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::adapters::TemplateError;
use crate::domain::Job;
use crate::queue::{Queue, QueueError};

/// A single failure raised while handling a job
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Queue '{queue}' failed: {source}")]
    Queue {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Command '{command}' exited with code {exit_code}: {stderr}")]
    Executor {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Action task panicked: {0}")]
    Panicked(String),
}

/// Every error reported by one action, including nested ones
#[derive(Debug, Default)]
pub struct ActionErrors(Vec<ActionError>);

impl ActionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ActionError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: ActionErrors) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when nothing was collected
    pub fn into_outcome(self) -> Outcome {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ActionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ActionErrors {}

impl From<ActionError> for ActionErrors {
    fn from(error: ActionError) -> Self {
        Self(vec![error])
    }
}

impl IntoIterator for ActionErrors {
    type Item = ActionError;
    type IntoIter = std::vec::IntoIter<ActionError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Result of running an action against one job
pub type Outcome = Result<(), ActionErrors>;

/// Something a job can be handed to.
///
/// The cancellation token is advisory: long-running actions may check it,
/// but an action that has started is allowed to finish.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken, job: Arc<Job>) -> Outcome;
}

pub type SharedAction = Arc<dyn Action>;

/// Run an action on its own task and wait for it.
///
/// A panic inside the action is reported as [`ActionError::Panicked`].
pub async fn run_in_task(action: SharedAction, cancel: CancellationToken, job: Arc<Job>) -> Outcome {
    let name = action.name().to_string();
    match tokio::spawn(async move { action.run(cancel, job).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(action = %name, error = %e, "Action task failed");
            Err(ActionError::Panicked(format!("{}: {}", name, e)).into())
        }
    }
}

/// Does nothing. Used for omitted branches.
#[derive(Debug, Clone)]
pub struct NoopAction {
    name: String,
}

impl NoopAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NoopAction {
    fn default() -> Self {
        Self::new("noop")
    }
}

#[async_trait]
impl Action for NoopAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: CancellationToken, _job: Arc<Job>) -> Outcome {
        Ok(())
    }
}

/// Pushes the job onto a queue (with backoff, for retry queues)
pub struct PushAction {
    name: String,
    queue: Arc<dyn Queue>,
}

impl PushAction {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            name: format!("push:{}", queue.name()),
            queue,
        }
    }
}

#[async_trait]
impl Action for PushAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: CancellationToken, job: Arc<Job>) -> Outcome {
        debug!(queue = %self.queue.name(), jid = job.id().unwrap_or("-"), "Pushing job");
        self.queue.push(&job).await.map_err(|source| {
            ActionErrors::from(ActionError::Queue {
                queue: self.queue.name().to_string(),
                source,
            })
        })
    }
}

/// Removes the job's exact entry from a queue
pub struct RemoveAction {
    name: String,
    queue: Arc<dyn Queue>,
}

impl RemoveAction {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            name: format!("remove:{}", queue.name()),
            queue,
        }
    }
}

#[async_trait]
impl Action for RemoveAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: CancellationToken, job: Arc<Job>) -> Outcome {
        match self.queue.remove(&job).await {
            Ok(_) => Ok(()),
            Err(source) => Err(ActionError::Queue {
                queue: self.queue.name().to_string(),
                source,
            }
            .into()),
        }
    }
}
