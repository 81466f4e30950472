//! Decision trees.
//!
//! A decision tree is a pipeline stage: it evaluates a condition, runs the
//! matching branch, and then either stops or hands the job to the next stage.
//! Trees are composed front to back into a single [`SharedAction`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::domain::Job;

use super::action::{run_in_task, Action, ActionErrors, NoopAction, Outcome, SharedAction};
use super::condition::Predicate;

/// One branch point in the chain
#[derive(Clone)]
pub struct DecisionTree {
    name: String,
    condition: Arc<dyn Predicate>,
    on_true: SharedAction,
    on_false: SharedAction,
    stop_on_true: bool,
    stop_on_false: bool,
}

impl DecisionTree {
    /// A tree that runs `on_true` or `on_false` and always continues
    pub fn new(
        name: impl Into<String>,
        condition: Arc<dyn Predicate>,
        on_true: SharedAction,
        on_false: SharedAction,
    ) -> Self {
        Self {
            name: name.into(),
            condition,
            on_true,
            on_false,
            stop_on_true: false,
            stop_on_false: false,
        }
    }

    /// A tree whose branches do nothing
    pub fn gate(name: impl Into<String>, condition: Arc<dyn Predicate>) -> Self {
        Self::new(
            name,
            condition,
            Arc::new(NoopAction::default()),
            Arc::new(NoopAction::default()),
        )
    }

    pub fn on_true(mut self, action: SharedAction) -> Self {
        self.on_true = action;
        self
    }

    pub fn on_false(mut self, action: SharedAction) -> Self {
        self.on_false = action;
        self
    }

    pub fn stop_on_true(mut self, stop: bool) -> Self {
        self.stop_on_true = stop;
        self
    }

    pub fn stop_on_false(mut self, stop: bool) -> Self {
        self.stop_on_false = stop;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wrap `next` so this tree runs first
    pub fn compose(self, next: SharedAction) -> SharedAction {
        Arc::new(DecisionStage { tree: self, next })
    }
}

/// Compose trees in declaration order in front of `terminal`
pub fn chain(trees: Vec<DecisionTree>, terminal: SharedAction) -> SharedAction {
    trees
        .into_iter()
        .rev()
        .fold(terminal, |next, tree| tree.compose(next))
}

struct DecisionStage {
    tree: DecisionTree,
    next: SharedAction,
}

#[async_trait]
impl Action for DecisionStage {
    fn name(&self) -> &str {
        &self.tree.name
    }

    async fn run(&self, cancel: CancellationToken, job: Arc<Job>) -> Outcome {
        let tree = &self.tree;
        let span = tracing::debug_span!("decision", tree = %tree.name);

        async move {
            let matched = tree.condition.evaluate(&job);
            let (branch, stop) = if matched {
                (tree.on_true.clone(), tree.stop_on_true)
            } else {
                (tree.on_false.clone(), tree.stop_on_false)
            };
            debug!(matched, branch = %branch.name(), stop, "Evaluated condition");

            let mut errors = ActionErrors::new();
            if let Err(e) = run_in_task(branch, cancel.clone(), job.clone()).await {
                errors.extend(e);
            }

            if stop {
                return errors.into_outcome();
            }

            if let Err(e) = run_in_task(self.next.clone(), cancel, job).await {
                errors.extend(e);
            }

            errors.into_outcome()
        }
        .instrument(span)
        .await
    }
}
