//! Core pipeline logic.
//!
//! This module contains:
//! - Condition: field comparisons that pick a branch
//! - Action: what a job can be routed to (push, remove, execute, no-op)
//! - DecisionTree: condition-gated stages composed into one chain
//! - Pipeline: the fetch and dispatch loop
//! - Builder: turns a config into a runnable pipeline

pub mod action;
pub mod builder;
pub mod condition;
pub mod decision;
pub mod pipeline;

// Re-export commonly used types
pub use action::{
    run_in_task, Action, ActionError, ActionErrors, NoopAction, Outcome, PushAction,
    RemoveAction, SharedAction,
};
pub use builder::{build_pipeline, BuildError, BuiltPipeline};
pub use condition::{Condition, Literal, Operator, Predicate};
pub use decision::{chain, DecisionTree};
pub use pipeline::{Pipeline, PipelineError, PipelineStats, StatsSnapshot};
