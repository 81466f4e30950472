//! requeue - Configurable job retry pipeline
//!
//! Polls a delayed retry queue, routes each job through a chain of
//! condition-gated decision trees, and finally hands it to a command
//! executor. Used to resubmit failed background jobs with exponential
//! backoff or purge them after too many attempts.
//!
//! # Architecture
//!
//! - Jobs are read without being consumed; an entry stays in its queue
//!   until a branch removes it
//! - Each decision tree runs one branch per job and may stop the chain
//! - Every action reports a single outcome; nested errors are aggregated
//!
//! # Modules
//!
//! - `adapters`: External command execution
//! - `core`: Conditions, actions, decision trees, the pipeline loop
//! - `domain`: Jobs and field paths
//! - `queue`: Retry and list queues over memory or Redis stores
//! - `config`: YAML configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a config and print the decision chain
//! requeue validate --config pipelines/sidekiq.yaml
//!
//! # Run until Ctrl-C
//! requeue run --config pipelines/sidekiq.yaml
//!
//! # Show the backoff score for a retry count
//! requeue score --retry-count 3
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod queue;

// Re-export main types at crate root for convenience
pub use crate::core::{build_pipeline, Condition, DecisionTree, Operator, Pipeline};
pub use domain::{FieldPath, FieldValue, Job};
pub use queue::{Queue, RetryQueue};
