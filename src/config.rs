//! Pipeline configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (REDIS_URL fills Redis data sources without a url)
//! 2. Config file (YAML, path from `--config` or REQUEUE_CONFIG)
//!
//! Everything in the file is referenced by name: queues name a data source,
//! decision trees name a conditional, branches name queues and executors.
//! Names are resolved when the pipeline is built.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::condition::{Literal, Operator};
use crate::queue::{BackoffOptions, FetchOptions};

/// Environment variable holding a fallback Redis URL
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Top-level config file schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Pipeline name (used in logs)
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,

    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    #[serde(default)]
    pub conditionals: Vec<ConditionalConfig>,

    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,

    pub pipeline: PipelineConfig,
}

fn default_name() -> String {
    "requeue".to_string()
}

impl Config {
    /// Load a config from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Parse a config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config YAML")
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            self.fill_redis_url(&url);
        }
    }

    /// Use `url` for every Redis data source that has none
    pub fn fill_redis_url(&mut self, url: &str) {
        for source in &mut self.data_sources {
            if let Some(redis) = source.redis.as_mut() {
                if redis.url.trim().is_empty() {
                    redis.url = url.to_string();
                }
            }
        }
    }
}

/// A named storage backend. Exactly one of `redis` or `memory` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    pub name: String,

    #[serde(default)]
    pub redis: Option<RedisSourceConfig>,

    #[serde(default)]
    pub memory: Option<MemorySourceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisSourceConfig {
    /// Connection URL, e.g. redis://localhost:6379
    #[serde(default)]
    pub url: String,
}

/// In-process storage; contents are lost on exit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySourceConfig {}

/// How a queue orders its entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Score-ordered with backoff scheduling
    #[default]
    Zset,

    /// Insertion-ordered
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub name: String,

    /// Data source name
    pub data_source: String,

    #[serde(rename = "type", default)]
    pub kind: QueueKind,

    /// Storage key (defaults to the queue name)
    #[serde(default)]
    pub key: Option<String>,

    /// Backoff settings (zset only)
    #[serde(flatten)]
    pub backoff: BackoffOptions,

    #[serde(flatten)]
    pub fetch: FetchOptions,
}

impl QueueConfig {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

/// A named condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalConfig {
    pub name: String,
    pub operator: Operator,
    /// Field path, e.g. `payload.args[0]`
    pub element: String,
    pub comparison: Literal,
}

/// A named shell command executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub name: String,

    /// Command template with `{path}` placeholders
    #[serde(alias = "sprintf")]
    pub command: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_timeout_seconds() -> u64 {
    300
}
fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Queue jobs are fetched from
    pub get_items: String,

    /// Stages, run in order
    #[serde(default)]
    pub decision_tree: Vec<DecisionConfig>,

    /// Executor run when no stage stops the chain
    #[serde(default)]
    pub executor: Option<String>,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    64
}

/// One decision tree stage; `name` names a conditional
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    pub name: String,

    #[serde(default)]
    pub success: Option<BranchConfig>,

    #[serde(default)]
    pub failure: Option<BranchConfig>,
}

/// What a branch does. At most one of the three targets may be set;
/// none means the branch does nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    #[serde(default)]
    pub push_items: Option<String>,

    #[serde(default)]
    pub remove_items: Option<String>,

    #[serde(default)]
    pub executor: Option<String>,

    /// Stop the chain after this branch
    #[serde(rename = "return", default)]
    pub stop: bool,
}
