//! Pipeline construction from configuration.
//!
//! Resolves every name in a [`Config`] to a live object and composes the
//! decision chain. Any dangling reference fails the build before a single
//! job is fetched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::adapters::{CommandExecutor, CommandTemplate, TemplateError};
use crate::config::{BranchConfig, Config, DataSourceConfig, QueueConfig, QueueKind};
use crate::queue::{
    ListQueue, ListStore, MemoryListStore, MemoryScoreStore, Queue, RetryQueue, ScoreStore,
};

use super::action::{NoopAction, PushAction, RemoveAction, SharedAction};
use super::condition::Condition;
use super::decision::{chain, DecisionTree};
use super::pipeline::Pipeline;

/// Errors raised while building a pipeline
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Data source '{name}' is invalid: {reason}")]
    InvalidDataSource { name: String, reason: String },

    #[error("Queue '{queue}' references unknown data source '{data_source}'")]
    UnknownDataSource { queue: String, data_source: String },

    #[error("{context} references unknown queue '{queue}'")]
    UnknownQueue { context: String, queue: String },

    #[error("Decision tree '{0}' references unknown conditional")]
    UnknownCondition(String),

    #[error("{context} references unknown executor '{executor}'")]
    UnknownExecutor { context: String, executor: String },

    #[error("Branch '{branch}' of decision tree '{tree}' sets more than one target")]
    AmbiguousBranch { tree: String, branch: &'static str },

    #[error("Executor '{executor}' has an invalid template: {source}")]
    Template {
        executor: String,
        #[source]
        source: TemplateError,
    },

    #[error("Data source '{0}' uses Redis, but Redis support is not compiled in")]
    RedisUnavailable(String),

    #[cfg(feature = "redis")]
    #[error("Failed to connect data source '{name}': {source}")]
    Connect {
        name: String,
        #[source]
        source: crate::queue::QueueError,
    },
}

/// A built pipeline plus the queues it was built with
pub struct BuiltPipeline {
    pub pipeline: Pipeline,
    pub queues: HashMap<String, Arc<dyn Queue>>,
    /// One line per stage, in execution order
    pub stages: Vec<String>,
}

/// Stores keyed by storage key, so queues sharing a key share entries
#[derive(Default)]
struct MemoryBackend {
    scored: HashMap<String, Arc<MemoryScoreStore>>,
    lists: HashMap<String, Arc<MemoryListStore>>,
}

enum Backend {
    Memory(MemoryBackend),
    #[cfg(feature = "redis")]
    Redis(redis::aio::MultiplexedConnection),
}

impl Backend {
    fn score_store(&mut self, key: &str) -> Arc<dyn ScoreStore> {
        match self {
            Self::Memory(memory) => {
                let store: Arc<MemoryScoreStore> =
                    memory.scored.entry(key.to_string()).or_default().clone();
                store
            }
            #[cfg(feature = "redis")]
            Self::Redis(conn) => Arc::new(crate::queue::redis::RedisScoreStore::new(
                conn.clone(),
                key,
            )),
        }
    }

    fn list_store(&mut self, key: &str) -> Arc<dyn ListStore> {
        match self {
            Self::Memory(memory) => {
                let store: Arc<MemoryListStore> =
                    memory.lists.entry(key.to_string()).or_default().clone();
                store
            }
            #[cfg(feature = "redis")]
            Self::Redis(conn) => {
                Arc::new(crate::queue::redis::RedisListStore::new(conn.clone(), key))
            }
        }
    }
}

/// Build a runnable pipeline from a config
#[instrument(skip(config), fields(pipeline = %config.name))]
pub async fn build_pipeline(config: &Config) -> Result<BuiltPipeline, BuildError> {
    let mut backends = HashMap::new();
    for source in &config.data_sources {
        let backend = open_backend(source).await?;
        if backends.insert(source.name.clone(), backend).is_some() {
            return Err(duplicate("data source", &source.name));
        }
    }

    let mut queues: HashMap<String, Arc<dyn Queue>> = HashMap::new();
    for queue in &config.queues {
        let built = build_queue(queue, &mut backends)?;
        if queues.insert(queue.name.clone(), built).is_some() {
            return Err(duplicate("queue", &queue.name));
        }
    }

    let mut conditions = HashMap::new();
    for conditional in &config.conditionals {
        let condition = Condition::new(
            conditional.name.clone(),
            &conditional.element,
            conditional.operator,
            conditional.comparison.clone(),
        );
        if conditions
            .insert(conditional.name.clone(), Arc::new(condition))
            .is_some()
        {
            return Err(duplicate("conditional", &conditional.name));
        }
    }

    let mut executors: HashMap<String, SharedAction> = HashMap::new();
    for executor in &config.executors {
        let template =
            CommandTemplate::parse(&executor.command).map_err(|source| BuildError::Template {
                executor: executor.name.clone(),
                source,
            })?;
        let built = CommandExecutor::new(executor.name.clone(), template)
            .with_timeout(Duration::from_secs(executor.timeout_seconds))
            .with_shell(executor.shell.clone());
        if executors
            .insert(executor.name.clone(), Arc::new(built))
            .is_some()
        {
            return Err(duplicate("executor", &executor.name));
        }
    }

    let resolver = Resolver {
        queues: &queues,
        executors: &executors,
    };

    let mut trees = Vec::with_capacity(config.pipeline.decision_tree.len());
    let mut stages = Vec::with_capacity(config.pipeline.decision_tree.len() + 1);
    for decision in &config.pipeline.decision_tree {
        let condition = conditions
            .get(&decision.name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownCondition(decision.name.clone()))?;

        let (on_true, stop_on_true) =
            resolver.branch(&decision.name, "success", decision.success.as_ref())?;
        let (on_false, stop_on_false) =
            resolver.branch(&decision.name, "failure", decision.failure.as_ref())?;

        stages.push(format!(
            "{}: success -> {}{}, failure -> {}{}",
            decision.name,
            on_true.name(),
            if stop_on_true { " (stop)" } else { "" },
            on_false.name(),
            if stop_on_false { " (stop)" } else { "" },
        ));

        trees.push(
            DecisionTree::new(decision.name.clone(), condition, on_true, on_false)
                .stop_on_true(stop_on_true)
                .stop_on_false(stop_on_false),
        );
    }

    let terminal: SharedAction = match &config.pipeline.executor {
        Some(name) => resolver.executor("Pipeline", name)?,
        None => Arc::new(NoopAction::new("done")),
    };
    stages.push(format!("terminal: {}", terminal.name()));

    let source = resolver
        .queue("Pipeline getItems", &config.pipeline.get_items)?
        .source();

    let pipeline = Pipeline::new(config.name.clone(), source, chain(trees, terminal))
        .with_channel_capacity(config.pipeline.channel_capacity);

    info!(
        queues = queues.len(),
        stages = stages.len(),
        "Pipeline built"
    );

    Ok(BuiltPipeline {
        pipeline,
        queues,
        stages,
    })
}

struct Resolver<'a> {
    queues: &'a HashMap<String, Arc<dyn Queue>>,
    executors: &'a HashMap<String, SharedAction>,
}

impl Resolver<'_> {
    fn queue(&self, context: &str, name: &str) -> Result<Arc<dyn Queue>, BuildError> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownQueue {
                context: context.to_string(),
                queue: name.to_string(),
            })
    }

    fn executor(&self, context: &str, name: &str) -> Result<SharedAction, BuildError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownExecutor {
                context: context.to_string(),
                executor: name.to_string(),
            })
    }

    /// Action and stop flag for one branch; a missing branch is a no-op
    fn branch(
        &self,
        tree: &str,
        branch: &'static str,
        config: Option<&BranchConfig>,
    ) -> Result<(SharedAction, bool), BuildError> {
        let Some(config) = config else {
            let noop: SharedAction = Arc::new(NoopAction::default());
            return Ok((noop, false));
        };

        let targets = [
            config.push_items.is_some(),
            config.remove_items.is_some(),
            config.executor.is_some(),
        ];
        if targets.iter().filter(|set| **set).count() > 1 {
            return Err(BuildError::AmbiguousBranch {
                tree: tree.to_string(),
                branch,
            });
        }

        let context = format!("Branch '{}' of decision tree '{}'", branch, tree);
        let action: SharedAction = if let Some(name) = &config.push_items {
            Arc::new(PushAction::new(self.queue(&context, name)?))
        } else if let Some(name) = &config.remove_items {
            Arc::new(RemoveAction::new(self.queue(&context, name)?))
        } else if let Some(name) = &config.executor {
            self.executor(&context, name)?
        } else {
            Arc::new(NoopAction::default())
        };

        Ok((action, config.stop))
    }
}

async fn open_backend(source: &DataSourceConfig) -> Result<Backend, BuildError> {
    match (&source.redis, &source.memory) {
        (Some(_), Some(_)) => Err(BuildError::InvalidDataSource {
            name: source.name.clone(),
            reason: "both redis and memory are set".to_string(),
        }),
        (None, None) => Err(BuildError::InvalidDataSource {
            name: source.name.clone(),
            reason: "one of redis or memory must be set".to_string(),
        }),
        (None, Some(_)) => {
            debug!(data_source = %source.name, "Using in-memory store");
            Ok(Backend::Memory(MemoryBackend::default()))
        }
        (Some(redis), None) => open_redis(&source.name, &redis.url).await,
    }
}

#[cfg(feature = "redis")]
async fn open_redis(name: &str, url: &str) -> Result<Backend, BuildError> {
    if url.trim().is_empty() {
        return Err(BuildError::InvalidDataSource {
            name: name.to_string(),
            reason: format!("no url given and {} is not set", crate::config::REDIS_URL_ENV),
        });
    }

    let conn = crate::queue::redis::connect(url)
        .await
        .map_err(|source| BuildError::Connect {
            name: name.to_string(),
            source,
        })?;
    Ok(Backend::Redis(conn))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(name: &str, _url: &str) -> Result<Backend, BuildError> {
    Err(BuildError::RedisUnavailable(name.to_string()))
}

fn build_queue(
    config: &QueueConfig,
    backends: &mut HashMap<String, Backend>,
) -> Result<Arc<dyn Queue>, BuildError> {
    let backend =
        backends
            .get_mut(&config.data_source)
            .ok_or_else(|| BuildError::UnknownDataSource {
                queue: config.name.clone(),
                data_source: config.data_source.clone(),
            })?;

    debug!(queue = %config.name, key = config.key(), kind = ?config.kind, "Building queue");

    let queue: Arc<dyn Queue> = match config.kind {
        QueueKind::Zset => Arc::new(RetryQueue::new(
            config.name.clone(),
            backend.score_store(config.key()),
            config.backoff.clone(),
            config.fetch.clone(),
        )),
        QueueKind::List => Arc::new(ListQueue::new(
            config.name.clone(),
            backend.list_store(config.key()),
            config.fetch.clone(),
        )),
    };

    Ok(queue)
}

fn duplicate(kind: &'static str, name: &str) -> BuildError {
    BuildError::Duplicate {
        kind,
        name: name.to_string(),
    }
}
