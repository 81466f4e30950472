//! Redis-backed stores.
//!
//! Sorted sets back score stores, lists back list stores. Both share one
//! multiplexed connection per data source.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use super::{ListStore, QueueError, ScoreStore, ScoredEntry};

/// Open a multiplexed connection for a data source
pub async fn connect(url: &str) -> Result<MultiplexedConnection, QueueError> {
    let client = redis::Client::open(url)?;
    let conn = client.get_multiplexed_async_connection().await?;
    debug!(url, "Connected to Redis");
    Ok(conn)
}

/// Sorted set store (`ZRANGEBYSCORE`, `ZADD`, `ZREM`)
#[derive(Clone)]
pub struct RedisScoreStore {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisScoreStore {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }
}

#[async_trait]
impl ScoreStore for RedisScoreStore {
    #[instrument(skip(self), fields(key = %self.key), err)]
    async fn range_by_score(&self, max: f64, limit: usize) -> Result<Vec<ScoredEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(Vec<u8>, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredEntry { member, score })
            .collect())
    }

    async fn add(&self, member: &[u8], score: f64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// List store (`LRANGE`, `RPUSH`, `LREM`)
#[derive(Clone)]
pub struct RedisListStore {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisListStore {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    #[instrument(skip(self), fields(key = %self.key), err)]
    async fn range(&self, limit: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        // LRANGE 0 -1 would mean "everything"
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let members: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn push(&self, member: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.key)
            .arg(1)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
