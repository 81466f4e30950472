//! In-process stores.
//!
//! Used for tests and for `memory` data sources. Every operation takes the
//! store's lock once, so single-entry add/remove is atomic.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ListStore, QueueError, ScoreStore, ScoredEntry};

/// Score-ordered store, ordered by score then member bytes
#[derive(Debug, Default)]
pub struct MemoryScoreStore {
    entries: Mutex<HashMap<Vec<u8>, f64>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Current score of a member, if stored
    pub async fn score_of(&self, member: &[u8]) -> Option<f64> {
        self.entries.lock().await.get(member).copied()
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn range_by_score(&self, max: f64, limit: usize) -> Result<Vec<ScoredEntry>, QueueError> {
        let entries = self.entries.lock().await;

        let mut matched: Vec<ScoredEntry> = entries
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| ScoredEntry {
                member: member.clone(),
                score: *score,
            })
            .collect();

        matched.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        matched.truncate(limit);

        Ok(matched)
    }

    async fn add(&self, member: &[u8], score: f64) -> Result<(), QueueError> {
        self.entries.lock().await.insert(member.to_vec(), score);
        Ok(())
    }

    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError> {
        Ok(self.entries.lock().await.remove(member).is_some())
    }
}

/// List-ordered store
#[derive(Debug, Default)]
pub struct MemoryListStore {
    entries: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn range(&self, limit: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().take(limit).cloned().collect())
    }

    async fn push(&self, member: &[u8]) -> Result<(), QueueError> {
        self.entries.lock().await.push_back(member.to_vec());
        Ok(())
    }

    async fn remove(&self, member: &[u8]) -> Result<bool, QueueError> {
        let mut entries = self.entries.lock().await;
        match entries.iter().position(|m| m.as_slice() == member) {
            Some(position) => {
                entries.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
