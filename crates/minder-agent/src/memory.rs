//! Storage-backed long-term memory: one observations file per
//! conversation under `memory/<channel>/<chat_id>/observations.jsonl`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use minder_core::{Clock, ConversationKey};
use minder_storage::{Storage, StorageError};

use crate::ports::MemoryPort;

#[derive(Debug, Serialize, Deserialize)]
struct Observation {
    observation: String,
    timestamp: DateTime<Utc>,
}

pub struct StorageMemory {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl StorageMemory {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    fn path(key: &ConversationKey) -> String {
        format!("memory/{}/{}/observations.jsonl", key.channel, key.chat_id)
    }

    async fn read_all(&self, key: &ConversationKey) -> Result<Vec<Observation>, String> {
        let text = match self.storage.get_text(&Self::path(key)).await {
            Ok(t) => t,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.to_string()),
        };
        let mut out = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Observation>(line) {
                Ok(o) => out.push(o),
                Err(e) => debug!(error = %e, "memory: skipping malformed observation line"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MemoryPort for StorageMemory {
    async fn remember(&self, key: &ConversationKey, observation: &str) -> Result<(), String> {
        let entry = Observation {
            observation: observation.to_string(),
            timestamp: self.clock.now(),
        };
        let line = serde_json::to_string(&entry).map_err(|e| e.to_string())?;
        self.storage
            .append_text(&Self::path(key), &format!("{line}\n"))
            .await
            .map_err(|e| e.to_string())
    }

    async fn recent(&self, key: &ConversationKey, limit: usize) -> Result<Vec<String>, String> {
        let all = self.read_all(key).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).map(|o| o.observation).collect())
    }

    async fn recall(
        &self,
        key: &ConversationKey,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>, String> {
        let needle = query.to_lowercase();
        let all = self.read_all(key).await?;
        Ok(all
            .into_iter()
            .rev()
            .filter(|o| o.observation.to_lowercase().contains(&needle))
            .take(limit)
            .map(|o| o.observation)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_core::SystemClock;
    use minder_storage::FsStorage;

    fn memory() -> (tempfile::TempDir, StorageMemory) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        (dir, StorageMemory::new(storage, Arc::new(SystemClock)))
    }

    fn key() -> ConversationKey {
        ConversationKey::new("telegram", "7")
    }

    #[tokio::test]
    async fn remember_then_recent_returns_tail() {
        let (_dir, mem) = memory();
        for i in 0..5 {
            mem.remember(&key(), &format!("fact {i}")).await.unwrap();
        }
        let recent = mem.recent(&key(), 2).await.unwrap();
        assert_eq!(recent, vec!["fact 3", "fact 4"]);
    }

    #[tokio::test]
    async fn recall_matches_case_insensitively() {
        let (_dir, mem) = memory();
        mem.remember(&key(), "Prefers Coffee in the morning").await.unwrap();
        mem.remember(&key(), "lives in Berlin").await.unwrap();
        let hits = mem.recall(&key(), "coffee", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("Coffee"));
    }

    #[tokio::test]
    async fn empty_memory_reads_empty() {
        let (_dir, mem) = memory();
        assert!(mem.recent(&key(), 10).await.unwrap().is_empty());
        assert!(mem.recall(&key(), "x", 10).await.unwrap().is_empty());
    }
}
