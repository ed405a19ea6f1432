//! Conversation persistence over the storage port.
//!
//! Layout: `conversations/<channel>/<chat_id>/meta.json` + `messages.jsonl`
//! (one message per line, append-only). Compaction rewrites the log
//! atomically via the port's `replace_text`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use minder_core::{Clock, ConversationKey};
use minder_storage::{Storage, StorageError};

use crate::error::{Result, SessionError};
use crate::types::{
    Conversation, ConversationMessage, ConversationState, ConversationSummary, Role,
};

/// Summarization hook used by `compact`. Implemented by the agent crate on
/// top of the LLM port; `compact` falls back to truncation when the call
/// fails or no summarizer is supplied.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> std::result::Result<String, String>;
}

pub struct SessionStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    /// Per-conversation write locks. Turn serialization already guarantees
    /// one writer per conversation; this guards operator-surface calls
    /// (clear/compact) racing a turn.
    locks: DashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &ConversationKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn dir(key: &ConversationKey) -> String {
        format!("conversations/{}/{}", key.channel, key.chat_id)
    }

    fn meta_path(key: &ConversationKey) -> String {
        format!("{}/meta.json", Self::dir(key))
    }

    fn log_path(key: &ConversationKey) -> String {
        format!("{}/messages.jsonl", Self::dir(key))
    }

    /// Load an existing conversation or create (and persist) a fresh one.
    pub async fn load_or_create(&self, key: &ConversationKey) -> Result<Conversation> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        match self.storage.get_text(&Self::meta_path(key)).await {
            Ok(meta_json) => {
                let mut conv: Conversation = serde_json::from_str(&meta_json)?;
                conv.messages = self.read_log(key).await?;
                Ok(conv)
            }
            Err(StorageError::NotFound(_)) => {
                let conv = Conversation::new(key.clone(), self.clock.now());
                self.write_meta(&conv).await?;
                debug!(conversation = %key, id = %conv.id, "created conversation");
                Ok(conv)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append messages to the conversation log in order.
    ///
    /// Rejects a `tool` message that carries no `tool_call_id` — the log
    /// invariant ties every tool result to a preceding assistant call.
    pub async fn append_messages(
        &self,
        key: &ConversationKey,
        messages: &[ConversationMessage],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        for msg in messages {
            if msg.role == Role::Tool && msg.tool_call_id.is_none() {
                return Err(SessionError::InvalidMessage(
                    "tool message without tool_call_id".to_string(),
                ));
            }
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut batch = String::new();
        for msg in messages {
            batch.push_str(&serde_json::to_string(msg)?);
            batch.push('\n');
        }
        self.storage.append_text(&Self::log_path(key), &batch).await?;

        // Bump updated_at on the header.
        let mut conv: Conversation = match self.storage.get_text(&Self::meta_path(key)).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(StorageError::NotFound(_)) => Conversation::new(key.clone(), self.clock.now()),
            Err(e) => return Err(e.into()),
        };
        conv.updated_at = self.clock.now();
        self.write_meta(&conv).await
    }

    /// Persist header changes (state, tier, metadata) without touching the log.
    pub async fn update_meta(&self, conv: &mut Conversation) -> Result<()> {
        let lock = self.lock_for(&conv.key);
        let _guard = lock.lock().await;
        conv.updated_at = self.clock.now();
        self.write_meta(conv).await
    }

    /// Compact the log: summarize everything but the last `keep_last_n`
    /// messages into one `system` summary, or truncate when summarization
    /// is unavailable. Returns the number of messages removed.
    pub async fn compact(
        &self,
        key: &ConversationKey,
        keep_last_n: usize,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<usize> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let messages = self.read_log(key).await?;
        if messages.len() <= keep_last_n {
            return Ok(0);
        }

        let split = messages.len() - keep_last_n;
        let (old, recent) = messages.split_at(split);

        let summary_text = match summarizer {
            Some(s) => {
                let transcript: String = old
                    .iter()
                    .map(|m| format!("{}: {}", role_label(m.role), m.content))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                match s.summarize(&transcript).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(conversation = %key, error = %e, "compact: summarization failed, truncating");
                        None
                    }
                }
            }
            None => None,
        };

        let mut rewritten: Vec<ConversationMessage> = Vec::with_capacity(keep_last_n + 1);
        if let Some(text) = summary_text {
            rewritten.push(ConversationMessage::new(
                Role::System,
                format!("Summary of earlier conversation:\n{text}"),
                self.clock.now(),
            ));
        }
        rewritten.extend_from_slice(recent);

        let mut log = String::new();
        for msg in &rewritten {
            log.push_str(&serde_json::to_string(msg)?);
            log.push('\n');
        }
        self.storage.replace_text(&Self::log_path(key), &log).await?;

        debug!(
            conversation = %key,
            removed = old.len(),
            kept = recent.len(),
            "compacted conversation log"
        );
        Ok(old.len())
    }

    /// Operator action: mark a conversation archived. Archived
    /// conversations keep their log but stop accepting turns.
    pub async fn archive(&self, key: &ConversationKey) -> Result<()> {
        let mut conv = self.load_or_create(key).await?;
        conv.state = ConversationState::Archived;
        self.update_meta(&mut conv).await
    }

    /// Drop all messages but keep the conversation header.
    pub async fn clear(&self, key: &ConversationKey) -> Result<usize> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let count = self.read_log(key).await?.len();
        self.storage.delete(&Self::log_path(key)).await?;
        Ok(count)
    }

    /// Remove the conversation entirely.
    pub async fn delete(&self, key: &ConversationKey) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.storage.delete(&Self::dir(key)).await?;
        self.locks.remove(key);
        Ok(())
    }

    /// Channel-filtered summaries with message counts, newest first.
    pub async fn list(&self, channel: Option<&str>) -> Result<Vec<ConversationSummary>> {
        let channels = match channel {
            Some(c) => vec![c.to_string()],
            None => self.storage.list("conversations").await?,
        };

        let mut summaries = Vec::new();
        for ch in channels {
            for chat_id in self.storage.list(&format!("conversations/{ch}")).await? {
                let key = ConversationKey::new(ch.clone(), chat_id);
                let meta_json = match self.storage.get_text(&Self::meta_path(&key)).await {
                    Ok(json) => json,
                    Err(StorageError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                let conv: Conversation = match serde_json::from_str(&meta_json) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(conversation = %key, error = %e, "skipping unreadable meta.json");
                        continue;
                    }
                };
                let message_count = self.read_log(&key).await?.len();
                summaries.push(ConversationSummary {
                    id: conv.id,
                    key,
                    state: conv.state,
                    message_count,
                    updated_at: conv.updated_at,
                });
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn read_log(&self, key: &ConversationKey) -> Result<Vec<ConversationMessage>> {
        let text = match self.storage.get_text(&Self::log_path(key)).await {
            Ok(text) => text,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationMessage>(line) {
                Ok(mut msg) => {
                    msg.timestamp = normalize_utc(msg.timestamp);
                    messages.push(msg);
                }
                Err(e) => {
                    debug!(conversation = %key, error = %e, "skipping malformed log line");
                }
            }
        }
        Ok(messages)
    }

    async fn write_meta(&self, conv: &Conversation) -> Result<()> {
        let json = serde_json::to_string_pretty(conv)?;
        self.storage
            .replace_text(&Self::meta_path(&conv.key), &json)
            .await?;
        Ok(())
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "USER",
        Role::Assistant => "ASSISTANT",
        Role::System => "SYSTEM",
        Role::Tool => "TOOL",
    }
}

fn normalize_utc(ts: DateTime<Utc>) -> DateTime<Utc> {
    // Already UTC by type; kept as the single normalization point should
    // the wire format ever grow offsets.
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_core::SystemClock;
    use minder_storage::FsStorage;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        let store = SessionStore::new(storage, Arc::new(SystemClock));
        (dir, store)
    }

    fn key() -> ConversationKey {
        ConversationKey::new("telegram", "42")
    }

    #[tokio::test]
    async fn load_or_create_is_idempotent() {
        let (_dir, store) = store();
        let first = store.load_or_create(&key()).await.unwrap();
        let second = store.load_or_create(&key()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn append_preserves_order_across_reload() {
        let (_dir, store) = store();
        let k = key();
        store.load_or_create(&k).await.unwrap();

        let now = Utc::now();
        let batch: Vec<ConversationMessage> = (0..5)
            .map(|i| ConversationMessage::new(Role::User, format!("msg-{i}"), now))
            .collect();
        store.append_messages(&k, &batch).await.unwrap();

        let reloaded = store.load_or_create(&k).await.unwrap();
        let contents: Vec<&str> = reloaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn tool_message_without_call_id_is_rejected() {
        let (_dir, store) = store();
        let k = key();
        let bad = ConversationMessage::new(Role::Tool, "orphan", Utc::now());
        let err = store.append_messages(&k, &[bad]).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn compact_truncates_without_summarizer() {
        let (_dir, store) = store();
        let k = key();
        store.load_or_create(&k).await.unwrap();
        let now = Utc::now();
        let batch: Vec<ConversationMessage> = (0..10)
            .map(|i| ConversationMessage::new(Role::User, format!("m{i}"), now))
            .collect();
        store.append_messages(&k, &batch).await.unwrap();

        let removed = store.compact(&k, 4, None).await.unwrap();
        assert_eq!(removed, 6);

        let conv = store.load_or_create(&k).await.unwrap();
        assert_eq!(conv.messages.len(), 4);
        assert_eq!(conv.messages[0].content, "m6");
    }

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _transcript: &str) -> std::result::Result<String, String> {
            Ok("the user talked about cats".to_string())
        }
    }

    #[tokio::test]
    async fn compact_with_summarizer_prepends_system_summary() {
        let (_dir, store) = store();
        let k = key();
        store.load_or_create(&k).await.unwrap();
        let now = Utc::now();
        let batch: Vec<ConversationMessage> = (0..10)
            .map(|i| ConversationMessage::new(Role::User, format!("m{i}"), now))
            .collect();
        store.append_messages(&k, &batch).await.unwrap();

        let removed = store.compact(&k, 4, Some(&FixedSummarizer)).await.unwrap();
        assert_eq!(removed, 6);

        let conv = store.load_or_create(&k).await.unwrap();
        assert_eq!(conv.messages.len(), 5);
        assert_eq!(conv.messages[0].role, Role::System);
        assert!(conv.messages[0].content.contains("cats"));
    }

    #[tokio::test]
    async fn clear_empties_log_but_keeps_conversation() {
        let (_dir, store) = store();
        let k = key();
        let conv = store.load_or_create(&k).await.unwrap();
        store
            .append_messages(&k, &[ConversationMessage::new(Role::User, "hi", Utc::now())])
            .await
            .unwrap();

        let cleared = store.clear(&k).await.unwrap();
        assert_eq!(cleared, 1);
        let reloaded = store.load_or_create(&k).await.unwrap();
        assert_eq!(reloaded.id, conv.id);
        assert!(reloaded.messages.is_empty());
    }

    #[tokio::test]
    async fn archive_marks_state_and_survives_reload() {
        let (_dir, store) = store();
        let k = key();
        store.load_or_create(&k).await.unwrap();
        store.archive(&k).await.unwrap();
        let conv = store.load_or_create(&k).await.unwrap();
        assert_eq!(conv.state, ConversationState::Archived);
    }

    #[tokio::test]
    async fn list_filters_by_channel() {
        let (_dir, store) = store();
        store
            .load_or_create(&ConversationKey::new("telegram", "1"))
            .await
            .unwrap();
        store
            .load_or_create(&ConversationKey::new("webhook", "github"))
            .await
            .unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let tg = store.list(Some("telegram")).await.unwrap();
        assert_eq!(tg.len(), 1);
        assert_eq!(tg[0].key.channel, "telegram");
    }
}
