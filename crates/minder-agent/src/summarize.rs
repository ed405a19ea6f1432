//! LLM-backed conversation summarization, used by the compaction stage
//! through the session store's `Summarizer` hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use minder_sessions::Summarizer;

use crate::ports::{ChatRequest, LlmPort};

const SUMMARY_SYSTEM: &str = "You are a conversation summarizer. Produce a compact \
summary of the transcript below that preserves user preferences, stated facts, open \
tasks, and decisions. Write plain prose, at most 200 words. Do not add commentary.";

pub struct LlmSummarizer {
    llm: Arc<dyn LlmPort>,
    /// Cheap model used for summarization (routing tier).
    model: String,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmPort>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String, String> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: SUMMARY_SYSTEM.to_string(),
            messages: vec![minder_sessions::ConversationMessage::new(
                minder_sessions::Role::User,
                format!("Summarize this conversation:\n\n{transcript}"),
                chrono::Utc::now(),
            )],
            tools: Vec::new(),
            temperature: Some(0.0),
            reasoning_level: None,
            timeout: self.timeout,
        };

        let response = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| e.to_string())?;
        if response.content.trim().is_empty() {
            return Err("empty summary".to_string());
        }
        Ok(response.content)
    }
}
