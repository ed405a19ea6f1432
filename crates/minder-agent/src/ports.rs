//! Ports: the interfaces the core requires from external collaborators.
//!
//! Concrete LLM providers, voice engines, RAG backends, and command
//! handlers live outside this workspace; the pipeline only ever sees these
//! traits.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use minder_core::{ConversationKey, MinderError};
use minder_sessions::ConversationMessage;
use minder_usage::TokenUsage;

/// Tool definition handed to the LLM, materialized per turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema-like parameter description.
    pub input_schema: Value,
}

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Request to the LLM port.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    /// Full history including tool-role results; providers rebuild their
    /// native content blocks from `tool_calls`/`tool_call_id`.
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub reasoning_level: Option<String>,
    pub timeout: Duration,
}

/// Response from the LLM port.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: TokenUsage,
}

/// The LLM boundary. Implementations must honor tool-call schemas and
/// return `UpstreamUnavailable` on transport failure.
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Provider id used for usage accounting (e.g. "anthropic").
    fn provider_id(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, MinderError>;
}

/// Placeholder port for a process started without a configured provider.
/// Every call reports the upstream as unavailable; the turn degrades to the
/// fallback assistant message.
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmPort for UnconfiguredLlm {
    fn provider_id(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, MinderError> {
        Err(MinderError::upstream("llm", "no provider configured"))
    }
}

/// Long-term memory over conversations. Failures are strings because every
/// caller treats them as best-effort.
#[async_trait]
pub trait MemoryPort: Send + Sync {
    async fn remember(
        &self,
        key: &ConversationKey,
        observation: &str,
    ) -> Result<(), String>;

    /// Most recent observations, oldest first.
    async fn recent(&self, key: &ConversationKey, limit: usize) -> Result<Vec<String>, String>;

    async fn recall(
        &self,
        key: &ConversationKey,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>, String>;
}

/// Retrieval service boundary.
#[async_trait]
pub trait RagPort: Send + Sync {
    async fn query(&self, q: &str, mode: &str) -> Result<String, MinderError>;

    async fn index(&self, content: &str) -> Result<(), MinderError>;

    fn available(&self) -> bool;
}

/// Voice transcription/synthesis boundary.
#[async_trait]
pub trait VoicePort: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, MinderError>;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, MinderError>;

    async fn convert(&self, audio: &[u8], from: &str, to: &str) -> Result<Vec<u8>, MinderError>;

    fn available(&self) -> bool;
}

/// Output of a channel `/command`.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub output: String,
}

/// Operator command boundary; `/commands` are routed here before the
/// pipeline sees the message. Unknown commands fall through.
#[async_trait]
pub trait CommandPort: Send + Sync {
    fn has_command(&self, name: &str, channel: &str) -> bool;

    async fn execute(
        &self,
        name: &str,
        args: &str,
        key: &ConversationKey,
    ) -> Result<CommandOutput, MinderError>;
}

/// Confirmation boundary for sensitive tool executions. The tool loop
/// bounds the wait; an elapsed timeout counts as declined.
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
    async fn request(&self, tool_name: &str, arguments: &Value) -> bool;
}

/// Dense-vector embedding boundary.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MinderError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MinderError>;
}

/// Cosine similarity between two dense vectors. Zero when either has no
/// magnitude or the lengths differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.5, 0.7];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn unconfigured_llm_reports_upstream_unavailable() {
        let llm = UnconfiguredLlm;
        let req = ChatRequest {
            model: "m".into(),
            system: String::new(),
            messages: vec![],
            tools: vec![],
            temperature: None,
            reasoning_level: None,
            timeout: Duration::from_secs(1),
        };
        let err = llm.complete(&req).await.unwrap_err();
        assert_eq!(err.kind(), minder_core::ErrorKind::UpstreamUnavailable);
    }
}
