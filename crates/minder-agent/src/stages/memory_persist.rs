//! Stage 6: memory persistence.
//!
//! Extracts observations worth keeping from this turn's exchange (via a
//! cheap LLM call) and writes them to the memory store. Entirely
//! best-effort: no failure here may fail the turn.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use minder_core::Result;
use minder_sessions::{ConversationMessage, Role};

use crate::context::TurnContext;
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;
use crate::ports::ChatRequest;

/// Exchanges shorter than this are not worth an extraction call.
const MIN_EXCHANGE_CHARS: usize = 80;

const EXTRACT_SYSTEM: &str = "You extract durable facts about the user from a \
conversation exchange. Return ONLY a JSON array of short strings, each one fact \
worth remembering (preferences, stated facts, standing instructions). Return [] \
when nothing qualifies. Maximum 5 items.";

pub struct MemoryPersistStage;

#[async_trait]
impl Stage for MemoryPersistStage {
    fn name(&self) -> &'static str {
        "memory_persist"
    }

    fn ordinal(&self) -> u32 {
        60
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && ctx.final_text.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        let user_text = ctx.inbound.content.as_str();
        let assistant_text = ctx.final_text.as_deref().unwrap_or_default();
        if user_text.len() + assistant_text.len() < MIN_EXCHANGE_CHARS {
            return Ok(());
        }

        let Some(model) = settings.tier("routing").map(|t| t.model.clone()) else {
            return Ok(());
        };

        let request = ChatRequest {
            model,
            system: EXTRACT_SYSTEM.to_string(),
            messages: vec![ConversationMessage::new(
                Role::User,
                format!("USER: {user_text}\n\nASSISTANT: {assistant_text}"),
                deps.clock.now(),
            )],
            tools: Vec::new(),
            temperature: Some(0.0),
            reasoning_level: None,
            timeout: Duration::from_secs(settings.agent.llm_timeout_secs),
        };

        let response = match deps.llm.complete(&request).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "memory extraction call failed, skipping");
                return Ok(());
            }
        };

        let observations = parse_observations(&response.content);
        for observation in &observations {
            if let Err(e) = deps.memory.remember(&ctx.conversation.key, observation).await {
                warn!(
                    conversation = %ctx.conversation.key,
                    error = %e,
                    "memory write failed"
                );
            }
        }
        if !observations.is_empty() {
            debug!(
                conversation = %ctx.conversation.key,
                count = observations.len(),
                "persisted observations"
            );
        }
        Ok(())
    }
}

/// Pull a JSON string array out of the model's reply, tolerating code
/// fences and prose around it.
fn parse_observations(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let json_slice = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Vec::new(),
    };
    match serde_json::from_str::<Vec<String>>(json_slice) {
        Ok(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let obs = parse_observations(r#"["likes tea", "lives in Oslo"]"#);
        assert_eq!(obs, vec!["likes tea", "lives in Oslo"]);
    }

    #[test]
    fn parses_fenced_array() {
        let obs = parse_observations("```json\n[\"a fact\"]\n```");
        assert_eq!(obs, vec!["a fact"]);
    }

    #[test]
    fn prose_without_array_yields_nothing() {
        assert!(parse_observations("I found no facts.").is_empty());
        assert!(parse_observations("").is_empty());
    }
}
