//! Stage 2: auto-compaction.
//!
//! When the token estimate for the history approaches the tier's context
//! window, older messages are folded into one system summary (LLM-backed,
//! truncation fallback) and the context reloads the rewritten log.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use minder_core::Result;

use crate::context::{Attr, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;
use crate::summarize::LlmSummarizer;

/// Tokens reserved for the system prompt and the model's reply.
const RESERVE_TOKENS: usize = 2000;

pub struct CompactionStage;

#[async_trait]
impl Stage for CompactionStage {
    fn name(&self) -> &'static str {
        "auto_compaction"
    }

    fn ordinal(&self) -> u32 {
        20
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && !ctx.conversation.messages.is_empty()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();

        let tier_name = ctx
            .conversation
            .model_tier
            .clone()
            .unwrap_or_else(|| settings.agent.default_tier.clone());
        let window = settings
            .tier(&tier_name)
            .map(|t| t.context_window)
            .unwrap_or(200_000) as usize;

        let estimate = estimate_tokens(ctx) + RESERVE_TOKENS;
        let threshold = (window as f32 * settings.compaction.trigger_ratio) as usize;
        if estimate < threshold {
            debug!(estimate, threshold, "compaction not needed");
            return Ok(());
        }

        info!(
            conversation = %ctx.conversation.key,
            estimate,
            threshold,
            "history near context limit, compacting"
        );

        let summarizer_model = settings
            .tier("routing")
            .map(|t| t.model.clone())
            .unwrap_or_else(|| tier_name.clone());
        let summarizer = LlmSummarizer::new(
            deps.llm.clone(),
            summarizer_model,
            Duration::from_secs(settings.agent.llm_timeout_secs),
        );

        let removed = deps
            .sessions
            .compact(
                &ctx.conversation.key,
                settings.compaction.keep_recent,
                Some(&summarizer),
            )
            .await
            .map_err(|e| minder_core::MinderError::Internal(e.to_string()))?;

        if removed > 0 {
            // Reload the rewritten log into the turn's snapshot.
            let refreshed = deps
                .sessions
                .load_or_create(&ctx.conversation.key)
                .await
                .map_err(|e| minder_core::MinderError::Internal(e.to_string()))?;
            ctx.conversation = refreshed;
            ctx.set_attr(Attr::Compacted, Value::from(removed));
        }
        Ok(())
    }
}

/// ~4 chars per token across the persisted log plus this turn's appends.
fn estimate_tokens(ctx: &TurnContext) -> usize {
    let chars: usize = ctx
        .conversation
        .messages
        .iter()
        .chain(ctx.new_messages.iter())
        .map(|m| m.content.len())
        .sum::<usize>()
        + ctx.inbound.content.len();
    chars.div_ceil(4)
}
