//! Stage 4: dynamic tier escalation.
//!
//! Long or explicitly demanding messages upgrade the turn to a stronger
//! tier. Upgrades only — a downgrade would invalidate the compaction
//! estimate already made against the current window.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use minder_core::{Result, Settings};

use crate::context::{Attr, ModelSelection, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

/// Tier strength order, weakest first.
const TIER_ORDER: &[&str] = &["routing", "balanced", "coding", "smart", "deep"];

fn tier_rank(name: &str) -> Option<usize> {
    TIER_ORDER.iter().position(|t| *t == name)
}

pub struct DynamicTierStage;

#[async_trait]
impl Stage for DynamicTierStage {
    fn name(&self) -> &'static str {
        "dynamic_tier"
    }

    fn ordinal(&self) -> u32 {
        40
    }

    fn enabled(&self, settings: &Settings) -> bool {
        settings.agent.escalation.enabled
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && ctx.model.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        let escalation = &settings.agent.escalation;

        let current = ctx.model.as_ref().map(|m| m.tier.clone()).unwrap_or_default();
        let (Some(current_rank), Some(target_rank)) =
            (tier_rank(&current), tier_rank(&escalation.tier))
        else {
            return Ok(());
        };
        if target_rank <= current_rank {
            return Ok(());
        }

        let content = &ctx.inbound.content;
        let lowered = content.to_lowercase();
        let triggered = content.len() >= escalation.min_chars
            || escalation
                .triggers
                .iter()
                .any(|t| !t.is_empty() && lowered.contains(&t.to_lowercase()));
        if !triggered {
            return Ok(());
        }

        let Some(tier) = settings.tier(&escalation.tier) else {
            return Ok(());
        };
        info!(
            conversation = %ctx.conversation.key,
            from = %current,
            to = %escalation.tier,
            "escalating model tier"
        );
        ctx.model = Some(ModelSelection {
            tier: escalation.tier.clone(),
            model: tier.model.clone(),
            reasoning_level: tier.reasoning_level.clone(),
            context_window: tier.context_window,
        });
        ctx.set_attr(Attr::Escalated, Value::Bool(true));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_ordering_is_monotonic() {
        assert!(tier_rank("routing") < tier_rank("balanced"));
        assert!(tier_rank("balanced") < tier_rank("smart"));
        assert!(tier_rank("smart") < tier_rank("deep"));
        assert_eq!(tier_rank("unknown"), None);
    }
}
