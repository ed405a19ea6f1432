//! Stage 7: skill auto-transition.
//!
//! When the active skill declares transition rules and one matches the
//! final assistant text, the conversation's active skill changes for the
//! next turn.

use async_trait::async_trait;
use tracing::{info, warn};

use minder_core::Result;

use crate::context::TurnContext;
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

pub struct SkillTransitionStage;

#[async_trait]
impl Stage for SkillTransitionStage {
    fn name(&self) -> &'static str {
        "skill_pipeline"
    }

    fn ordinal(&self) -> u32 {
        70
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && ctx.active_skill.is_some() && ctx.final_text.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let (Some(skill), Some(text)) = (&ctx.active_skill, &ctx.final_text) else {
            return Ok(());
        };

        let Some(next) = skill.next_skill(text) else {
            return Ok(());
        };
        if deps.skills.get(next).is_none() {
            warn!(from = %skill.name, to = %next, "transition target skill missing");
            return Ok(());
        }

        info!(
            conversation = %ctx.conversation.key,
            from = %skill.name,
            to = %next,
            "skill transition"
        );
        let next = next.to_string();
        ctx.conversation.set_active_skill(Some(&next));
        if let Err(e) = deps.sessions.update_meta(&mut ctx.conversation).await {
            warn!(conversation = %ctx.conversation.key, error = %e, "failed to persist skill transition");
        }
        Ok(())
    }
}
