//! Stage 10: feedback guarantee.
//!
//! Whatever happened upstream, the user gets a reply: if no outbound was
//! produced, a fallback acknowledgement is synthesized.

use async_trait::async_trait;
use tracing::debug;

use minder_core::{MessageFormat, OutboundMessage, Result};

use crate::context::TurnContext;
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

pub struct FeedbackGuaranteeStage;

#[async_trait]
impl Stage for FeedbackGuaranteeStage {
    fn name(&self) -> &'static str {
        "feedback_guarantee"
    }

    fn ordinal(&self) -> u32 {
        100
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        ctx.response.is_none()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        debug!(
            conversation = %ctx.conversation.key,
            "no response produced upstream, synthesizing fallback acknowledgement"
        );
        let ack = settings.notices.fallback_ack.clone();
        ctx.final_text.get_or_insert_with(|| ack.clone());
        ctx.response = Some(OutboundMessage {
            channel: ctx.inbound.channel.clone(),
            chat_id: ctx.inbound.chat_id.clone(),
            content: ack,
            format: MessageFormat::PlainText,
            voice: false,
        });
        Ok(())
    }
}
