//! Stage 9: response preparation.
//!
//! Turns the final assistant text into the concrete outbound payload,
//! detecting the voice prefix when voice output is enabled.

use async_trait::async_trait;
use serde_json::Value;

use minder_core::{MessageFormat, OutboundMessage, Result};

use crate::context::{Attr, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

pub struct ResponsePrepStage;

#[async_trait]
impl Stage for ResponsePrepStage {
    fn name(&self) -> &'static str {
        "response_preparation"
    }

    fn ordinal(&self) -> u32 {
        90
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        ctx.final_text.is_some() && ctx.response.is_none()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        let mut text = ctx.final_text.clone().unwrap_or_default();

        let mut voice = false;
        if settings.voice.enabled {
            let prefix = settings.voice.prefix.as_str();
            if !prefix.is_empty() && text.starts_with(prefix) {
                text = text[prefix.len()..].trim_start().to_string();
                voice = true;
                ctx.set_attr(Attr::VoiceRequested, Value::Bool(true));
            }
        }

        if text.trim().is_empty() {
            // Nothing usable; leave the slot empty for the feedback stage.
            return Ok(());
        }

        ctx.response = Some(OutboundMessage {
            channel: ctx.inbound.channel.clone(),
            chat_id: ctx.inbound.chat_id.clone(),
            content: text,
            format: MessageFormat::Markdown,
            voice,
        });
        Ok(())
    }
}
