//! Stage 11: routing.
//!
//! Delivers the outbound payload through the originating channel adapter.
//! Chunking, format fallback, and rate-limit retry live in the adapter;
//! voice synthesis (with text fallback) happens here.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use minder_core::{MinderError, Result};

use crate::context::{Attr, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

pub struct RoutingStage;

#[async_trait]
impl Stage for RoutingStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn ordinal(&self) -> u32 {
        110
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        ctx.response.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let response = ctx.response.clone().ok_or_else(|| {
            MinderError::Internal("routing entered without a response".into())
        })?;

        let Some(channel) = deps.channels.get(&response.channel) else {
            // Inbound-only sources (webhooks) have no outbound transport.
            debug!(channel = %response.channel, "no adapter for channel, dropping outbound");
            ctx.set_attr(Attr::Delivered, Value::Bool(false));
            return Ok(());
        };

        if response.voice {
            if let Some(voice) = &deps.voice {
                if voice.available() {
                    match voice.synthesize(&response.content).await {
                        Ok(audio) => {
                            match channel
                                .send_voice(&response.chat_id, &audio, Some(&response.content))
                                .await
                            {
                                Ok(()) => {
                                    ctx.set_attr(Attr::Delivered, Value::Bool(true));
                                    return Ok(());
                                }
                                Err(e) => {
                                    warn!(error = %e, "voice send failed, falling back to text");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "voice synthesis failed, falling back to text");
                        }
                    }
                }
            }
        }

        channel
            .send_message(&response.chat_id, &response)
            .await
            .map_err(|e| {
                ctx.set_attr(Attr::Delivered, Value::Bool(false));
                MinderError::upstream(format!("channel:{}", response.channel), e)
            })?;

        ctx.set_attr(Attr::Delivered, Value::Bool(true));
        Ok(())
    }
}
