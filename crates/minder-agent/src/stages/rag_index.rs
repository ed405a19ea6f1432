//! Stage 8: RAG indexing. Submits the turn's exchange to the retrieval
//! service; strictly best-effort.

use async_trait::async_trait;
use tracing::debug;

use minder_core::{Result, Settings};

use crate::context::TurnContext;
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;

pub struct RagIndexStage;

#[async_trait]
impl Stage for RagIndexStage {
    fn name(&self) -> &'static str {
        "rag_indexing"
    }

    fn ordinal(&self) -> u32 {
        80
    }

    fn enabled(&self, settings: &Settings) -> bool {
        settings.rag.enabled
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && ctx.final_text.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let Some(rag) = &deps.rag else {
            return Ok(());
        };
        if !rag.available() {
            return Ok(());
        }

        let excerpt = format!(
            "[{}] User: {}\nAssistant: {}",
            ctx.conversation.key,
            ctx.inbound.content,
            ctx.final_text.as_deref().unwrap_or_default()
        );
        if let Err(e) = rag.index(&excerpt).await {
            debug!(conversation = %ctx.conversation.key, error = %e, "rag indexing failed");
        }
        Ok(())
    }
}
