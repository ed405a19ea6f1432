//! The stage pipeline: an ordered list of single-responsibility stages run
//! sequentially over one TurnContext.
//!
//! Each stage declares a name, an ordinal, an `enabled` runtime gate read
//! from settings, and an `applies` predicate over the context. Stages talk
//! to each other only through the canonical attributes on the context.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use minder_core::{MinderError, Result, Settings};

use crate::context::TurnContext;
use crate::coordinator::TurnDeps;
use crate::stages;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advisory ordering key; the pipeline sorts by it at construction.
    fn ordinal(&self) -> u32;

    /// Runtime on/off switch, re-read from the settings snapshot per turn.
    fn enabled(&self, _settings: &Settings) -> bool {
        true
    }

    /// Whether the stage applies to this particular context.
    fn applies(&self, _ctx: &TurnContext) -> bool {
        true
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()>;
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Build a pipeline from stages, sorting by ordinal. Duplicate stage
    /// names are a wiring bug and rejected.
    pub fn new(mut stages: Vec<Arc<dyn Stage>>) -> Result<Self> {
        stages.sort_by_key(|s| s.ordinal());
        for pair in stages.windows(2) {
            if pair[0].name() == pair[1].name() {
                return Err(MinderError::Config(format!(
                    "duplicate pipeline stage: {}",
                    pair[0].name()
                )));
            }
        }
        Ok(Self { stages })
    }

    /// The standard eleven-stage turn pipeline.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(stages::sanitize::SanitizeStage),
            Arc::new(stages::compaction::CompactionStage),
            Arc::new(stages::context_build::ContextBuildStage),
            Arc::new(stages::tier::DynamicTierStage),
            Arc::new(stages::tool_loop::ToolLoopStage),
            Arc::new(stages::memory_persist::MemoryPersistStage),
            Arc::new(stages::skill_transition::SkillTransitionStage),
            Arc::new(stages::rag_index::RagIndexStage),
            Arc::new(stages::response_prep::ResponsePrepStage),
            Arc::new(stages::feedback::FeedbackGuaranteeStage),
            Arc::new(stages::routing::RoutingStage),
        ])
        .expect("standard pipeline stage set is statically valid")
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every enabled, applicable stage in order. Cancellation is
    /// observed between stages; `Cancelled` is never swallowed.
    #[instrument(skip_all, fields(conversation = %ctx.conversation.key))]
    pub async fn run(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        for stage in &self.stages {
            if ctx.cancel.is_cancelled() {
                return Err(MinderError::Cancelled);
            }

            let settings = deps.settings.snapshot();
            if !stage.enabled(&settings) {
                debug!(stage = stage.name(), "stage disabled, skipping");
                continue;
            }
            if !stage.applies(ctx) {
                debug!(stage = stage.name(), "stage does not apply, skipping");
                continue;
            }

            debug!(stage = stage.name(), "running stage");
            stage.process(ctx, deps).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_pipeline_order() {
        let pipeline = Pipeline::standard();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "input_sanitization",
                "auto_compaction",
                "context_building",
                "dynamic_tier",
                "tool_loop",
                "memory_persist",
                "skill_pipeline",
                "rag_indexing",
                "response_preparation",
                "feedback_guarantee",
                "routing",
            ]
        );
    }
}
