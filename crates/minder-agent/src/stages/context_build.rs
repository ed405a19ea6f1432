//! Stage 3: context building.
//!
//! Selects the model tier, resolves the active skill, loads recent memory,
//! materializes the tool registry (native + the active skill's MCP tools),
//! and assembles the system prompt.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use minder_core::{MinderError, Result};
use minder_sessions::{ConversationMessage, Role};

use crate::context::{ModelSelection, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;
use crate::ports::ToolDefinition;
use crate::tools::{CurrentTimeTool, RecallTool, RememberTool};

pub struct ContextBuildStage;

#[async_trait]
impl Stage for ContextBuildStage {
    fn name(&self) -> &'static str {
        "context_building"
    }

    fn ordinal(&self) -> u32 {
        30
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        let key = ctx.conversation.key.clone();

        // Tier → concrete model.
        let tier_name = ctx
            .conversation
            .model_tier
            .clone()
            .unwrap_or_else(|| settings.agent.default_tier.clone());
        let tier = settings.tier(&tier_name).ok_or_else(|| {
            MinderError::Config(format!("tier '{tier_name}' is not configured"))
        })?;
        ctx.model = Some(ModelSelection {
            tier: tier_name.clone(),
            model: tier.model.clone(),
            reasoning_level: tier.reasoning_level.clone(),
            context_window: tier.context_window,
        });

        // The sanitized user message enters the turn's log here.
        ctx.new_messages.push(ConversationMessage::new(
            Role::User,
            ctx.inbound.content.clone(),
            deps.clock.now(),
        ));

        // Active skill: per-conversation choice, else the configured default.
        let skill_name = ctx
            .conversation
            .active_skill()
            .map(String::from)
            .or_else(|| settings.skills.default_skill.clone());
        if let Some(name) = &skill_name {
            match deps.skills.get(name) {
                Some(skill) => ctx.active_skill = Some(skill),
                None => debug!(skill = %name, "active skill not found, continuing without"),
            }
        }

        // Native tools.
        ctx.tools
            .register_native(Arc::new(CurrentTimeTool::new(deps.clock.clone())));
        ctx.tools.register_native(Arc::new(RememberTool::new(
            deps.memory.clone(),
            key.clone(),
        )));
        ctx.tools.register_native(Arc::new(RecallTool::new(
            deps.memory.clone(),
            key.clone(),
        )));

        // MCP tools contributed by the active skill. A failed MCP start
        // never fails the turn; the skill just contributes no tools.
        if let Some(skill) = ctx.active_skill.clone() {
            if let Some(spec) = &skill.mcp {
                match deps
                    .mcp
                    .get_or_start(&skill.name, spec, &skill.variables)
                    .await
                {
                    Ok(tools) => ctx.tools.register_mcp(&skill.name, &tools),
                    Err(e) => {
                        warn!(skill = %skill.name, error = %e, "mcp start failed, no tools from skill");
                    }
                }
            }
        }

        // Recent memory, best-effort.
        let memory_lines = match deps.memory.recent(&key, 5).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(conversation = %key, error = %e, "memory load failed");
                Vec::new()
            }
        };

        let tool_defs = ctx.tools.definitions();
        ctx.system_prompt = Some(build_system_prompt(
            &settings.agent.persona,
            ctx.active_skill.as_deref(),
            &memory_lines,
            &tool_defs,
        ));

        debug!(
            conversation = %key,
            tier = %tier_name,
            tools = ctx.tools.len(),
            skill = ctx.active_skill.as_ref().map(|s| s.name.as_str()).unwrap_or("-"),
            "context built"
        );
        Ok(())
    }
}

fn build_system_prompt(
    persona: &str,
    skill: Option<&crate::skills::Skill>,
    memory: &[String],
    tools: &[ToolDefinition],
) -> String {
    let mut prompt = String::from(persona);

    if let Some(skill) = skill {
        prompt.push_str("\n\n## Active skill: ");
        prompt.push_str(&skill.name);
        prompt.push('\n');
        prompt.push_str(&skill.body);
    }

    if !memory.is_empty() {
        prompt.push_str("\n\n## What you remember about this user\n");
        for line in memory {
            prompt.push_str("- ");
            prompt.push_str(line);
            prompt.push('\n');
        }
    }

    if !tools.is_empty() {
        prompt.push_str("\n\n## Available tools\n");
        for def in tools {
            prompt.push_str("- ");
            prompt.push_str(&def.name);
            if !def.description.is_empty() {
                prompt.push_str(": ");
                prompt.push_str(&def.description);
            }
            prompt.push('\n');
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_persona_skill_memory_and_tool_hints() {
        let skill = crate::skills::Skill {
            name: "calendar".into(),
            description: String::new(),
            body: "Be precise with dates.".into(),
            variables: Default::default(),
            mcp: None,
            available: true,
            sensitive_tools: vec![],
            transitions: vec![],
        };
        let tools = vec![ToolDefinition {
            name: "current_time".into(),
            description: "Get the current date and time in UTC.".into(),
            input_schema: serde_json::json!({}),
        }];
        let prompt = build_system_prompt(
            "You are Minder.",
            Some(&skill),
            &["likes tea".to_string()],
            &tools,
        );
        assert!(prompt.starts_with("You are Minder."));
        assert!(prompt.contains("## Active skill: calendar"));
        assert!(prompt.contains("Be precise with dates."));
        assert!(prompt.contains("- likes tea"));
        assert!(prompt.contains("## Available tools"));
        assert!(prompt.contains("- current_time: Get the current date and time in UTC."));
        // Each section is its own paragraph.
        assert!(prompt.contains("\n\n## Active skill"));
        assert!(prompt.contains("\n\n## Available tools"));
    }

    #[test]
    fn prompt_without_extras_is_just_persona() {
        assert_eq!(build_system_prompt("Base.", None, &[], &[]), "Base.");
    }
}
