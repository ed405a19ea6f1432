//! Stage 5: the LLM ↔ tool-call loop.
//!
//! Flow: LLM call → if tool calls → execute the batch in order → results
//! back to the LLM → repeat. Stops on a plain response, a budget cap
//! (calls / executions / deadline), cancellation, or a termination flag.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use minder_core::{ErrorKind, MinderError, Result, Settings};
use minder_sessions::{ConversationMessage, Role, ToolCallRecord};
use minder_usage::TokenUsage;

use crate::context::{Attr, TurnContext};
use crate::coordinator::TurnDeps;
use crate::pipeline::Stage;
use crate::ports::{ChatRequest, ToolCall};
use crate::tools::{ToolEntry, ToolResult};

/// Marker appended to oversized tool results; visible to the LLM.
const TRUNCATION_MARKER: &str = "…[truncated]";

/// Why the loop stopped, recorded as `Attr::StopReason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Done,
    LlmCallCap,
    ToolCap,
    Deadline,
    LlmUnavailable,
    ToolFailure,
    ConfirmationDenied,
    PolicyDenied,
}

impl Stop {
    fn label(self) -> &'static str {
        match self {
            Stop::Done => "done",
            Stop::LlmCallCap => "llm_call_cap",
            Stop::ToolCap => "tool_cap",
            Stop::Deadline => "deadline",
            Stop::LlmUnavailable => "llm_unavailable",
            Stop::ToolFailure => "tool_failure",
            Stop::ConfirmationDenied => "confirmation_denied",
            Stop::PolicyDenied => "policy_denied",
        }
    }
}

pub struct ToolLoopStage;

#[async_trait]
impl Stage for ToolLoopStage {
    fn name(&self) -> &'static str {
        "tool_loop"
    }

    fn ordinal(&self) -> u32 {
        50
    }

    fn applies(&self, ctx: &TurnContext) -> bool {
        !ctx.rejected() && ctx.model.is_some() && ctx.system_prompt.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, deps: &TurnDeps) -> Result<()> {
        let settings = deps.settings.snapshot();
        let model = ctx.model.clone().ok_or_else(|| {
            MinderError::Internal("tool loop entered without model selection".into())
        })?;
        let system = ctx.system_prompt.clone().unwrap_or_default();
        let tool_defs = ctx.tools.definitions();
        let llm_timeout = Duration::from_secs(settings.agent.llm_timeout_secs);

        let stop = 'outer: loop {
            if ctx.cancel.is_cancelled() {
                return Err(MinderError::Cancelled);
            }
            if Instant::now() >= ctx.deadline {
                break Stop::Deadline;
            }
            if ctx.llm_calls >= settings.agent.max_llm_calls {
                break Stop::LlmCallCap;
            }

            let request = ChatRequest {
                model: model.model.clone(),
                system: system.clone(),
                messages: ctx.full_history(),
                tools: tool_defs.clone(),
                temperature: None,
                reasoning_level: Some(model.reasoning_level.clone()),
                timeout: llm_timeout,
            };

            debug!(iteration = ctx.llm_calls, "tool loop: calling LLM");
            let call_started = Instant::now();
            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(MinderError::Cancelled),
                r = deps.llm.complete(&request) => r,
            };
            ctx.llm_calls += 1;

            let response = match response {
                Ok(r) => {
                    let mut usage: TokenUsage = r.usage.clone();
                    usage.latency_ms
                        .get_or_insert(call_started.elapsed().as_millis() as u64);
                    deps.usage
                        .record(deps.llm.provider_id(), &r.model, usage)
                        .await;
                    r
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) if e.kind() == ErrorKind::UpstreamUnavailable => {
                    warn!(error = %e, "LLM unavailable, terminating turn with fallback");
                    break Stop::LlmUnavailable;
                }
                Err(e) => return Err(e),
            };

            // Assistant turn: content (appended before any tool result) plus
            // the tool-call records the tool messages will reference.
            let mut assistant = ConversationMessage::new(
                Role::Assistant,
                response.content.clone(),
                deps.clock.now(),
            );
            assistant.model = Some(response.model.clone());
            assistant.tier = Some(model.tier.clone());
            assistant.tool_calls = response
                .tool_calls
                .iter()
                .map(|c| ToolCallRecord {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect();
            ctx.new_messages.push(assistant);

            if response.tool_calls.is_empty() {
                ctx.final_text = Some(response.content);
                break Stop::Done;
            }

            // Execute the batch in the exact order the LLM returned; every
            // result is appended before the next LLM call.
            for call in &response.tool_calls {
                if ctx.cancel.is_cancelled() {
                    return Err(MinderError::Cancelled);
                }
                if ctx.tool_executions >= settings.agent.max_tool_executions {
                    break 'outer Stop::ToolCap;
                }

                let (result, cause) = execute_call(ctx, deps, &settings, call).await?;
                let truncated = truncate_result(
                    &result.output,
                    settings.agent.max_tool_result_chars,
                );
                ctx.new_messages.push(ConversationMessage::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    truncated,
                    deps.clock.now(),
                ));
                ctx.tool_executions += 1;

                if let Some(stop) = cause {
                    break 'outer stop;
                }
            }
        };

        ctx.set_attr(Attr::StopReason, Value::String(stop.label().to_string()));
        if stop != Stop::Done {
            let text = terminal_text(stop, &settings);
            if stop == Stop::LlmUnavailable {
                // The fallback is recorded in the session as well.
                ctx.new_messages.push(ConversationMessage::new(
                    Role::Assistant,
                    text.clone(),
                    deps.clock.now(),
                ));
            }
            ctx.final_text = Some(text);
        }

        info!(
            conversation = %ctx.conversation.key,
            llm_calls = ctx.llm_calls,
            tool_executions = ctx.tool_executions,
            stop = stop.label(),
            "tool loop finished"
        );
        Ok(())
    }
}

/// Resolve, confirm, and execute one tool call. Returns the result and an
/// optional loop-termination cause derived from the configured flags.
async fn execute_call(
    ctx: &TurnContext,
    deps: &TurnDeps,
    settings: &Settings,
    call: &ToolCall,
) -> Result<(ToolResult, Option<Stop>)> {
    let Some(entry) = ctx.tools.get(&call.name) else {
        debug!(tool = %call.name, "unknown tool requested");
        let stop = settings
            .agent
            .stop_on_tool_policy_denied
            .then_some(Stop::PolicyDenied);
        return Ok((
            ToolResult::error(format!("unknown tool: {}", call.name)),
            stop,
        ));
    };
    let entry = entry.clone();

    // Confirmation policy for sensitive tools.
    let sensitive = match &entry {
        ToolEntry::Native(tool) => tool.sensitive(),
        ToolEntry::Mcp { .. } => false,
    } || ctx
        .active_skill
        .as_ref()
        .map(|s| s.is_sensitive_tool(&call.name))
        .unwrap_or(false);

    if sensitive && settings.agent.confirmation.enabled {
        let approved = match &deps.confirmations {
            Some(port) => {
                let wait = Duration::from_secs(settings.agent.confirmation.timeout_secs);
                // An elapsed timeout counts as declined.
                (tokio::time::timeout(wait, port.request(&call.name, &call.arguments)).await)
                    .unwrap_or(false)
            }
            None => false,
        };
        if !approved {
            info!(tool = %call.name, "confirmation denied");
            let stop = settings
                .agent
                .stop_on_confirmation_denied
                .then_some(Stop::ConfirmationDenied);
            return Ok((
                ToolResult::error(format!("confirmation denied for tool: {}", call.name)),
                stop,
            ));
        }
    }

    let result = match entry {
        ToolEntry::Native(tool) => {
            let budget = tool.timeout();
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(MinderError::Cancelled),
                r = tokio::time::timeout(budget, tool.execute(call.arguments.clone())) => {
                    r.unwrap_or_else(|_| {
                        ToolResult::error(format!("tool '{}' timed out", call.name))
                    })
                }
            }
        }
        ToolEntry::Mcp { skill, .. } => {
            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(MinderError::Cancelled),
                r = deps.mcp.call_tool(&skill, &call.name, call.arguments.clone()) => r,
            };
            match outcome {
                Ok(output) => ToolResult {
                    success: output.success,
                    output: output.text,
                },
                Err(e) => ToolResult::error(format!("MCP call failed: {e}")),
            }
        }
    };

    let stop = (!result.success && settings.agent.stop_on_tool_failure)
        .then_some(Stop::ToolFailure);
    Ok((result, stop))
}

fn truncate_result(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{kept}{TRUNCATION_MARKER}")
}

fn terminal_text(stop: Stop, settings: &Settings) -> String {
    match stop {
        Stop::LlmCallCap => format!(
            "I'm sorry — I reached the limit of {} model calls while working on this, \
             so I stopped early. Ask me to continue and I'll pick it up from here.",
            settings.agent.max_llm_calls
        ),
        Stop::ToolCap => format!(
            "I'm sorry — I reached the limit of {} tool executions while working on \
             this, so I stopped early.",
            settings.agent.max_tool_executions
        ),
        Stop::Deadline => "I'm sorry — this request ran past its time budget, so I \
             stopped early."
            .to_string(),
        Stop::LlmUnavailable => "The language model is unreachable right now. Please \
             try again in a moment."
            .to_string(),
        Stop::ToolFailure => "A tool I needed failed, so I stopped here.".to_string(),
        Stop::ConfirmationDenied => {
            "That action needed confirmation and wasn't approved, so I stopped.".to_string()
        }
        Stop::PolicyDenied => {
            "A tool I tried to use isn't available, so I stopped here.".to_string()
        }
        Stop::Done => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_appends_visible_marker() {
        let out = truncate_result(&"x".repeat(50), 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn short_results_pass_untouched() {
        assert_eq!(truncate_result("ok", 100_000), "ok");
    }

    #[test]
    fn cap_apology_cites_the_limit() {
        let settings = Settings::default();
        let text = terminal_text(Stop::LlmCallCap, &settings);
        assert!(text.contains("200"));
        assert!(text.contains("model calls"));
    }
}
