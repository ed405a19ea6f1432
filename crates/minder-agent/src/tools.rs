//! The per-turn tool registry and the native tools Minder ships.
//!
//! Tools come from two sources: native implementations of the [`Tool`]
//! trait and MCP catalogs contributed by the active skill. Both are
//! materialized into one registry by the context-building stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use minder_core::{Clock, ConversationKey};
use minder_mcp::McpToolDef;

use crate::ports::{MemoryPort, ToolDefinition};

/// Outcome of one tool execution, fed back to the LLM as a tool message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// A native tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Sensitive tools go through the confirmation flow when enabled.
    fn sensitive(&self) -> bool {
        false
    }

    /// Per-tool execution budget.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn execute(&self, arguments: Value) -> ToolResult;
}

/// Where a registered tool is executed.
#[derive(Clone)]
pub enum ToolEntry {
    Native(Arc<dyn Tool>),
    Mcp { skill: String, def: McpToolDef },
}

/// Tools available to one turn, in registration order. Names are unique
/// within a turn; a later registration with the same name is ignored.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: Vec<(String, ToolEntry)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        if self.get(&name).is_none() {
            self.entries.push((name, ToolEntry::Native(tool)));
        }
    }

    pub fn register_mcp(&mut self, skill: &str, defs: &[McpToolDef]) {
        for def in defs {
            if self.get(&def.name).is_none() {
                self.entries.push((
                    def.name.clone(),
                    ToolEntry::Mcp {
                        skill: skill.to_string(),
                        def: def.clone(),
                    },
                ));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }

    /// Definitions in registration order, as handed to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries
            .iter()
            .map(|(_, entry)| match entry {
                ToolEntry::Native(tool) => tool.definition(),
                ToolEntry::Mcp { def, .. } => ToolDefinition {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    input_schema: def.input_schema.clone(),
                },
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Native tools ──────────────────────────────────────────────────────────

/// Reports the current date and time.
pub struct CurrentTimeTool {
    clock: Arc<dyn Clock>,
}

impl CurrentTimeTool {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "current_time".to_string(),
            description: "Get the current date and time in UTC.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _arguments: Value) -> ToolResult {
        ToolResult::ok(self.clock.now().format("%Y-%m-%d %H:%M:%S UTC").to_string())
    }
}

/// Stores an observation about the user in long-term memory.
pub struct RememberTool {
    memory: Arc<dyn MemoryPort>,
    key: ConversationKey,
}

impl RememberTool {
    pub fn new(memory: Arc<dyn MemoryPort>, key: ConversationKey) -> Self {
        Self { memory, key }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "remember".to_string(),
            description: "Save an observation about the user for future conversations."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "observation": {
                        "type": "string",
                        "description": "One short fact worth keeping"
                    }
                },
                "required": ["observation"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let Some(observation) = arguments.get("observation").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: observation");
        };
        match self.memory.remember(&self.key, observation).await {
            Ok(()) => ToolResult::ok("Saved."),
            Err(e) => ToolResult::error(format!("memory write failed: {e}")),
        }
    }
}

/// Searches long-term memory.
pub struct RecallTool {
    memory: Arc<dyn MemoryPort>,
    key: ConversationKey,
}

impl RecallTool {
    pub fn new(memory: Arc<dyn MemoryPort>, key: ConversationKey) -> Self {
        Self { memory, key }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "recall".to_string(),
            description: "Search saved observations about the user.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "default": 5 }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let Some(query) = arguments.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: query");
        };
        let limit = arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        match self.memory.recall(&self.key, query, limit).await {
            Ok(hits) if hits.is_empty() => ToolResult::ok("No matching observations."),
            Ok(hits) => ToolResult::ok(hits.join("\n")),
            Err(e) => ToolResult::error(format!("memory search failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_core::SystemClock;

    #[tokio::test]
    async fn current_time_tool_reports_utc() {
        let tool = CurrentTimeTool::new(Arc::new(SystemClock));
        let result = tool.execute(json!({})).await;
        assert!(result.success);
        assert!(result.output.ends_with("UTC"));
    }

    #[test]
    fn registry_preserves_order_and_dedupes() {
        let mut registry = ToolRegistry::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        registry.register_native(Arc::new(CurrentTimeTool::new(clock.clone())));
        registry.register_native(Arc::new(CurrentTimeTool::new(clock)));
        registry.register_mcp(
            "cal",
            &[
                McpToolDef {
                    name: "t1".into(),
                    description: "one".into(),
                    input_schema: json!({}),
                },
                McpToolDef {
                    name: "current_time".into(), // shadowed by the native tool
                    description: "dup".into(),
                    input_schema: json!({}),
                },
            ],
        );

        let defs = registry.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["current_time", "t1"]);
        assert!(matches!(
            registry.get("current_time"),
            Some(ToolEntry::Native(_))
        ));
    }
}
