use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use minder_core::ConversationKey;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A tool invocation requested by an assistant message. Tool-role messages
/// reference these by `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Voice metadata attached to transcribed or synthesized messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceMeta {
    pub duration_secs: Option<f32>,
    pub format: Option<String>,
}

/// One entry in a conversation's ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set when `role == Tool`: the assistant tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceMeta>,
    /// Concrete model that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now,
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            voice: None,
            model: None,
            tier: None,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, content, now);
        msg.tool_call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Active,
    Archived,
}

/// Conversation header persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// UUIDv7 — time-sortable.
    pub id: String,
    pub key: ConversationKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub state: ConversationState,
    /// Preferred model tier for this conversation, when pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<String>,
    /// Free-form per-conversation metadata (active skill, flags).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Ordered message log. Append-only within a turn.
    #[serde(skip)]
    pub messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(key: ConversationKey, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            key,
            created_at: now,
            updated_at: now,
            state: ConversationState::Active,
            model_tier: None,
            metadata: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    /// Skill recorded as active for the next turn, if any.
    pub fn active_skill(&self) -> Option<&str> {
        self.metadata.get("active_skill").map(String::as_str)
    }

    pub fn set_active_skill(&mut self, skill: Option<&str>) {
        match skill {
            Some(name) => {
                self.metadata
                    .insert("active_skill".to_string(), name.to_string());
            }
            None => {
                self.metadata.remove("active_skill");
            }
        }
    }
}

/// Listing row for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub key: ConversationKey,
    pub state: ConversationState,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}
