//! TurnContext: the mutable object threaded through the pipeline stages.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use minder_core::{InboundMessage, OutboundMessage};
use minder_sessions::{Conversation, ConversationMessage};

use crate::skills::Skill;
use crate::tools::ToolRegistry;

/// Canonical cross-stage attributes. Stages communicate exclusively through
/// these; there are no ad-hoc string keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Attr {
    /// Array of threat labels found by sanitization.
    Threats,
    /// Input was rejected by sanitization; only the feedback and routing
    /// stages still apply.
    InputRejected,
    /// Compaction rewrote the history this turn.
    Compacted,
    /// Dynamic tier escalated the model selection.
    Escalated,
    /// Response preparation detected the voice prefix.
    VoiceRequested,
    /// Routing delivered (or conclusively failed to deliver) the response.
    Delivered,
    /// Why the tool loop stopped ("done", "llm_call_cap", "tool_cap",
    /// "deadline", "cancelled", "tool_failure", "confirmation_denied",
    /// "policy_denied").
    StopReason,
}

/// Concrete model resolution for the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub tier: String,
    pub model: String,
    pub reasoning_level: String,
    pub context_window: u32,
}

/// Mutable state of one turn. Created per inbound message, dropped when the
/// turn finishes. Each stage mutates only the attributes it declares.
pub struct TurnContext {
    /// Snapshot of the conversation, including its message log.
    pub conversation: Conversation,
    /// The (sanitized-in-place) inbound message.
    pub inbound: InboundMessage,
    /// Messages produced this turn, appended to the store when it ends.
    pub new_messages: Vec<ConversationMessage>,
    pub system_prompt: Option<String>,
    pub active_skill: Option<Arc<Skill>>,
    pub tools: ToolRegistry,
    pub model: Option<ModelSelection>,
    pub llm_calls: u32,
    pub tool_executions: u32,
    /// The text the turn will answer with, set by the tool loop (or a
    /// terminal synthesizer).
    pub final_text: Option<String>,
    /// The concrete outbound payload, set by response preparation.
    pub response: Option<OutboundMessage>,
    attrs: BTreeMap<Attr, Value>,
    pub cancel: CancellationToken,
    /// Wall-clock turn deadline.
    pub deadline: Instant,
}

impl TurnContext {
    pub fn new(
        conversation: Conversation,
        inbound: InboundMessage,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            conversation,
            inbound,
            new_messages: Vec::new(),
            system_prompt: None,
            active_skill: None,
            tools: ToolRegistry::new(),
            model: None,
            llm_calls: 0,
            tool_executions: 0,
            final_text: None,
            response: None,
            attrs: BTreeMap::new(),
            cancel,
            deadline,
        }
    }

    pub fn set_attr(&mut self, attr: Attr, value: Value) {
        self.attrs.insert(attr, value);
    }

    pub fn attr(&self, attr: Attr) -> Option<&Value> {
        self.attrs.get(&attr)
    }

    /// True when the attribute is present and not `false`/`null`.
    pub fn has_flag(&self, attr: Attr) -> bool {
        match self.attrs.get(&attr) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    pub fn rejected(&self) -> bool {
        self.has_flag(Attr::InputRejected)
    }

    /// History visible to the LLM: persisted log plus this turn's appends.
    pub fn full_history(&self) -> Vec<ConversationMessage> {
        let mut all =
            Vec::with_capacity(self.conversation.messages.len() + self.new_messages.len());
        all.extend_from_slice(&self.conversation.messages);
        all.extend_from_slice(&self.new_messages);
        all
    }
}
