//! Conversation sessions: the ordered message log behind every turn.
//!
//! One conversation per `(channel, chat_id)`, persisted as a directory of
//! `meta.json` + append-only `messages.jsonl` through the storage port.

mod error;
mod store;
mod types;

pub use error::{Result, SessionError};
pub use store::{SessionStore, Summarizer};
pub use types::{
    Conversation, ConversationMessage, ConversationState, ConversationSummary, Role,
    ToolCallRecord, VoiceMeta,
};
