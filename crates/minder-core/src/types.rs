use serde::{Deserialize, Serialize};

/// Identity of a conversation: one per `(channel_type, chat_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Logical channel name (e.g. "telegram", "webhook").
    pub channel: String,
    /// Platform-native chat identifier.
    pub chat_id: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.chat_id)
    }
}

/// A message received from an external channel, normalized for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical channel name the event arrived on.
    pub channel: String,
    /// Platform-native chat identifier (conversation scope).
    pub chat_id: String,
    /// Platform-native identifier for the sender.
    pub sender_id: String,
    /// Human-readable display name, if the platform provides one.
    pub sender_name: Option<String>,
    /// Plain text content.
    pub content: String,
    /// RFC3339 receive timestamp.
    pub timestamp: String,
}

impl InboundMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.channel.clone(), self.chat_id.clone())
    }
}

/// A message to be delivered to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Logical channel name to deliver on.
    pub channel: String,
    /// Platform-native recipient (chat) identifier.
    pub chat_id: String,
    /// Content to deliver.
    pub content: String,
    /// Formatting hint for the target platform.
    pub format: MessageFormat,
    /// When true the content should be synthesized and sent as voice,
    /// falling back to a text send if synthesis is unavailable.
    #[serde(default)]
    pub voice: bool,
}

/// Formatting hint for outbound message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    PlainText,
    Markdown,
    Html,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_display() {
        let key = ConversationKey::new("telegram", "12345");
        assert_eq!(key.to_string(), "telegram:12345");
    }

    #[test]
    fn outbound_voice_flag_defaults_false() {
        let json = r#"{"channel":"telegram","chat_id":"1","content":"hi","format":"plain_text"}"#;
        let msg: OutboundMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.voice);
    }
}
