use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use minder_core::{InboundMessage, OutboundMessage};

use crate::error::Result;

/// Outcome of publishing an inbound event to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The conversation's mailbox is full; the channel should reply with a
    /// transient-failure notice.
    Busy,
}

/// Coordinator entry point registered on a channel with `on_message`.
///
/// `enqueue` must return without waiting for the turn: the channel's
/// inbound loop never blocks on turn completion.
pub trait InboundHandler: Send + Sync {
    fn enqueue(&self, message: InboundMessage) -> EnqueueOutcome;
}

/// Runtime state of a channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Running,
    Stopped,
    Error(String),
}

/// Common interface implemented by every channel adapter.
///
/// `start`/`stop` are idempotent; `restart` (driven by the manager) is
/// `stop` then `start` with the adapter re-reading its settings snapshot.
/// Outbound sends are `&self` so a running adapter can deliver
/// concurrently from multiple tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier (e.g. "telegram"). Unique per manager.
    fn channel_type(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    fn status(&self) -> ChannelStatus;

    /// Register the coordinator entry point. Must be called before `start`.
    fn on_message(&self, handler: Arc<dyn InboundHandler>);

    /// Deliver text to a chat, splitting and retrying per the transport's
    /// rules.
    async fn send_message(&self, chat_id: &str, message: &OutboundMessage) -> Result<()>;

    /// Send synthesized audio as a voice message. Adapters fall back to a
    /// generic audio attachment when the peer refuses voice messages.
    async fn send_voice(&self, chat_id: &str, audio: &[u8], caption: Option<&str>) -> Result<()>;

    async fn send_photo(&self, chat_id: &str, image: &[u8], caption: Option<&str>) -> Result<()>;

    async fn send_document(
        &self,
        chat_id: &str,
        data: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<()>;

    async fn show_typing(&self, chat_id: &str) -> Result<()>;

    /// Admission check for a sender, delegated to the admission service.
    fn is_authorized(&self, sender_id: &str) -> bool;
}
