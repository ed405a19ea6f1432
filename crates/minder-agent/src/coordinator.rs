//! The turn coordinator: accepts inbound messages from channels, serializes
//! turns per conversation through bounded mailboxes, and runs the pipeline
//! on a capped worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use minder_channels::{ChannelManager, EnqueueOutcome, InboundHandler};
use minder_core::{
    Clock, ConversationKey, ErrorKind, InboundMessage, MessageFormat, OutboundMessage,
    SettingsStore,
};
use minder_mcp::McpPool;
use minder_sessions::{ConversationMessage, Role, SessionStore};
use minder_usage::UsageTracker;

use crate::context::{Attr, TurnContext};
use crate::pipeline::Pipeline;
use crate::ports::{ConfirmationPort, LlmPort, MemoryPort, RagPort, VoicePort};
use crate::skills::SkillRegistry;

/// Everything the pipeline stages reach out to. Built once by the
/// composition root and shared across turns.
pub struct TurnDeps {
    pub settings: Arc<SettingsStore>,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<SessionStore>,
    pub llm: Arc<dyn LlmPort>,
    pub mcp: Arc<McpPool>,
    pub usage: Arc<UsageTracker>,
    pub skills: Arc<SkillRegistry>,
    pub memory: Arc<dyn MemoryPort>,
    pub rag: Option<Arc<dyn RagPort>>,
    pub voice: Option<Arc<dyn VoicePort>>,
    pub confirmations: Option<Arc<dyn ConfirmationPort>>,
    pub channels: Arc<ChannelManager>,
}

pub struct TurnCoordinator {
    deps: Arc<TurnDeps>,
    pipeline: Arc<Pipeline>,
    mailboxes: DashMap<ConversationKey, mpsc::Sender<InboundMessage>>,
    active: Arc<DashMap<ConversationKey, CancellationToken>>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TurnCoordinator {
    pub fn new(deps: Arc<TurnDeps>, pipeline: Pipeline) -> Arc<Self> {
        let worker_count = deps.settings.snapshot().workers.count.max(1);
        Arc::new(Self {
            deps,
            pipeline: Arc::new(pipeline),
            mailboxes: DashMap::new(),
            active: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(worker_count)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Signal the active turn of a conversation to stop. The pipeline
    /// observes the token at its next suspension point.
    pub fn cancel(&self, key: &ConversationKey) -> bool {
        match self.active.get(key) {
            Some(token) => {
                info!(conversation = %key, "cancelling active turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop accepting work and cancel all in-flight turns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    fn spawn_mailbox(self: &Arc<Self>, key: ConversationKey) -> mpsc::Sender<InboundMessage> {
        let capacity = self.deps.settings.snapshot().workers.mailbox_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(capacity);

        let coordinator = Arc::clone(self);
        let mailbox_key = key.clone();
        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    permit = coordinator.workers.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let cancel = CancellationToken::new();
                coordinator
                    .active
                    .insert(mailbox_key.clone(), cancel.clone());
                coordinator.run_turn(inbound, cancel).await;
                coordinator.active.remove(&mailbox_key);
                drop(permit);
            }
            debug!(conversation = %mailbox_key, "mailbox consumer finished");
        });

        tx
    }

    /// Execute one full turn. Never panics the mailbox: every failure path
    /// degrades to a recorded error message.
    async fn run_turn(&self, inbound: InboundMessage, cancel: CancellationToken) {
        let key = inbound.conversation_key();
        let settings = self.deps.settings.snapshot();
        let started = Instant::now();

        let conversation = match self.deps.sessions.load_or_create(&key).await {
            Ok(c) => c,
            Err(e) => {
                error!(conversation = %key, error = %e, "failed to load conversation");
                self.deliver_notice(&key, &settings.notices.turn_error).await;
                return;
            }
        };

        let deadline = started + Duration::from_secs(settings.agent.turn_deadline_secs);
        let mut ctx = TurnContext::new(conversation, inbound, cancel, deadline);

        let result = self.pipeline.run(&mut ctx, &self.deps).await;

        match &result {
            Ok(()) => {
                info!(
                    conversation = %key,
                    llm_calls = ctx.llm_calls,
                    tool_executions = ctx.tool_executions,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn complete"
                );
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                info!(conversation = %key, "turn cancelled");
                let mut msg = ConversationMessage::new(
                    Role::Assistant,
                    "Operation cancelled.",
                    self.deps.clock.now(),
                );
                msg.tier = ctx.model.as_ref().map(|m| m.tier.clone());
                ctx.new_messages.push(msg);
                ctx.set_attr(Attr::StopReason, serde_json::json!("cancelled"));
            }
            Err(e) => {
                warn!(conversation = %key, error = %e, kind = e.kind().code(), "turn failed");
                // Best-effort: record the failure in the session and tell
                // the user; the conversation stays usable.
                ctx.new_messages.push(ConversationMessage::new(
                    Role::Assistant,
                    format!("⚠️ {}", settings.notices.turn_error),
                    self.deps.clock.now(),
                ));
                self.deliver_notice(&key, &settings.notices.turn_error).await;
            }
        }

        if let Err(e) = self
            .deps
            .sessions
            .append_messages(&key, &ctx.new_messages)
            .await
        {
            // Persistence failure must not take the process down; the turn
            // already ran and (possibly) delivered.
            error!(conversation = %key, error = %e, "failed to persist turn messages");
        }
    }

    async fn deliver_notice(&self, key: &ConversationKey, notice: &str) {
        let Some(channel) = self.deps.channels.get(&key.channel) else {
            return;
        };
        let outbound = OutboundMessage {
            channel: key.channel.clone(),
            chat_id: key.chat_id.clone(),
            content: notice.to_string(),
            format: MessageFormat::PlainText,
            voice: false,
        };
        if let Err(e) = channel.send_message(&key.chat_id, &outbound).await {
            warn!(conversation = %key, error = %e, "failed to deliver failure notice");
        }
    }
}

impl TurnCoordinator {
    /// Channels publish into the coordinator through this entry point and
    /// return immediately; they never block on turn completion.
    pub fn enqueue(self: &Arc<Self>, message: InboundMessage) -> EnqueueOutcome {
        if self.shutdown.is_cancelled() {
            return EnqueueOutcome::Busy;
        }

        let key = message.conversation_key();
        // Two attempts: a dead consumer (closed channel) is replaced once.
        for _ in 0..2 {
            let sender = self
                .mailboxes
                .entry(key.clone())
                .or_insert_with(|| self.spawn_mailbox(key.clone()))
                .clone();

            match sender.try_send(message.clone()) {
                Ok(()) => return EnqueueOutcome::Accepted,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(conversation = %key, "mailbox full, reporting busy");
                    return EnqueueOutcome::Busy;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.mailboxes.remove(&key);
                }
            }
        }
        EnqueueOutcome::Busy
    }
}

/// Thin local wrapper so `InboundHandler` (defined in `minder-channels`) can
/// be implemented for a coordinator handle without running afoul of the
/// orphan rules (`Arc` is foreign and not a fundamental type).
pub struct CoordinatorHandle(pub Arc<TurnCoordinator>);

impl InboundHandler for CoordinatorHandle {
    fn enqueue(&self, message: InboundMessage) -> EnqueueOutcome {
        self.0.enqueue(message)
    }
}
