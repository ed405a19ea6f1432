//! The Telegram channel: long-poll inbound loop + outbound sends with
//! chunking, parse-mode fallback, and rate-limit retry.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minder_agent::ports::{CommandPort, VoicePort};
use minder_channels::{
    split_message, Admission, AdmissionService, Channel, ChannelError, ChannelStatus,
    InboundHandler,
};
use minder_channels::EnqueueOutcome;
use minder_core::{InboundMessage, MessageFormat, OutboundMessage, SettingsStore};

use crate::api::{self, ApiError, TelegramApi, Update};

/// Delay between consecutive chunks of one logical message.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);
/// Back-off after a 409 Conflict (another poller owns the token).
const CONFLICT_BACKOFF: Duration = Duration::from_secs(15);
/// Back-off after any other poll error.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

struct PollContext {
    api: Arc<TelegramApi>,
    settings: Arc<SettingsStore>,
    admission: Arc<AdmissionService>,
    commands: Option<Arc<dyn CommandPort>>,
    voice: Option<Arc<dyn VoicePort>>,
    handler: Arc<dyn InboundHandler>,
}

pub struct TelegramChannel {
    settings: Arc<SettingsStore>,
    admission: Arc<AdmissionService>,
    commands: Option<Arc<dyn CommandPort>>,
    voice: Option<Arc<dyn VoicePort>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    /// Set while running: the API client built from the settings snapshot
    /// read at `start`, and the poll task's cancellation token.
    active: Mutex<Option<(Arc<TelegramApi>, CancellationToken)>>,
    status: RwLock<ChannelStatus>,
}

impl TelegramChannel {
    pub fn new(
        settings: Arc<SettingsStore>,
        admission: Arc<AdmissionService>,
        commands: Option<Arc<dyn CommandPort>>,
        voice: Option<Arc<dyn VoicePort>>,
    ) -> Self {
        Self {
            settings,
            admission,
            commands,
            voice,
            handler: RwLock::new(None),
            active: Mutex::new(None),
            status: RwLock::new(ChannelStatus::Stopped),
        }
    }

    fn api(&self) -> Result<Arc<TelegramApi>, ChannelError> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|(api, _)| api.clone())
            .ok_or(ChannelError::NotRunning)
    }

    fn chunk_limit(&self) -> usize {
        self.settings
            .snapshot()
            .channels
            .telegram
            .as_ref()
            .map(|t| t.chunk_limit)
            .unwrap_or(3800)
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.write().unwrap() = status;
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        {
            let active = self.active.lock().unwrap();
            if active.is_some() {
                return Ok(()); // idempotent
            }
        }

        let settings = self.settings.snapshot();
        let Some(tg) = settings.channels.telegram.as_ref() else {
            return Err(ChannelError::Config("telegram is not configured".into()));
        };
        if tg.bot_token.is_empty() {
            return Err(ChannelError::Config("telegram bot_token is empty".into()));
        }
        let handler = self
            .handler
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ChannelError::Config("on_message handler not registered".into()))?;

        let api = Arc::new(TelegramApi::new(tg.bot_token.expose()));
        let cancel = CancellationToken::new();
        let poll_timeout = tg.poll_timeout_secs;

        let ctx = Arc::new(PollContext {
            api: api.clone(),
            settings: self.settings.clone(),
            admission: self.admission.clone(),
            commands: self.commands.clone(),
            voice: self.voice.clone(),
            handler,
        });
        tokio::spawn(run_poll_loop(ctx, poll_timeout, cancel.clone()));

        *self.active.lock().unwrap() = Some((api, cancel));
        self.set_status(ChannelStatus::Running);
        info!("telegram channel started (long polling)");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if let Some((_, cancel)) = self.active.lock().unwrap().take() {
            cancel.cancel();
            info!("telegram channel stopped");
        }
        self.set_status(ChannelStatus::Stopped);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn status(&self) -> ChannelStatus {
        self.status.read().unwrap().clone()
    }

    fn on_message(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    async fn send_message(
        &self,
        chat_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let api = self.api()?;
        let chat = parse_chat_id(chat_id)?;
        let parse_mode = match message.format {
            MessageFormat::Html => Some("HTML"),
            MessageFormat::Markdown => Some("Markdown"),
            MessageFormat::PlainText => None,
        };

        let chunks = split_message(&message.content, self.chunk_limit());
        for (i, chunk) in chunks.iter().enumerate() {
            send_chunk(&api, chat, chunk, parse_mode).await?;
            if i + 1 < chunks.len() {
                tokio::time::sleep(INTER_CHUNK_DELAY).await;
            }
        }
        Ok(())
    }

    async fn send_voice(
        &self,
        chat_id: &str,
        audio: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let api = self.api()?;
        let chat = parse_chat_id(chat_id)?;
        let result =
            api::with_rate_limit_retry(|| api.send_voice(chat, audio, caption)).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_voice_forbidden() => {
                // Peer refuses voice messages: same payload as plain audio.
                debug!(chat_id, "voice message forbidden, sending as audio");
                api::with_rate_limit_retry(|| api.send_audio(chat, audio, caption))
                    .await
                    .map_err(map_api_error)
            }
            Err(e) => Err(map_api_error(e)),
        }
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        image: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let api = self.api()?;
        let chat = parse_chat_id(chat_id)?;
        api::with_rate_limit_retry(|| api.send_photo(chat, image, caption))
            .await
            .map_err(map_api_error)
    }

    async fn send_document(
        &self,
        chat_id: &str,
        data: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let api = self.api()?;
        let chat = parse_chat_id(chat_id)?;
        api::with_rate_limit_retry(|| api.send_document(chat, data, filename, caption))
            .await
            .map_err(map_api_error)
    }

    async fn show_typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        let api = self.api()?;
        let chat = parse_chat_id(chat_id)?;
        api.send_chat_action(chat, "typing")
            .await
            .map_err(map_api_error)
    }

    fn is_authorized(&self, sender_id: &str) -> bool {
        self.admission.is_authorized("telegram", sender_id, "")
    }
}

/// One chunk: formatted send first, plain-text retry once when the parse
/// mode is rejected. Both paths get rate-limit retries.
async fn send_chunk(
    api: &TelegramApi,
    chat: i64,
    chunk: &str,
    parse_mode: Option<&str>,
) -> Result<(), ChannelError> {
    let formatted =
        api::with_rate_limit_retry(|| api.send_message(chat, chunk, parse_mode)).await;
    match formatted {
        Ok(()) => Ok(()),
        Err(e) if parse_mode.is_some() && e.is_parse_error() => {
            debug!(error = %e, "formatted send rejected, retrying as plain text");
            api::with_rate_limit_retry(|| api.send_message(chat, chunk, None))
                .await
                .map_err(map_api_error)
        }
        Err(e) => Err(map_api_error(e)),
    }
}

async fn run_poll_loop(ctx: Arc<PollContext>, poll_timeout: u64, cancel: CancellationToken) {
    info!("telegram poll loop started");
    let mut offset: i64 = 0;

    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            r = ctx.api.get_updates(offset, poll_timeout) => r,
        };

        let updates = match updates {
            Ok(u) => u,
            Err(e) => {
                let text = e.to_string();
                if text.contains("409") || text.contains("Conflict") {
                    // Another instance is polling this token; let it win.
                    warn!("telegram getUpdates conflict, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CONFLICT_BACKOFF) => {}
                    }
                } else {
                    warn!(error = %text, "telegram getUpdates failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            handle_update(&ctx, update).await;
        }
    }
    info!("telegram poll loop finished");
}

/// Decode one update into a normalized inbound event, run admission and
/// command routing, then publish to the coordinator.
async fn handle_update(ctx: &PollContext, update: Update) {
    let Some(message) = update.message else { return };
    let Some(from) = message.from.clone() else { return };
    if from.is_bot {
        return;
    }

    let chat_id = message.chat.id;
    let sender_id = from.id.to_string();
    let username = from.username.clone().unwrap_or_default();

    // Text, or the caption of a media message, or a transcribed voice note.
    let mut text = message
        .text
        .clone()
        .or_else(|| message.caption.clone())
        .unwrap_or_default();

    if text.is_empty() {
        if let (Some(voice_note), Some(voice_port)) = (&message.voice, &ctx.voice) {
            if voice_port.available() {
                match transcribe_voice(ctx, voice_note).await {
                    Ok(transcript) => text = transcript,
                    Err(e) => {
                        warn!(error = %e, "voice transcription failed");
                    }
                }
            }
        }
    }
    if text.trim().is_empty() {
        return;
    }

    let notices = ctx.settings.snapshot().notices.clone();

    // Admission: allow-list, then the invite flow.
    match ctx.admission.admit("telegram", &sender_id, &username, &text) {
        Admission::Authorized => {}
        Admission::Denied { notice } | Admission::InviteReply { notice, .. } => {
            reply_plain(ctx, chat_id, &notice).await;
            return;
        }
    }

    // `/commands` are routed to the command port before the pipeline;
    // unknown commands fall through as normal messages.
    if text.starts_with('/') {
        let normalized = normalize_command(&text);
        let name = normalized
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_start_matches('/');
        let args = normalized
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");

        if let Some(commands) = &ctx.commands {
            if commands.has_command(name, "telegram") {
                let key = minder_core::ConversationKey::new("telegram", chat_id.to_string());
                match commands.execute(name, args, &key).await {
                    Ok(output) => reply_plain(ctx, chat_id, &output.output).await,
                    Err(e) => {
                        warn!(command = name, error = %e, "command failed");
                        reply_plain(ctx, chat_id, &notices.turn_error).await;
                    }
                }
                return;
            }
        }
    }

    let inbound = InboundMessage {
        channel: "telegram".to_string(),
        chat_id: chat_id.to_string(),
        sender_id,
        sender_name: Some(if username.is_empty() {
            from.id.to_string()
        } else {
            username
        }),
        content: text,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    match ctx.handler.enqueue(inbound) {
        EnqueueOutcome::Accepted => {
            let _ = ctx.api.send_chat_action(chat_id, "typing").await;
        }
        EnqueueOutcome::Busy => {
            debug!(chat_id, "coordinator busy, notifying sender");
            reply_plain(ctx, chat_id, &notices.busy).await;
        }
    }
}

async fn transcribe_voice(
    ctx: &PollContext,
    voice_note: &crate::api::Voice,
) -> Result<String, String> {
    let voice_port = ctx.voice.as_ref().ok_or("no voice port")?;
    let audio = ctx
        .api
        .download_file(&voice_note.file_id)
        .await
        .map_err(|e| e.to_string())?;
    let format = voice_note
        .mime_type
        .as_deref()
        .unwrap_or("audio/ogg")
        .to_string();
    voice_port
        .transcribe(&audio, &format)
        .await
        .map_err(|e| e.to_string())
}

async fn reply_plain(ctx: &PollContext, chat_id: i64, text: &str) {
    if let Err(e) =
        api::with_rate_limit_retry(|| ctx.api.send_message(chat_id, text, None)).await
    {
        warn!(chat_id, error = %e, "failed to send notice");
    }
}

/// `/status@my_bot args` → `/status args` (mention stripped, spacing
/// normalized).
fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {rest}")
    }
}

fn parse_chat_id(chat_id: &str) -> Result<i64, ChannelError> {
    chat_id
        .parse()
        .map_err(|_| ChannelError::Transport(format!("invalid telegram chat id: {chat_id}")))
}

fn map_api_error(e: ApiError) -> ChannelError {
    match e {
        ApiError::RateLimited { retry_after_secs } => {
            ChannelError::RateLimited { retry_after_secs }
        }
        other => ChannelError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_bot_mentions() {
        assert_eq!(normalize_command("/status@minder_bot"), "/status");
        assert_eq!(normalize_command("/tier@minder_bot smart"), "/tier smart");
        assert_eq!(normalize_command("  /clear  "), "/clear");
    }

    #[test]
    fn chat_id_parsing() {
        assert!(parse_chat_id("12345").is_ok());
        assert!(parse_chat_id("-10012345").is_ok());
        assert!(parse_chat_id("not-a-number").is_err());
    }

    #[test]
    fn rate_limit_maps_to_channel_error() {
        let mapped = map_api_error(ApiError::RateLimited {
            retry_after_secs: 7,
        });
        assert!(matches!(
            mapped,
            ChannelError::RateLimited {
                retry_after_secs: 7
            }
        ));
    }
}
