//! Runtime settings surface (minder.toml + MINDER_* env overrides).
//!
//! Every tunable the pipeline, channels, MCP pool, and usage tracker read
//! lives here. Readers take cheap `Arc` snapshots; mutations go through the
//! serialized `SettingsStore::update` path, which persists the TOML file and
//! publishes the new snapshot on a watch channel so long-lived tasks can
//! react to hot reloads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{MinderError, Result};

/// A write-only secret. Deserializes from either a bare string or the
/// dashboard write shape `{"value": "...", "encrypted": false}`; `Debug`
/// and [`Settings::redacted`] never reveal the plaintext.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for handing to transports. Never log this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read-back shape: presence only.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({ "present": !self.0.is_empty() })
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_empty() {
            "SecretString(<empty>)"
        } else {
            "SecretString(<redacted>)"
        })
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Plain(String),
            Write { value: String },
        }
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Plain(v) => SecretString(v),
            Wire::Write { value } => SecretString(value),
        })
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub channels: ChannelSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub usage: UsageSettings,
    #[serde(default)]
    pub voice: VoiceSettings,
    #[serde(default)]
    pub rag: RagSettings,
    #[serde(default)]
    pub skills: SkillSettings,
    #[serde(default)]
    pub notices: NoticeSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the data directory tree (conversations/, usage/, skills/).
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Maximum turns executing in parallel across all conversations.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Bounded capacity of each per-conversation mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

/// A symbolic model tier resolved to a concrete model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    pub model: String,
    /// Reasoning level passed to the provider ("none", "low", "medium", "high").
    #[serde(default = "default_reasoning")]
    pub reasoning_level: String,
    /// Context window in tokens, used by the compaction estimate.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    /// Tier name → concrete model mapping. The five well-known tiers are
    /// seeded by default and may be overridden or extended in minder.toml.
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierSettings>,
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls: u32,
    #[serde(default = "default_max_tool_executions")]
    pub max_tool_executions: u32,
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default)]
    pub stop_on_tool_failure: bool,
    #[serde(default = "bool_true")]
    pub stop_on_confirmation_denied: bool,
    #[serde(default)]
    pub stop_on_tool_policy_denied: bool,
    #[serde(default)]
    pub confirmation: ConfirmationSettings,
    #[serde(default)]
    pub escalation: EscalationSettings,
    /// Base persona text placed at the top of every system prompt.
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Number of recent messages loaded into each turn's history window.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            default_tier: default_tier_name(),
            tiers: default_tiers(),
            max_llm_calls: default_max_llm_calls(),
            max_tool_executions: default_max_tool_executions(),
            turn_deadline_secs: default_turn_deadline_secs(),
            llm_timeout_secs: default_llm_timeout_secs(),
            max_tool_result_chars: default_max_tool_result_chars(),
            stop_on_tool_failure: false,
            stop_on_confirmation_denied: true,
            stop_on_tool_policy_denied: false,
            confirmation: ConfirmationSettings::default(),
            escalation: EscalationSettings::default(),
            persona: default_persona(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationSettings {
    /// When false, sensitive tools execute without asking.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds to wait for a decision before treating it as declined.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

/// Mid-turn tier escalation (upgrade only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Tier to escalate to when a trigger matches.
    #[serde(default = "default_escalation_tier")]
    pub tier: String,
    /// Message length (chars) beyond which the turn escalates.
    #[serde(default = "default_escalation_min_chars")]
    pub min_chars: usize,
    /// Case-insensitive trigger phrases.
    #[serde(default = "default_escalation_triggers")]
    pub triggers: Vec<String>,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tier: default_escalation_tier(),
            min_chars: default_escalation_min_chars(),
            triggers: default_escalation_triggers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Fraction of the tier's context window at which compaction triggers.
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f32,
    /// Messages kept verbatim at the tail of the history.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            trigger_ratio: default_trigger_ratio(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelSettings {
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub webhooks: Vec<WebhookSourceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: SecretString,
    /// Usernames or numeric IDs permitted to talk to the bot. Empty means
    /// nobody is admitted yet and the invite flow is active.
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// Per-chunk character budget for outbound splitting.
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    /// Hard transport limit (Telegram: 4096).
    #[serde(default = "default_transport_max")]
    pub transport_max: usize,
    /// Long-poll timeout passed to getUpdates.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

/// One inbound webhook source: POST /webhooks/{name}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceSettings {
    pub name: String,
    /// HMAC-SHA256 signing secret. When absent the source is rejected.
    pub secret: Option<SecretString>,
    /// Message template with `{field.path}` placeholders resolved against
    /// the JSON payload.
    #[serde(default = "default_webhook_template")]
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// When true, detected prompt injection rejects the turn instead of
    /// annotating it.
    #[serde(default)]
    pub reject_on_injection: bool,
    /// Invite codes redeemable while a channel's allow-list is empty.
    #[serde(default)]
    pub invite_codes: Vec<SecretString>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            reject_on_injection: false,
            invite_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_mcp_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_mcp_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_mcp_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_timeout_secs: default_mcp_startup_timeout_secs(),
            idle_timeout_secs: default_mcp_idle_timeout_secs(),
            request_timeout_secs: default_mcp_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Directory under the storage root for the append-only logs.
    #[serde(default = "default_usage_dir")]
    pub dir: String,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            dir: default_usage_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Assistant messages starting with this prefix are synthesized.
    #[serde(default = "default_voice_prefix")]
    pub prefix: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_voice_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagSettings {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSettings {
    /// Directory under the storage root holding skill markdown files.
    #[serde(default = "default_skills_dir")]
    pub dir: String,
    /// Skill activated for conversations that have none recorded.
    pub default_skill: Option<String>,
}

impl Default for SkillSettings {
    fn default() -> Self {
        Self {
            dir: default_skills_dir(),
            default_skill: None,
        }
    }
}

/// User-facing notice templates. `{seconds}` style placeholders are
/// substituted at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeSettings {
    #[serde(default = "default_unauthorized_notice")]
    pub unauthorized: String,
    #[serde(default = "default_busy_notice")]
    pub busy: String,
    #[serde(default = "default_fallback_ack")]
    pub fallback_ack: String,
    #[serde(default = "default_cooldown_notice")]
    pub invite_cooldown: String,
    #[serde(default = "default_invite_success")]
    pub invite_success: String,
    #[serde(default = "default_invite_failure")]
    pub invite_failure: String,
    #[serde(default = "default_turn_error")]
    pub turn_error: String,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self {
            unauthorized: default_unauthorized_notice(),
            busy: default_busy_notice(),
            fallback_ack: default_fallback_ack(),
            invite_cooldown: default_cooldown_notice(),
            invite_success: default_invite_success(),
            invite_failure: default_invite_failure(),
            turn_error: default_turn_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    pub anthropic: Option<ApiProviderSettings>,
    pub openai: Option<ApiProviderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProviderSettings {
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

impl Settings {
    /// Load from a TOML file with MINDER_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MINDER_").split("_"))
            .extract()
            .map_err(|e| MinderError::Config(e.to_string()))
    }

    /// Resolve a tier name to its concrete model settings.
    pub fn tier(&self, name: &str) -> Option<&TierSettings> {
        self.agent.tiers.get(name)
    }

    /// Dashboard read-back view: secrets replaced with `{present: bool}`.
    pub fn redacted(&self) -> serde_json::Value {
        let mut doc = serde_json::to_value(self).unwrap_or_default();
        if let Some(tg) = doc.pointer_mut("/channels/telegram/bot_token") {
            *tg = serde_json::json!({ "present": true });
        }
        if let Some(codes) = doc.pointer_mut("/security/invite_codes") {
            let count = codes.as_array().map(|a| a.len()).unwrap_or(0);
            *codes = serde_json::json!({ "present": count > 0, "count": count });
        }
        for provider in ["anthropic", "openai"] {
            let path = format!("/providers/{provider}/api_key");
            if let Some(key) = doc.pointer_mut(&path) {
                *key = serde_json::json!({ "present": true });
            }
        }
        for hook in doc
            .pointer_mut("/channels/webhooks")
            .and_then(|v| v.as_array_mut())
            .map(|a| a.iter_mut())
            .into_iter()
            .flatten()
        {
            if let Some(secret) = hook.get_mut("secret") {
                let present = !secret.is_null();
                *secret = serde_json::json!({ "present": present });
            }
        }
        doc
    }
}

/// Process-wide settings holder: snapshot reads, serialized mutation,
/// persist-on-write, and a watch feed for hot-reload subscribers.
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    tx: watch::Sender<Arc<Settings>>,
    persist_path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(settings: Settings, persist_path: Option<PathBuf>) -> Self {
        let snapshot = Arc::new(settings);
        let (tx, _) = watch::channel(snapshot.clone());
        Self {
            current: RwLock::new(snapshot),
            tx,
            persist_path,
        }
    }

    /// Load from disk and wrap; the loaded path becomes the persist target.
    pub fn open(config_path: Option<&str>) -> Result<Self> {
        let settings = Settings::load(config_path)?;
        let path = config_path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(default_config_path()));
        Ok(Self::new(settings, Some(path)))
    }

    /// Current snapshot. Cheap: clones an `Arc` under a read lock.
    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.read().unwrap().clone()
    }

    /// Subscribe to settings-changed events. The receiver yields the full
    /// new snapshot on every successful `update`.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Apply a mutation, persist it, and publish the change event.
    ///
    /// Mutations are serialized by the write lock; readers continue to see
    /// the previous snapshot until the swap.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = self.current.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);

        if let Some(path) = &self.persist_path {
            persist_toml(path, &next)?;
        }

        let snapshot = Arc::new(next);
        *guard = snapshot.clone();
        drop(guard);
        let _ = self.tx.send(snapshot);
        Ok(())
    }
}

fn persist_toml(path: &Path, settings: &Settings) -> Result<()> {
    let doc =
        toml::to_string_pretty(settings).map_err(|e| MinderError::Config(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write-then-rename so a crash mid-write can't truncate the config.
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, doc)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn bool_true() -> bool {
    true
}
fn default_storage_path() -> String {
    if let Ok(p) = std::env::var("STORAGE_PATH") {
        return p;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.minder")
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.minder/minder.toml")
}
fn default_worker_count() -> usize {
    4
}
fn default_mailbox_capacity() -> usize {
    16
}
fn default_tier_name() -> String {
    "balanced".to_string()
}
fn default_reasoning() -> String {
    "none".to_string()
}
fn default_context_window() -> u32 {
    200_000
}
fn default_tiers() -> BTreeMap<String, TierSettings> {
    let mut tiers = BTreeMap::new();
    tiers.insert(
        "routing".to_string(),
        TierSettings {
            model: "claude-haiku-4-5".to_string(),
            reasoning_level: "none".to_string(),
            context_window: 200_000,
        },
    );
    tiers.insert(
        "balanced".to_string(),
        TierSettings {
            model: "claude-sonnet-4-6".to_string(),
            reasoning_level: "none".to_string(),
            context_window: 200_000,
        },
    );
    tiers.insert(
        "smart".to_string(),
        TierSettings {
            model: "claude-opus-4-6".to_string(),
            reasoning_level: "medium".to_string(),
            context_window: 200_000,
        },
    );
    tiers.insert(
        "coding".to_string(),
        TierSettings {
            model: "claude-sonnet-4-6".to_string(),
            reasoning_level: "low".to_string(),
            context_window: 200_000,
        },
    );
    tiers.insert(
        "deep".to_string(),
        TierSettings {
            model: "claude-opus-4-6".to_string(),
            reasoning_level: "high".to_string(),
            context_window: 200_000,
        },
    );
    tiers
}
fn default_max_llm_calls() -> u32 {
    200
}
fn default_max_tool_executions() -> u32 {
    500
}
fn default_turn_deadline_secs() -> u64 {
    3600
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_tool_result_chars() -> usize {
    100_000
}
fn default_confirmation_timeout_secs() -> u64 {
    120
}
fn default_escalation_tier() -> String {
    "smart".to_string()
}
fn default_escalation_min_chars() -> usize {
    1200
}
fn default_escalation_triggers() -> Vec<String> {
    vec![
        "think hard".to_string(),
        "step by step".to_string(),
        "in depth".to_string(),
    ]
}
fn default_persona() -> String {
    "You are Minder, a helpful personal assistant. Be concise and direct.".to_string()
}
fn default_history_window() -> usize {
    40
}
fn default_trigger_ratio() -> f32 {
    0.8
}
fn default_keep_recent() -> usize {
    8
}
fn default_chunk_limit() -> usize {
    3800
}
fn default_transport_max() -> usize {
    4096
}
fn default_poll_timeout_secs() -> u64 {
    25
}
fn default_webhook_template() -> String {
    "Webhook event: {event}".to_string()
}
fn default_mcp_startup_timeout_secs() -> u64 {
    30
}
fn default_mcp_idle_timeout_secs() -> u64 {
    300
}
fn default_mcp_request_timeout_secs() -> u64 {
    60
}
fn default_retention_days() -> i64 {
    30
}
fn default_usage_dir() -> String {
    "usage".to_string()
}
fn default_voice_prefix() -> String {
    "[voice]".to_string()
}
fn default_skills_dir() -> String {
    "skills".to_string()
}
fn default_unauthorized_notice() -> String {
    "Sorry, you are not authorized to use this assistant.".to_string()
}
fn default_busy_notice() -> String {
    "I'm still working on your previous messages — give me a moment.".to_string()
}
fn default_fallback_ack() -> String {
    "Got it.".to_string()
}
fn default_cooldown_notice() -> String {
    "Too many failed attempts. Try again in {seconds}s.".to_string()
}
fn default_invite_success() -> String {
    "Welcome! You now have access to this assistant.".to_string()
}
fn default_invite_failure() -> String {
    "That doesn't look like a valid invite code.".to_string()
}
fn default_turn_error() -> String {
    "Something went wrong while handling that message. Please try again.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let s = Settings::default();
        assert_eq!(s.agent.max_llm_calls, 200);
        assert_eq!(s.agent.max_tool_executions, 500);
        assert_eq!(s.agent.turn_deadline_secs, 3600);
        assert_eq!(s.agent.max_tool_result_chars, 100_000);
        assert!(!s.agent.stop_on_tool_failure);
        assert!(s.agent.stop_on_confirmation_denied);
        assert!(!s.agent.stop_on_tool_policy_denied);
        assert_eq!(s.mcp.startup_timeout_secs, 30);
        assert_eq!(s.mcp.idle_timeout_secs, 300);
        assert_eq!(s.usage.retention_days, 30);
    }

    #[test]
    fn five_tiers_seeded() {
        let s = Settings::default();
        for tier in ["routing", "balanced", "smart", "coding", "deep"] {
            assert!(s.tier(tier).is_some(), "missing tier {tier}");
        }
    }

    #[test]
    fn secret_deserializes_from_plain_and_write_shape() {
        let plain: SecretString = serde_json::from_str(r#""hunter2""#).unwrap();
        assert_eq!(plain.expose(), "hunter2");

        let write: SecretString =
            serde_json::from_str(r#"{"value":"hunter2","encrypted":false}"#).unwrap();
        assert_eq!(write.expose(), "hunter2");
    }

    #[test]
    fn secret_debug_is_redacted() {
        let s = SecretString::new("hunter2");
        assert!(!format!("{s:?}").contains("hunter2"));
    }

    #[test]
    fn redacted_view_hides_bot_token() {
        let mut s = Settings::default();
        s.channels.telegram = Some(TelegramSettings {
            bot_token: SecretString::new("123:abc"),
            allow_list: vec![],
            chunk_limit: 3800,
            transport_max: 4096,
            poll_timeout_secs: 25,
        });
        let doc = s.redacted();
        let token = doc.pointer("/channels/telegram/bot_token").unwrap();
        assert_eq!(token, &serde_json::json!({ "present": true }));
    }

    #[test]
    fn update_publishes_change_event() {
        let store = SettingsStore::new(Settings::default(), None);
        let mut rx = store.subscribe();
        store
            .update(|s| s.agent.max_llm_calls = 7)
            .expect("update failed");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().agent.max_llm_calls, 7);
        assert_eq!(store.snapshot().agent.max_llm_calls, 7);
    }

    #[test]
    fn persist_writes_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minder.toml");
        let store = SettingsStore::new(Settings::default(), Some(path.clone()));
        store.update(|s| s.workers.count = 9).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("count = 9"));
    }
}
