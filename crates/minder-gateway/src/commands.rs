//! Built-in `/commands` served before the pipeline: status, clear, skills.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use minder_agent::ports::{CommandOutput, CommandPort};
use minder_agent::skills::SkillRegistry;
use minder_core::{ConversationKey, MinderError, SettingsStore};
use minder_sessions::SessionStore;
use minder_usage::UsageTracker;

const COMMANDS: &[&str] = &["help", "status", "clear", "skills"];

pub struct BasicCommands {
    sessions: Arc<SessionStore>,
    usage: Arc<UsageTracker>,
    skills: Arc<SkillRegistry>,
    settings: Arc<SettingsStore>,
}

impl BasicCommands {
    pub fn new(
        sessions: Arc<SessionStore>,
        usage: Arc<UsageTracker>,
        skills: Arc<SkillRegistry>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            sessions,
            usage,
            skills,
            settings,
        }
    }
}

#[async_trait]
impl CommandPort for BasicCommands {
    fn has_command(&self, name: &str, _channel: &str) -> bool {
        COMMANDS.contains(&name)
    }

    async fn execute(
        &self,
        name: &str,
        _args: &str,
        key: &ConversationKey,
    ) -> Result<CommandOutput, MinderError> {
        let output = match name {
            "help" => COMMANDS
                .iter()
                .map(|c| format!("/{c}"))
                .collect::<Vec<_>>()
                .join("\n"),

            "status" => {
                let settings = self.settings.snapshot();
                let stats = self.usage.stats_all(Duration::days(1));
                [
                    format!("default tier: {}", settings.agent.default_tier),
                    format!("requests (24h): {}", stats.requests),
                    format!("tokens (24h): {}", stats.total_tokens),
                    format!(
                        "primary model: {}",
                        stats.primary_model.as_deref().unwrap_or("-")
                    ),
                ]
                .join("\n")
            }

            "clear" => {
                let removed = self
                    .sessions
                    .clear(key)
                    .await
                    .map_err(|e| MinderError::Internal(e.to_string()))?;
                format!("Conversation cleared ({removed} messages removed).")
            }

            "skills" => {
                let skills = self.skills.list();
                if skills.is_empty() {
                    "No skills installed.".to_string()
                } else {
                    skills
                        .iter()
                        .map(|s| format!("{} — {}", s.name, s.description))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }

            other => format!("unknown command: /{other}"),
        };

        Ok(CommandOutput { output })
    }
}
