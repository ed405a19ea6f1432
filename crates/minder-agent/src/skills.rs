//! Skills: named, markdown-defined behavior profiles.
//!
//! Each skill lives under `skills/<name>/` in storage as a `skill.toml`
//! manifest plus a `SKILL.md` body. A skill may declare variables, an MCP
//! launch spec, tool names that require confirmation, and transition rules
//! applied to the final assistant text after each turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use minder_mcp::McpLaunchSpec;
use minder_storage::{Storage, StorageError};

/// A transition rule: when `pattern` matches the final assistant message,
/// the conversation's active skill becomes `to` for the next turn.
#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub pattern: Regex,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Markdown body injected into the system prompt while active.
    pub body: String,
    pub variables: BTreeMap<String, String>,
    pub mcp: Option<McpLaunchSpec>,
    pub available: bool,
    /// Tool names that require confirmation while this skill is active.
    pub sensitive_tools: Vec<String>,
    pub transitions: Vec<TransitionRule>,
}

impl Skill {
    /// First transition whose pattern matches `text`, if any.
    pub fn next_skill(&self, text: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|rule| rule.pattern.is_match(text))
            .map(|rule| rule.to.as_str())
    }

    pub fn is_sensitive_tool(&self, tool: &str) -> bool {
        self.sensitive_tools.iter().any(|t| t == tool)
    }
}

/// `skill.toml` wire shape.
#[derive(Debug, Deserialize)]
struct SkillManifest {
    description: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    mcp: Option<McpLaunchSpec>,
    #[serde(default = "bool_true")]
    available: bool,
    #[serde(default)]
    sensitive_tools: Vec<String>,
    #[serde(default)]
    transitions: Vec<ManifestTransition>,
}

#[derive(Debug, Deserialize)]
struct ManifestTransition {
    pattern: String,
    to: String,
}

fn bool_true() -> bool {
    true
}

/// Owns skill definitions, loaded once from storage at startup and
/// reloadable on demand.
pub struct SkillRegistry {
    storage: Arc<dyn Storage>,
    dir: String,
    skills: std::sync::RwLock<BTreeMap<String, Arc<Skill>>>,
}

impl SkillRegistry {
    pub fn new(storage: Arc<dyn Storage>, dir: impl Into<String>) -> Self {
        Self {
            storage,
            dir: dir.into(),
            skills: std::sync::RwLock::new(BTreeMap::new()),
        }
    }

    /// Load (or reload) every skill directory. Skills that fail to parse
    /// are skipped with a warning. Returns the number loaded.
    pub async fn load(&self) -> usize {
        let names = match self.storage.list(&self.dir).await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "skills: directory unreadable, no skills loaded");
                return 0;
            }
        };

        let mut loaded = BTreeMap::new();
        for name in names {
            match self.load_one(&name).await {
                Ok(skill) => {
                    loaded.insert(name.clone(), Arc::new(skill));
                }
                Err(e) => {
                    warn!(skill = %name, error = %e, "skills: failed to load, skipping");
                }
            }
        }

        let count = loaded.len();
        *self.skills.write().unwrap() = loaded;
        debug!(count, "skills loaded");
        count
    }

    async fn load_one(&self, name: &str) -> Result<Skill, String> {
        let manifest_path = format!("{}/{}/skill.toml", self.dir, name);
        let body_path = format!("{}/{}/SKILL.md", self.dir, name);

        let manifest: SkillManifest = match self.storage.get_text(&manifest_path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| format!("bad manifest: {e}"))?,
            Err(StorageError::NotFound(_)) => SkillManifest {
                description: None,
                variables: BTreeMap::new(),
                mcp: None,
                available: true,
                sensitive_tools: Vec::new(),
                transitions: Vec::new(),
            },
            Err(e) => return Err(format!("manifest unreadable: {e}")),
        };

        let body = self
            .storage
            .get_text(&body_path)
            .await
            .map_err(|e| format!("body unreadable: {e}"))?;

        let mut transitions = Vec::with_capacity(manifest.transitions.len());
        for t in manifest.transitions {
            let pattern =
                Regex::new(&t.pattern).map_err(|e| format!("bad transition pattern: {e}"))?;
            transitions.push(TransitionRule { pattern, to: t.to });
        }

        Ok(Skill {
            name: name.to_string(),
            description: manifest.description.unwrap_or_default(),
            body,
            variables: manifest.variables,
            mcp: manifest.mcp,
            available: manifest.available,
            sensitive_tools: manifest.sensitive_tools,
            transitions,
        })
    }

    /// Look up an available skill by name.
    pub fn get(&self, name: &str) -> Option<Arc<Skill>> {
        self.skills
            .read()
            .unwrap()
            .get(name)
            .filter(|s| s.available)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Skill>> {
        self.skills.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_storage::FsStorage;

    async fn seeded_registry() -> (tempfile::TempDir, SkillRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));

        storage
            .put_text(
                "skills/calendar/skill.toml",
                r#"
description = "Manage the user's calendar"
sensitive_tools = ["calendar_delete"]

[variables]
TIMEZONE = "Europe/Berlin"

[mcp]
command = "calendar-mcp"
args = ["--stdio"]
startup_timeout = 10

[mcp.env]
TZ = "${TIMEZONE}"

[[transitions]]
pattern = "(?i)scheduling is done"
to = "chitchat"
"#,
            )
            .await
            .unwrap();
        storage
            .put_text("skills/calendar/SKILL.md", "# Calendar\nBe precise with dates.")
            .await
            .unwrap();

        storage
            .put_text("skills/chitchat/SKILL.md", "Keep it light.")
            .await
            .unwrap();

        storage
            .put_text("skills/broken/skill.toml", "not [valid toml")
            .await
            .unwrap();
        storage
            .put_text("skills/broken/SKILL.md", "body")
            .await
            .unwrap();

        let registry = SkillRegistry::new(storage, "skills");
        registry.load().await;
        (dir, registry)
    }

    #[tokio::test]
    async fn loads_manifest_and_body() {
        let (_dir, registry) = seeded_registry().await;
        let skill = registry.get("calendar").expect("calendar missing");
        assert_eq!(skill.description, "Manage the user's calendar");
        assert!(skill.body.contains("Be precise"));
        assert_eq!(
            skill.variables.get("TIMEZONE").map(String::as_str),
            Some("Europe/Berlin")
        );
        let mcp = skill.mcp.as_ref().unwrap();
        assert_eq!(mcp.command, "calendar-mcp");
        assert_eq!(mcp.startup_timeout, Some(10));
    }

    #[tokio::test]
    async fn manifest_is_optional() {
        let (_dir, registry) = seeded_registry().await;
        let skill = registry.get("chitchat").expect("chitchat missing");
        assert!(skill.mcp.is_none());
        assert!(skill.available);
    }

    #[tokio::test]
    async fn broken_skill_is_skipped() {
        let (_dir, registry) = seeded_registry().await;
        assert!(registry.get("broken").is_none());
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn transition_rule_matches_final_text() {
        let (_dir, registry) = seeded_registry().await;
        let skill = registry.get("calendar").unwrap();
        assert_eq!(skill.next_skill("Alright, Scheduling is done!"), Some("chitchat"));
        assert_eq!(skill.next_skill("anything else?"), None);
    }

    #[tokio::test]
    async fn sensitive_tools_are_flagged() {
        let (_dir, registry) = seeded_registry().await;
        let skill = registry.get("calendar").unwrap();
        assert!(skill.is_sensitive_tool("calendar_delete"));
        assert!(!skill.is_sensitive_tool("calendar_list"));
    }
}
