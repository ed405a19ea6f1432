//! The pool: one client slot per skill with an at-most-one-start latch,
//! cached catalogs, and an idle sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{McpClient, McpError, ToolOutput};
use crate::protocol::McpToolDef;

/// Interval between idle sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Grace window before a stopping client's process is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// MCP launch spec carried by a skill definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpLaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment entries; `${VAR}` values resolve from the skill's
    /// variables first, then the process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds; falls back to the pool default when absent.
    pub startup_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
}

/// Pool-wide defaults, snapshotted from settings at construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    pub startup_timeout: Duration,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
        }
    }
}

struct Slot {
    client: Option<Arc<McpClient>>,
    idle_timeout: Duration,
}

pub struct McpPool {
    config: PoolConfig,
    /// skill name → start-latched slot. Locking the slot is the
    /// at-most-one-in-flight-start guarantee.
    slots: DashMap<String, Arc<tokio::sync::Mutex<Slot>>>,
}

impl McpPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
        }
    }

    /// Return the skill's cached tool catalog, starting (and handshaking)
    /// its client on first use. Concurrent callers for the same skill see a
    /// single start. When MCP is disabled, returns an empty catalog.
    pub async fn get_or_start(
        &self,
        skill: &str,
        spec: &McpLaunchSpec,
        variables: &BTreeMap<String, String>,
    ) -> Result<Arc<Vec<McpToolDef>>, McpError> {
        if !self.config.enabled {
            return Ok(Arc::new(Vec::new()));
        }

        let slot = self.slot_for(skill, spec);
        let mut guard = slot.lock().await;

        if let Some(client) = &guard.client {
            if client.is_alive() {
                return Ok(client.tools());
            }
            // The process died underneath us; drop the stale entry and
            // start fresh.
            debug!(skill, "mcp client found dead, restarting");
            guard.client = None;
        }

        let env = resolve_env(&spec.env, variables);
        let client = McpClient::spawn(
            skill,
            &spec.command,
            &spec.args,
            &env,
            self.config.request_timeout,
        )
        .await?;

        let startup = spec
            .startup_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.startup_timeout);

        match client.handshake(startup).await {
            Ok(tools) => {
                info!(skill, tool_count = tools.len(), "mcp client started");
                guard.client = Some(client);
                Ok(tools)
            }
            Err(e) => {
                warn!(skill, error = %e, "mcp handshake failed, destroying client");
                client.close(STOP_GRACE).await;
                Err(e)
            }
        }
    }

    /// Call a tool on the skill's running client.
    pub async fn call_tool(
        &self,
        skill: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolOutput, McpError> {
        let client = {
            let slot = self
                .slots
                .get(skill)
                .ok_or(McpError::Closed)?
                .clone();
            let guard = slot.lock().await;
            guard.client.clone().ok_or(McpError::Closed)?
        };
        client.call_tool(tool, arguments).await
    }

    /// Stop and destroy the skill's client, failing its pending calls.
    pub async fn stop(&self, skill: &str) {
        let Some((_, slot)) = self.slots.remove(skill) else {
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(client) = guard.client.take() {
            info!(skill, "stopping mcp client");
            client.close(STOP_GRACE).await;
        }
    }

    /// Stop every client (shutdown path).
    pub async fn stop_all(&self) {
        let skills: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for skill in skills {
            self.stop(&skill).await;
        }
    }

    /// Destroy clients idle past their per-client timeout. Returns the
    /// skills swept. Called periodically by `run_idle_sweeper`.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let mut swept = Vec::new();
        let candidates: Vec<(String, Arc<tokio::sync::Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (skill, slot) in candidates {
            let expired = {
                let guard = slot.lock().await;
                match &guard.client {
                    Some(client) => !client.is_alive() || client.idle_for() > guard.idle_timeout,
                    None => false,
                }
            };
            if expired {
                debug!(skill = %skill, "mcp idle sweeper destroying client");
                self.stop(&skill).await;
                swept.push(skill);
            }
        }
        swept
    }

    /// Periodic idle sweep task. Runs until cancelled.
    pub async fn run_idle_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_idle().await;
                }
            }
        }
    }

    fn slot_for(&self, skill: &str, spec: &McpLaunchSpec) -> Arc<tokio::sync::Mutex<Slot>> {
        let idle_timeout = spec
            .idle_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.idle_timeout);
        self.slots
            .entry(skill.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Slot {
                    client: None,
                    idle_timeout,
                }))
            })
            .clone()
    }
}

/// Expand `${VAR}` placeholders in spec env values: skill variables first,
/// then the process environment, else left verbatim.
fn resolve_env(
    env: &BTreeMap<String, String>,
    variables: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    env.iter()
        .map(|(key, value)| (key.clone(), resolve_env_value(value, variables)))
        .collect()
}

fn resolve_env_value(value: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if let Some(v) = variables.get(var) {
                    out.push_str(v);
                } else if let Ok(v) = std::env::var(var) {
                    out.push_str(&v);
                } else {
                    out.push_str("${");
                    out.push_str(var);
                    out.push('}');
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_resolves_from_variables_first() {
        let mut vars = BTreeMap::new();
        vars.insert("API_KEY".to_string(), "from-skill".to_string());
        assert_eq!(resolve_env_value("${API_KEY}", &vars), "from-skill");
    }

    #[test]
    fn env_falls_back_to_process_env() {
        std::env::set_var("MINDER_MCP_TEST_VAR", "from-env");
        let vars = BTreeMap::new();
        assert_eq!(
            resolve_env_value("prefix-${MINDER_MCP_TEST_VAR}", &vars),
            "prefix-from-env"
        );
    }

    #[test]
    fn unresolved_placeholder_is_kept_verbatim() {
        let vars = BTreeMap::new();
        assert_eq!(
            resolve_env_value("${NO_SUCH_VAR_EVER_1234}", &vars),
            "${NO_SUCH_VAR_EVER_1234}"
        );
    }

    #[test]
    fn plain_values_pass_through() {
        let vars = BTreeMap::new();
        assert_eq!(resolve_env_value("plain", &vars), "plain");
    }

    #[tokio::test]
    async fn disabled_pool_short_circuits() {
        let pool = McpPool::new(PoolConfig {
            enabled: false,
            ..PoolConfig::default()
        });
        let spec = McpLaunchSpec {
            command: "definitely-not-a-real-binary".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            startup_timeout: None,
            idle_timeout: None,
        };
        let tools = pool
            .get_or_start("skill", &spec, &BTreeMap::new())
            .await
            .unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn call_tool_without_client_fails_fast() {
        let pool = McpPool::new(PoolConfig::default());
        let err = pool
            .call_tool("ghost", "t", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }
}
