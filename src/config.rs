use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bridge configuration, loaded once from a JSON file and immutable after.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub orchestrator_url: String,

    /// Bearer token attached to the WebSocket handshake when non-empty.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Working directory for the agent process and its sessions.
    #[serde(default)]
    pub cwd: String,

    #[serde(default)]
    pub heartbeat_seconds: u64,

    /// Answer tasks with canned updates instead of driving a real agent.
    #[serde(default)]
    pub mock_mode: bool,

    /// Command vector used to launch the ACP agent subprocess.
    #[serde(default)]
    pub agent_command: Vec<String>,

    pub agent: AgentConfig,
}

/// Identity the bridge registers with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub max_concurrent: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        cfg.apply_defaults()?;
        Ok(cfg)
    }

    /// Validate required fields and fill in defaults.
    pub fn apply_defaults(&mut self) -> Result<()> {
        if self.orchestrator_url.is_empty() {
            bail!("orchestrator_url is required");
        }
        if self.agent.id.is_empty() {
            bail!("agent.id is required");
        }
        if self.cwd.is_empty() {
            let cwd = std::env::current_dir()
                .context("cwd is required and the process working directory is unavailable")?;
            self.cwd = cwd.to_string_lossy().into_owned();
        }
        if self.agent.name.is_empty() {
            self.agent.name = self.agent.id.clone();
        }
        if self.agent.max_concurrent == 0 {
            self.agent.max_concurrent = 1;
        }
        if self.heartbeat_seconds == 0 {
            self.heartbeat_seconds = 30;
        }
        if self.agent_command.is_empty() {
            self.agent_command = vec![
                "npx".to_string(),
                "--yes".to_string(),
                "@zed-industries/codex-acp".to_string(),
            ];
        }
        Ok(())
    }
}
