use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AgentConfig;

/// Messages the bridge sends to the orchestrator, one JSON text frame each.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Sent once per connection, before anything else.
    RegisterAgent { agent: AgentConfig },
    Heartbeat {
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    /// Progress, streamed output, and results for one run. `content.type`
    /// discriminates: `text`, `session_created`, `session_update`,
    /// `prompt_result`.
    AgentUpdate { run_id: String, content: Value },
}

/// `execute_task` control message.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteTaskMessage {
    pub run_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
}

/// `prompt_run` control message. Unlike `execute_task`, a caller-supplied
/// `session_id` is honored and the prompt is retried once on a fresh session
/// after a failure.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRunMessage {
    pub run_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
}
