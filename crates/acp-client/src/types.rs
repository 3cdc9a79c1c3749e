//! Wire types for the line-delimited JSON-RPC dialect spoken by ACP agents.

use serde::Deserialize;
use serde_json::Value;

/// A single inbound frame. Classification depends on which fields are set:
/// `method` without `id` is a notification, `method` with `id` is a request
/// the client must answer, `id` without `method` is a response to one of our
/// calls, and a frame with neither is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewResult {
    #[serde(default)]
    pub session_id: String,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub tool_calls: Option<Value>,
}

/// Params of an inbound `session/update` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    pub session_id: String,
    #[serde(default)]
    pub update: Value,
}

/// One selectable option in a `session/request_permission` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

/// Params of an inbound `session/request_permission` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}
