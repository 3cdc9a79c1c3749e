//! Error types for the ACP client.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while driving an ACP agent subprocess.
#[derive(Error, Debug)]
pub enum AcpError {
    /// The configured agent command has no argv[0] to launch.
    #[error("agent_command is empty")]
    EmptyCommand,

    /// The agent process could not be started.
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The agent's stdin pipe is not available for writing.
    #[error("agent stdin not available")]
    StdinUnavailable,

    /// The agent's stdout pipe could not be captured at spawn time.
    #[error("failed to capture agent stdout")]
    StdoutUnavailable,

    /// The agent's stderr pipe could not be captured at spawn time.
    #[error("failed to capture agent stderr")]
    StderrUnavailable,

    /// Writing a frame to the agent's stdin failed.
    #[error("failed to write to agent stdin: {0}")]
    Write(#[source] std::io::Error),

    /// The agent answered with a JSON-RPC error envelope.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code (`-1` is synthesized when the process exits).
        code: i64,
        /// Human-readable message from the agent.
        message: String,
        /// Optional structured payload from the agent.
        data: Option<Value>,
    },

    /// The agent process went away while a call was outstanding.
    #[error("agent process exited")]
    PeerExited,

    /// No response arrived within the caller's deadline.
    #[error("timed out waiting for agent response")]
    Timeout,

    /// The response was well-formed JSON-RPC but semantically unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ACP client operations.
pub type Result<T> = std::result::Result<T, AcpError>;
