//! # ACP Client
//!
//! Client for coding agents that speak the Agent Client Protocol: a
//! line-delimited JSON-RPC 2.0 dialect over the stdin/stdout of a spawned
//! subprocess.
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//!
//! use acp_client::AcpClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AcpClient::new(
//!         vec!["npx".into(), "--yes".into(), "@zed-industries/codex-acp".into()],
//!         PathBuf::from("."),
//!         None,
//!     );
//!
//!     client.initialize(Duration::from_secs(60)).await?;
//!     let session_id = client.new_session(".", Duration::from_secs(60)).await?;
//!     let result = client
//!         .prompt(&session_id, "write a haiku", Duration::from_secs(3600))
//!         .await?;
//!     println!("{}: {}", result.stop_reason, result.output);
//!
//!     Ok(())
//! }
//! ```
//!
//! The client keeps one long-lived subprocess across sessions, answers the
//! agent's `session/request_permission` prompts autonomously, and respawns
//! the process on the next call after it exits.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AcpClient, SessionUpdateHandler};
pub use error::{AcpError, Result};
pub use types::{
    PermissionOption, PromptResult, RequestPermissionParams, RpcEnvelope, RpcErrorBody,
    SessionNewResult, SessionUpdateParams,
};
