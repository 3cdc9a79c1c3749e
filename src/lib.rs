//! Agent Bridge: registers with an orchestrator over WebSocket and executes
//! its tasks against a locally spawned ACP coding agent, streaming the
//! agent's output back upstream.

pub mod bridge;
pub mod coalesce;
pub mod config;
pub mod protocol;
pub mod sessions;

pub use bridge::Bridge;
pub use coalesce::ChunkCoalescer;
pub use config::{AgentConfig, Config};
pub use sessions::SessionRegistry;
