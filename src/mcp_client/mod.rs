//! MCP Client: JSON-RPC over stdio for external tool providers.
//!
//! This module handles:
//! - Spawning tool provider child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - The initialize / tools/list handshake
//! - Tool call execution with per-call timeouts
//! - Graceful shutdown
//!
//! The agent-side [`ToolRegistry`](crate::agent_core::ToolRegistry) owns the
//! sessions and exposes their tools under namespaced names.

pub mod errors;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use session::{connect_all_sessions, ExternalToolSession, SessionState};
pub use types::{McpToolDefinition, ServerConfig};
