//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while talking to an external tool provider.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed or timed out.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A call was made on a session that is not in the `Connected` state.
    #[error("server '{name}' is not connected (state: {state})")]
    NotConnected {
        name: String,
        state: String,
    },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// The tool ran but reported failure (`isError: true`).
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
    },

    /// The session does not expose a tool by this name.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },
}

impl McpError {
    /// Whether this error happened while bringing the session up.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. } | McpError::InitFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_classification() {
        let spawn = McpError::SpawnFailed {
            name: "a".into(),
            reason: "not found".into(),
        };
        let not_connected = McpError::NotConnected {
            name: "a".into(),
            state: "disconnected".into(),
        };
        assert!(spawn.is_connect_error());
        assert!(!not_connected.is_connect_error());
    }

    #[test]
    fn test_display_includes_context() {
        let err = McpError::Timeout {
            tool: "search".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.to_string(), "tool call 'search' timed out after 30000ms");
    }
}
