//! External tool sessions: one child process per configured provider.
//!
//! State machine:
//!
//! ```text
//! Unconnected ──connect()──▶ Connecting ──handshake ok──▶ Connected ──disconnect()──▶ Disconnected
//!                                │
//!                                └──spawn/handshake failure──▶ Unconnected
//! ```
//!
//! Calls made outside `Connected` fail fast with [`McpError::NotConnected`].

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    error_codes, CallToolResult, InitializeResult, ListToolsResult, McpToolDefinition,
    ServerConfig, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the stderr reader to drain after a failed start.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Stderr lines kept for error context.
const STDERR_TAIL_LINES: usize = 20;

// ─── SessionState ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

// ─── ExternalToolSession ─────────────────────────────────────────────────────

/// A live (or not yet live) connection to one tool provider process.
pub struct ExternalToolSession {
    config: ServerConfig,
    state: StdMutex<SessionState>,
    child: Mutex<Option<Child>>,
    transport: Option<StdioTransport>,
    tools: Vec<McpToolDefinition>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ExternalToolSession {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(SessionState::Unconnected),
            child: Mutex::new(None),
            transport: None,
            tools: Vec::new(),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
            stderr_task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Tools discovered during the handshake (original, un-namespaced names).
    pub fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&McpToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Most recent stderr lines from the child, oldest first.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Spawn the provider and run the handshake.
    ///
    /// On failure the child is killed and the session returns to
    /// `Unconnected`; the error carries the tail of the child's stderr.
    pub async fn connect(&mut self) -> Result<(), McpError> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);

        match self.try_connect().await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                tracing::info!(
                    server = %self.config.name,
                    tool_count = self.tools.len(),
                    "external tool server connected"
                );
                Ok(())
            }
            Err(e) => {
                self.abort_start().await;
                self.set_state(SessionState::Unconnected);
                Err(self.with_stderr_context(e))
            }
        }
    }

    async fn try_connect(&mut self) -> Result<(), McpError> {
        let name = self.config.name.clone();
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.clone(),
            reason: format!("{} ({e})", self.config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.stderr_task = Some(forward_stderr(
                name.clone(),
                stderr,
                Arc::clone(&self.stderr_tail),
            ));
        }
        *self.child.lock().await = Some(child);

        let transport = StdioTransport::new(&name, stdin, stdout);
        let timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let tools = match tokio::time::timeout(timeout, handshake(&transport, &name)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(McpError::InitFailed {
                    name,
                    reason: format!("handshake timed out after {}s", timeout.as_secs()),
                })
            }
        };

        self.transport = Some(transport);
        self.tools = tools;
        Ok(())
    }

    /// Kill a half-started child and let the stderr reader drain.
    async fn abort_start(&mut self) {
        self.transport = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
    }

    /// Normalize a start failure to the connect-error class and append the
    /// child's stderr tail.
    fn with_stderr_context(&self, err: McpError) -> McpError {
        let (name, reason) = match err {
            McpError::InitFailed { name, reason } => (name, reason),
            McpError::TransportError { server, reason } => (server, reason),
            other => return other,
        };

        let tail = self.stderr_tail();
        if tail.is_empty() {
            return McpError::InitFailed { name, reason };
        }
        tracing::warn!(server = %name, stderr = %tail, "server stderr captured on failure");
        McpError::InitFailed {
            name,
            reason: format!("{reason} | stderr: {}", tail.trim()),
        }
    }

    // ─── Call ────────────────────────────────────────────────────────────

    /// Invoke `tool` (its original, un-namespaced name) with `arguments`.
    ///
    /// Missing required fields are reported without a round trip. A result
    /// flagged `isError` becomes [`McpError::ToolFailed`].
    pub async fn call(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        let state = self.state();
        let transport = match (state, self.transport.as_ref()) {
            (SessionState::Connected, Some(t)) => t,
            _ => {
                return Err(McpError::NotConnected {
                    name: self.config.name.clone(),
                    state: state.to_string(),
                })
            }
        };

        let definition = self.tool(tool).ok_or_else(|| McpError::UnknownTool {
            name: tool.to_string(),
        })?;

        let missing: Vec<&str> = definition
            .required_fields()
            .into_iter()
            .filter(|field| arguments.get(*field).map_or(true, |v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return Err(McpError::ToolFailed {
                tool: tool.to_string(),
                message: format!("missing required argument(s): {}", missing.join(", ")),
            });
        }

        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let timeout = Duration::from_secs(self.config.call_timeout_secs);

        let started = std::time::Instant::now();
        let response = tokio::time::timeout(timeout, transport.request("tools/call", Some(params)))
            .await
            .map_err(|_| McpError::Timeout {
                tool: tool.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })??;
        let value = extract_result(response)?;

        let text = match serde_json::from_value::<CallToolResult>(value.clone()) {
            Ok(result) if result.is_error => {
                return Err(McpError::ToolFailed {
                    tool: tool.to_string(),
                    message: result.text(),
                })
            }
            Ok(result) => result.text(),
            Err(_) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
        };

        tracing::debug!(
            server = %self.config.name,
            tool = %tool,
            elapsed_ms = started.elapsed().as_millis() as u64,
            result_len = text.len(),
            "external tool call completed"
        );
        Ok(text)
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Close stdin, give the child [`SHUTDOWN_TIMEOUT`] to exit, then kill it.
    pub async fn disconnect(&self) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        self.set_state(SessionState::Disconnected);

        if let Some(ref transport) = self.transport {
            transport.close().await;
        }

        let mut guard = self.child.lock().await;
        if let Some(ref mut child) = *guard {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.config.name, %status, "server exited");
                }
                _ => {
                    tracing::warn!(server = %self.config.name, "server did not exit; killing");
                    let _ = child.kill().await;
                }
            }
        }
        *guard = None;
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize` → `notifications/initialized` → `tools/list`.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let init_value = extract_result(transport.request("initialize", Some(params)).await?)
        .map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("initialize rejected: {e}"),
        })?;
    let init: InitializeResult =
        serde_json::from_value(init_value).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(ref info) = init.server_info {
        tracing::debug!(
            server = %server_name,
            remote_name = info.name.as_deref().unwrap_or("?"),
            remote_version = info.version.as_deref().unwrap_or("?"),
            protocol = init.protocol_version.as_deref().unwrap_or("?"),
            "initialize accepted"
        );
    }

    transport.notify("notifications/initialized", None).await?;

    let listed = extract_result(transport.request("tools/list", None).await?);
    match listed {
        Ok(value) => {
            let list: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::InitFailed {
                    name: server_name.to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;
            Ok(list.tools)
        }
        Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
            tracing::debug!(
                server = %server_name,
                tool_count = init.tools.len(),
                "tools/list unsupported; using tools from initialize"
            );
            Ok(init.tools)
        }
        Err(e) => Err(McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("tools/list failed: {e}"),
        }),
    }
}

/// Forward child stderr to `tracing::debug!`, keeping a bounded tail.
fn forward_stderr(
    server: String,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {line}");
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

// ─── Batch Operations ────────────────────────────────────────────────────────

/// Connect every configured provider concurrently.
///
/// Returns the sessions that reached `Connected` and the errors of those that
/// did not. One failure never cancels or delays the others.
pub async fn connect_all_sessions(
    configs: Vec<ServerConfig>,
) -> (Vec<ExternalToolSession>, Vec<(String, McpError)>) {
    let handles: Vec<(String, JoinHandle<_>)> = configs
        .into_iter()
        .map(|config| {
            let name = config.name.clone();
            let handle = tokio::spawn(async move {
                let mut session = ExternalToolSession::new(config);
                session.connect().await.map(|()| session)
            });
            (name, handle)
        })
        .collect();

    let mut sessions = Vec::new();
    let mut errors = Vec::new();
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(session)) => sessions.push(session),
            Ok(Err(e)) => errors.push((name, e)),
            Err(e) => errors.push((
                name.clone(),
                McpError::SpawnFailed {
                    name,
                    reason: format!("connect task failed: {e}"),
                },
            )),
        }
    }
    (sessions, errors)
}

// ─── Test Support ────────────────────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_connect_discovers_tools() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        assert_eq!(session.state(), SessionState::Unconnected);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.tools().len(), 3);
        assert_eq!(session.tool("search").unwrap().required_fields(), vec!["query"]);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        session.connect().await.unwrap();

        let first = session
            .call("search", serde_json::json!({"query": "rust"}))
            .await
            .unwrap();
        let second = session
            .call("search", serde_json::json!({"query": "tokio"}))
            .await
            .unwrap();
        assert_eq!(first, "called 3");
        assert_eq!(second, "called 4");

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_is_error_becomes_tool_failed() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        session.connect().await.unwrap();

        let err = session.call("fail", serde_json::json!({})).await.unwrap_err();
        match err {
            McpError::ToolFailed { tool, message } => {
                assert_eq!(tool, "fail");
                assert_eq!(message, "boom");
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_missing_required_field_skips_round_trip() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        session.connect().await.unwrap();

        let err = session.call("search", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("query"));

        // No id was consumed: the next real call still gets id 3.
        let ok = session
            .call("search", serde_json::json!({"query": "x"}))
            .await
            .unwrap();
        assert_eq!(ok, "called 3");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let mut config = fake_server("web", SEARCH_TOOLS);
        config.call_timeout_secs = 1;
        let mut session = ExternalToolSession::new(config);
        session.connect().await.unwrap();

        let err = session.call("slow", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 1000, .. }));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        session.connect().await.unwrap();
        let err = session.call("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_call_before_connect_fails_fast() {
        let session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        let err = session.call("search", serde_json::json!({"query": "x"})).await.unwrap_err();
        match err {
            McpError::NotConnected { state, .. } => assert_eq!(state, "unconnected"),
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_after_disconnect_fails_fast() {
        let mut session = ExternalToolSession::new(fake_server("web", SEARCH_TOOLS));
        session.connect().await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        let err = session.call("search", serde_json::json!({"query": "x"})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_embedded_tools_fallback() {
        let mut session =
            ExternalToolSession::new(embedded_tools_server("legacy", SEARCH_TOOLS));
        session.connect().await.unwrap();
        assert_eq!(session.tools().len(), 3);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_to_unconnected() {
        let mut session = ExternalToolSession::new(ServerConfig::new(
            "ghost",
            "/nonexistent/definitely-not-a-binary",
            &[],
        ));
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn test_handshake_failure_carries_stderr() {
        let mut session = ExternalToolSession::new(crashing_server("broken"));
        let err = session.connect().await.unwrap_err();
        assert!(err.is_connect_error());
        assert!(err.to_string().contains("missing module foo"), "{err}");
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn test_connect_all_isolates_failures() {
        let (sessions, errors) = connect_all_sessions(vec![
            ServerConfig::new("ghost", "/nonexistent/definitely-not-a-binary", &[]),
            fake_server("web", SEARCH_TOOLS),
        ])
        .await;

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name(), "web");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "ghost");

        for session in &sessions {
            session.disconnect().await;
        }
    }
}
