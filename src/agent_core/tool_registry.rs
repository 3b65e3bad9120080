//! ToolRegistry: one flat catalog over in-process and provider-hosted tools.
//!
//! Local tools are stored under the name they were registered with. Tools
//! discovered on an external provider are exposed as `server__tool`, so two
//! providers that both offer `search` never collide.
//!
//! Provider sessions are connected, called and disconnected on the
//! registry's own [`IoRuntime`] thread, so external tools answer the same way
//! from async code and from [`ToolRegistry::execute_blocking`], whatever
//! runtime the caller happens to block.
//!
//! [`ToolRegistry::execute`] never fails: unknown names, handler errors,
//! handler panics and provider errors all come back as a `[tool error] ...`
//! string for the model to react to.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::bridge::{self, BridgeError, IoRuntime};
use crate::inference::types::ToolDefinition;
use crate::mcp_client::session::connect_all_sessions;
use crate::mcp_client::{ExternalToolSession, ServerConfig};

use super::errors::ToolError;

/// Thread that owns provider child processes.
const PROVIDER_THREAD_NAME: &str = "cowork-providers";

/// Joins a provider name and its tool name in the catalog.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// `server__tool`.
pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{tool}")
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOrigin {
    Local,
    External { server: String },
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Unique across the catalog (namespaced for external tools).
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameter_schema: Value,
    pub origin: ToolOrigin,
}

impl ToolDescriptor {
    pub fn local(name: &str, description: &str, parameter_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameter_schema,
            origin: ToolOrigin::Local,
        }
    }

    /// Wire form: `{type: "function", function: {name, description, parameters}}`.
    ///
    /// `parameters` always carries at least `type: "object"` and `properties`.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            &self.name,
            &self.description,
            normalize_schema(&self.parameter_schema),
        )
    }
}

fn normalize_schema(schema: &Value) -> Value {
    let mut object = match schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    object
        .entry("type")
        .or_insert_with(|| Value::String("object".into()));
    object
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    Value::Object(object)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// An in-process tool implementation.
///
/// Handlers are treated as stateless with respect to the registry and may be
/// called concurrently from several runs.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String>;
}

/// Adapts a synchronous closure.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> anyhow::Result<String> + Send + Sync,
{
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        (self.0)(arguments)
    }
}

/// Adapts a closure returning a future.
pub struct AsyncFnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for AsyncFnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        (self.0)(arguments).await
    }
}

struct LocalTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

struct ExternalTool {
    descriptor: ToolDescriptor,
    server: String,
    original_name: String,
}

/// Outcome of [`ToolRegistry::connect_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectReport {
    /// Providers that completed the handshake.
    pub connected: Vec<String>,
    /// `(server, error message)` for providers that did not.
    pub failed: Vec<(String, String)>,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ToolRegistry {
    local: HashMap<String, LocalTool>,
    external_configs: BTreeMap<String, ServerConfig>,
    sessions: HashMap<String, Arc<ExternalToolSession>>,
    external: HashMap<String, ExternalTool>,
    /// Started by the first `connect_all` with pending providers.
    io: Option<IoRuntime>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process tool. Re-registering a name replaces it.
    pub fn register_local(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        let name = descriptor.name.clone();
        let replaced = self
            .local
            .insert(name.clone(), LocalTool { descriptor, handler })
            .is_some();
        tracing::debug!(tool = %name, replaced, "local tool registered");
    }

    pub fn register_local_fn<F>(&mut self, descriptor: ToolDescriptor, f: F)
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.register_local(descriptor, Arc::new(FnHandler(f)));
    }

    pub fn register_local_async<F, Fut>(&mut self, descriptor: ToolDescriptor, f: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.register_local(descriptor, Arc::new(AsyncFnHandler(f)));
    }

    /// Remember a provider configuration. Nothing is spawned until
    /// [`connect_all`](Self::connect_all).
    pub fn register_external(&mut self, config: ServerConfig) {
        if config.name.is_empty() {
            tracing::warn!(command = %config.command, "external server without a name skipped");
            return;
        }
        tracing::debug!(server = %config.name, command = %config.command, "external server registered");
        self.external_configs.insert(config.name.clone(), config);
    }

    /// Connect every registered provider that is not connected yet.
    ///
    /// Providers connect concurrently; one failing (bad command, handshake
    /// timeout, protocol error) leaves the others untouched and simply
    /// contributes no tools.
    pub async fn connect_all(&mut self) -> ConnectReport {
        let pending: Vec<ServerConfig> = self
            .external_configs
            .values()
            .filter(|c| !self.sessions.contains_key(&c.name))
            .cloned()
            .collect();
        if pending.is_empty() {
            return ConnectReport::default();
        }

        let started = Instant::now();
        let mut report = ConnectReport::default();
        let names: Vec<String> = pending.iter().map(|c| c.name.clone()).collect();
        let outcome = match self.io_runtime() {
            Ok(io) => io.run(connect_all_sessions(pending)).await,
            Err(e) => Err(e),
        };
        let (sessions, errors) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "provider runtime unavailable");
                report.failed = names.into_iter().map(|n| (n, e.to_string())).collect();
                return report;
            }
        };

        for session in sessions {
            let server = session.name().to_string();
            for tool in session.tools() {
                let name = namespaced_name(&server, &tool.name);
                let descriptor = ToolDescriptor {
                    name: name.clone(),
                    description: tool.description.clone(),
                    parameter_schema: tool.input_schema.clone(),
                    origin: ToolOrigin::External {
                        server: server.clone(),
                    },
                };
                self.external.insert(
                    name,
                    ExternalTool {
                        descriptor,
                        server: server.clone(),
                        original_name: tool.name.clone(),
                    },
                );
            }
            tracing::info!(server = %server, tool_count = session.tools().len(), "external server connected");
            self.sessions.insert(server.clone(), Arc::new(session));
            report.connected.push(server);
        }

        for (server, error) in errors {
            tracing::warn!(server = %server, error = %error, "external server failed to connect");
            report.failed.push((server, error.to_string()));
        }

        tracing::info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "external servers initialized"
        );
        report
    }

    fn io_runtime(&mut self) -> Result<&IoRuntime, BridgeError> {
        let io = match self.io.take() {
            Some(io) => io,
            None => IoRuntime::new(PROVIDER_THREAD_NAME)?,
        };
        Ok(self.io.insert(io))
    }

    /// Every tool in wire format, sorted by name.
    ///
    /// A local tool shadows an external tool of the same name.
    pub fn catalog(&self) -> Vec<ToolDefinition> {
        self.descriptors()
            .into_iter()
            .map(ToolDescriptor::to_definition)
            .collect()
    }

    /// Every tool descriptor, sorted by name.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.local.values().map(|t| &t.descriptor).collect();
        all.extend(
            self.external
                .values()
                .filter(|t| !self.local.contains_key(&t.descriptor.name))
                .map(|t| &t.descriptor),
        );
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.descriptors().into_iter().map(|d| d.name.clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.local.contains_key(name) || self.external.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tool_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.external.is_empty()
    }

    /// Names of connected providers, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    // ─── Execution ───────────────────────────────────────────────────────

    /// Run a tool and return its result text; failures become
    /// `[tool error] ...` strings.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>) -> String {
        let started = Instant::now();
        match self.dispatch(name, arguments).await {
            Ok(result) => {
                tracing::info!(
                    tool = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    result_len = result.len(),
                    "tool executed"
                );
                result
            }
            Err(e) => {
                tracing::warn!(
                    tool = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "tool execution failed"
                );
                e.to_tool_result()
            }
        }
    }

    async fn dispatch(&self, name: &str, arguments: Map<String, Value>) -> Result<String, ToolError> {
        if let Some(tool) = self.local.get(name) {
            let handler = Arc::clone(&tool.handler);
            return match AssertUnwindSafe(handler.call(arguments)).catch_unwind().await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(ToolError::Handler {
                    name: name.to_string(),
                    reason: format!("{e:#}"),
                }),
                Err(panic) => Err(ToolError::Panicked {
                    name: name.to_string(),
                    reason: panic_message(panic.as_ref()),
                }),
            };
        }

        if let Some(tool) = self.external.get(name) {
            let (Some(session), Some(io)) = (self.sessions.get(&tool.server), self.io.as_ref()) else {
                return Err(ToolError::UnknownTool {
                    name: name.to_string(),
                });
            };
            tracing::debug!(tool = %name, server = %tool.server, original = %tool.original_name, "dispatching to external server");
            let session = Arc::clone(session);
            let original = tool.original_name.clone();
            let call = async move { session.call(&original, Value::Object(arguments)).await };
            return match io.run(call).await {
                Ok(result) => Ok(result?),
                Err(e) => Err(ToolError::Panicked {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            };
        }

        Err(ToolError::UnknownTool {
            name: name.to_string(),
        })
    }

    /// [`execute`](Self::execute) from synchronous code, inside or outside a
    /// runtime. Returns the same result text as `execute`.
    pub fn execute_blocking(
        self: &Arc<Self>,
        name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let registry = Arc::clone(self);
        let name = name.to_string();
        bridge::run_blocking_with_timeout(
            async move { registry.execute(&name, arguments).await },
            timeout,
        )
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Stop every provider and drop its tools. Errors are logged, not raised.
    pub async fn disconnect_all(&mut self) {
        let sessions: Vec<Arc<ExternalToolSession>> =
            self.sessions.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        let count = sessions.len();
        match self.io.as_ref() {
            Some(io) => {
                let stops = sessions.into_iter().map(|session| async move {
                    let server = session.name().to_string();
                    if let Err(e) = io.run(async move { session.disconnect().await }).await {
                        tracing::warn!(server = %server, error = %e, "disconnect did not complete");
                    }
                });
                futures::future::join_all(stops).await;
            }
            None => {
                futures::future::join_all(sessions.iter().map(|s| s.disconnect())).await;
            }
        }
        self.external.clear();
        tracing::info!(count, "external servers disconnected");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
