//! Agentic tool-calling runtime.
//!
//! An [`AgentLoop`] sends a bounded [`ConversationContext`] and the tool
//! catalog of a [`ToolRegistry`] to an OpenAI-compatible model endpoint,
//! runs the tools the model asks for (in-process handlers or tools hosted by
//! stdio JSON-RPC provider processes), feeds the results back, and streams
//! the final answer to a callback.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cowork_runtime::agent_core::{AgentLoop, ConversationContext, StreamControl, ToolRegistry};
//! use cowork_runtime::config::RuntimeConfig;
//! use cowork_runtime::inference::InferenceClient;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = RuntimeConfig::default();
//! let endpoint = Arc::new(InferenceClient::from_config(config.model.clone())?);
//!
//! let mut registry = ToolRegistry::new();
//! config.register_servers(&mut registry);
//! registry.connect_all().await;
//!
//! let context = ConversationContext::new(config.context.clone()).with_summarizer(endpoint.clone());
//! let mut agent = AgentLoop::new(context, Arc::new(registry), endpoint, config.agent.clone());
//! let report = agent
//!     .run("What changed in the last release?", |token: &str| {
//!         print!("{token}");
//!         StreamControl::Continue
//!     })
//!     .await;
//! println!("\n{} tool call(s)", report.records.len());
//! # Ok(())
//! # }
//! ```

pub mod agent_core;
pub mod bridge;
pub mod config;
pub mod inference;
pub mod logging;
pub mod mcp_client;

pub use agent_core::{
    AgentLoop, AgentSettings, ContextSettings, ConversationContext, RunOutcome, RunReport,
    StreamControl, ToolDescriptor, ToolRegistry,
};
pub use bridge::{run_blocking, BridgeError};
pub use config::{load_config, RuntimeConfig};
pub use inference::{InferenceClient, ModelEndpoint};
