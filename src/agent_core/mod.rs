//! Agent Core: orchestration layer of the runtime.
//!
//! Submodules:
//! - `agent_loop`: The tool-calling state machine and its run report
//! - `conversation`: Conversation history with rolling summarization
//! - `tool_registry`: Flat catalog over local and provider-hosted tools
//! - `stream_channel`: Token delivery to the caller with cooperative cancellation
//! - `arguments`: Schema-echo detection and argument normalization
//! - `tokens`: Pluggable token estimation and UTF-8-safe truncation
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod arguments;
pub mod conversation;
pub mod errors;
pub mod stream_channel;
pub mod tokens;
pub mod tool_registry;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use agent_loop::{AgentLoop, AgentSettings, RunOutcome, RunReport, ToolCallRecord};
pub use arguments::ArgumentValue;
pub use conversation::{CompressionOutcome, ContextSettings, ConversationContext};
pub use errors::{RunFailure, SummarizationError, ToolError};
pub use stream_channel::{Delivery, DeliveryReport, StreamChannel, StreamControl};
pub use tokens::{CharRatioEstimator, TokenEstimator};
pub use tool_registry::{
    ConnectReport, ToolDescriptor, ToolHandler, ToolOrigin, ToolRegistry, NAMESPACE_SEPARATOR,
};
