//! Agent Core error types.
//!
//! None of these cross the public API as `Err`: tool errors become result
//! strings, summarization errors fall back to truncation, and run failures
//! are reported inside [`RunReport`](super::agent_loop::RunReport).

use thiserror::Error;

use crate::inference::errors::InferenceError;
use crate::mcp_client::errors::McpError;

/// Prefix of every tool result that reports a failure.
pub const TOOL_ERROR_PREFIX: &str = "[tool error]";

/// A single tool invocation failed.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No local or external tool is registered under this name.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// A local handler returned an error.
    #[error("tool '{name}' failed: {reason}")]
    Handler { name: String, reason: String },

    /// A local handler panicked.
    #[error("tool '{name}' panicked: {reason}")]
    Panicked { name: String, reason: String },

    /// The external provider reported an error.
    #[error("{0}")]
    External(#[from] McpError),
}

impl ToolError {
    /// Render as the string the model sees.
    pub fn to_tool_result(&self) -> String {
        format!("{TOOL_ERROR_PREFIX} {self}")
    }
}

/// Compressing older history into a summary failed.
#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("no summarizer endpoint configured")]
    NoSummarizer,

    #[error("summarizer call failed: {0}")]
    Endpoint(#[from] InferenceError),

    #[error("summarizer returned an empty summary")]
    EmptySummary,
}

/// Why an agent run ended without an answer.
#[derive(Debug, Error)]
pub enum RunFailure {
    /// The model endpoint was unreachable or returned an error status.
    #[error("model endpoint error: {0}")]
    Transport(InferenceError),

    /// No final answer within the iteration ceiling.
    #[error("no final answer after {max_iterations} iterations")]
    IterationLimitExceeded { max_iterations: usize },
}
