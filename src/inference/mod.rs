//! Inference Client: OpenAI-compatible API client for the model endpoint.
//!
//! This module handles all communication with the model endpoint:
//! - Request/response and streaming chat completions
//! - Tool call parsing (structured channel + textual fallback)
//! - SSE stream parsing
//! - Endpoint configuration
//!
//! Everything above this layer talks to the [`ModelEndpoint`] trait, so the
//! backend is interchangeable via config or a test fake.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::{InferenceClient, ModelEndpoint, TokenStream};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{
    ChatMessage, ModelRequest, ModelResponse, Role, ToolCall, ToolDefinition,
};
