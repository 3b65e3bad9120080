//! Model endpoint configuration.
//!
//! One OpenAI-compatible endpoint per runtime. Loaded as the `model:` section
//! of the runtime config (see [`crate::config`]); every field has a default so
//! a missing section targets a local Ollama instance.

use serde::Deserialize;

use super::errors::InferenceError;

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_model_name() -> String {
    "qwen2.5:7b-instruct".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    5
}

/// Runtime configuration for the model endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL up to and including the API version, e.g. `http://host:11434/v1`.
    pub base_url: String,
    /// Model identifier sent in the `model` field of each request.
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Total timeout for one request, streaming included.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// `{base_url}/chat/completions`, tolerant of a trailing slash.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Reject values the endpoint would refuse anyway.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(InferenceError::ConfigError {
                reason: format!("base_url must be http(s): '{}'", self.base_url),
            });
        }
        if self.model_name.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model_name is empty".into(),
            });
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::ConfigError {
                reason: "max_tokens must be positive".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(InferenceError::ConfigError {
                reason: format!("temperature {} outside 0.0..=2.0", self.temperature),
            });
        }
        Ok(())
    }
}
