//! Scripted model endpoint for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::inference::client::{ModelEndpoint, TokenStream};
use crate::inference::errors::InferenceError;
use crate::inference::types::{ModelRequest, ModelResponse, ToolCall};

/// Replays queued responses in order and records every request.
pub(crate) struct ScriptedEndpoint {
    script: Mutex<VecDeque<Result<ModelResponse, InferenceError>>>,
    /// Returned once the script runs out; `None` means a transport error.
    fallback: Option<ModelResponse>,
    /// When set, `stream` yields these tokens instead of being unsupported.
    stream_tokens: Option<Vec<String>>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedEndpoint {
    pub fn new(script: Vec<Result<ModelResponse, InferenceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            stream_tokens: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(ModelResponse::text(*t))).collect())
    }

    /// Answers every request with the same response.
    pub fn repeating(response: ModelResponse) -> Self {
        let mut endpoint = Self::new(Vec::new());
        endpoint.fallback = Some(response);
        endpoint
    }

    pub fn failing() -> Self {
        Self::new(vec![Err(InferenceError::ConnectionFailed {
            endpoint: "http://test".into(),
            reason: "connection refused".into(),
        })])
    }

    pub fn with_stream(mut self, tokens: &[&str]) -> Self {
        self.stream_tokens = Some(tokens.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> ModelRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedEndpoint {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, InferenceError> {
        self.requests.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(next) => next,
            None => self.fallback.clone().ok_or(InferenceError::ConnectionFailed {
                endpoint: "http://test".into(),
                reason: "script exhausted".into(),
            }),
        }
    }

    async fn stream(&self, request: ModelRequest) -> Result<TokenStream, InferenceError> {
        let Some(ref tokens) = self.stream_tokens else {
            return Err(InferenceError::StreamingUnsupported);
        };
        self.requests.lock().unwrap().push(request);
        let items: Vec<Result<String, InferenceError>> = tokens.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Structured tool call with a fixed id.
pub(crate) fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}
