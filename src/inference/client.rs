//! Model endpoint abstraction and the OpenAI-compatible HTTP client.
//!
//! The agent loop and the conversation summarizer only see [`ModelEndpoint`].
//! [`InferenceClient`] implements it against `POST {base_url}/chat/completions`;
//! tests substitute scripted fakes.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ModelRequest, ModelResponse};

/// Boxed stream of answer tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

// ─── ModelEndpoint ───────────────────────────────────────────────────────────

/// A language-model backend reachable by request/response and, optionally,
/// by a token stream.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// Send the request and wait for the complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, InferenceError>;

    /// Stream the answer token by token.
    ///
    /// Endpoints that cannot stream keep the default, and callers fall back
    /// to [`complete`](Self::complete).
    async fn stream(&self, _request: ModelRequest) -> Result<TokenStream, InferenceError> {
        Err(InferenceError::StreamingUnsupported)
    }
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
}

impl InferenceClient {
    /// Build a client. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        config.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, config })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn build_body(&self, request: ModelRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model_name.clone(),
            tool_choice: request.tools.as_ref().map(|_| "auto".to_string()),
            messages: request.messages,
            tools: request.tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        }
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.config.request_timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// POST the body and turn non-2xx statuses into `HttpError`.
    async fn send(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, InferenceError> {
        let url = self.config.completions_url();

        // Log the request metadata (not the full body; it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            stream = body.stream,
            "sending chat completion request"
        );

        let mut builder = self.http.post(&url).json(body);
        if body.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "model endpoint returned an error");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelEndpoint for InferenceClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, InferenceError> {
        let body = self.build_body(request, false);
        let response = self.send(&body).await?;

        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;

        let parsed = parse_non_streaming_response(&text)?;
        tracing::debug!(
            content_len = parsed.content.as_deref().map(str::len).unwrap_or(0),
            tool_calls = parsed.tool_calls.len(),
            "chat completion received"
        );
        Ok(parsed)
    }

    async fn stream(&self, request: ModelRequest) -> Result<TokenStream, InferenceError> {
        let body = self.build_body(request, true);
        let response = self.send(&body).await?;
        Ok(Box::pin(parse_sse_stream(response)))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{ChatMessage, ToolDefinition};
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client() -> InferenceClient {
        InferenceClient::from_config(ModelConfig {
            base_url: "http://127.0.0.1:9/v1".into(),
            model_name: "test-model".into(),
            connect_timeout_secs: 1,
            request_timeout_secs: 2,
            ..ModelConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let result = InferenceClient::from_config(ModelConfig {
            model_name: String::new(),
            ..ModelConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_build_body_sets_tool_choice_only_with_tools() {
        let client = client();
        let plain = client.build_body(ModelRequest::new(vec![ChatMessage::user("hi")]), false);
        assert!(plain.tool_choice.is_none());
        assert_eq!(plain.model, "test-model");

        let with_tools = client.build_body(
            ModelRequest::new(vec![]).with_tools(vec![ToolDefinition::function(
                "t",
                "d",
                serde_json::json!({"type": "object", "properties": {}}),
            )]),
            true,
        );
        assert_eq!(with_tools.tool_choice.as_deref(), Some("auto"));
        assert!(with_tools.stream);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // Port 9 (discard) is closed on test machines.
        let err = client()
            .complete(ModelRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    struct CompleteOnly;

    #[async_trait]
    impl ModelEndpoint for CompleteOnly {
        async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, InferenceError> {
            Ok(ModelResponse::text("ok"))
        }
    }

    #[tokio::test]
    async fn test_default_stream_is_unsupported() {
        let result = CompleteOnly.stream(ModelRequest::default()).await;
        assert!(matches!(result, Err(InferenceError::StreamingUnsupported)));
    }

    // ─── Local endpoint ─────────────────────────────────────────────────

    /// Read one HTTP request (head plus `Content-Length` body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let line = line.to_ascii_lowercase();
                        line.strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    /// Answer a single request with a canned response. Returns the base URL
    /// and a handle yielding the raw request that was received.
    async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{addr}/v1"), handle)
    }

    fn local_client(base_url: String) -> InferenceClient {
        InferenceClient::from_config(ModelConfig {
            base_url,
            model_name: "test-model".into(),
            connect_timeout_secs: 2,
            request_timeout_secs: 5,
            ..ModelConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_parses_local_response() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })
        .to_string();
        let (base_url, server) = serve_once("200 OK", "application/json", body).await;

        let response = local_client(base_url)
            .complete(ModelRequest::new(vec![ChatMessage::user("find rust")]))
            .await
            .unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "search");
        assert_eq!(response.tool_calls[0].arguments["q"], "rust");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains("\"model\":\"test-model\""));
        assert!(request.contains("\"stream\":false"));
    }

    #[tokio::test]
    async fn test_stream_yields_tokens_from_local_endpoint() {
        let event = |token: &str| {
            format!(
                "data: {}\r\n\r\n",
                serde_json::json!({"choices": [{"delta": {"content": token}, "finish_reason": null}]})
            )
        };
        let body = format!("{}{}data: [DONE]\r\n\r\n", event("Hel"), event("lo"));
        let (base_url, server) = serve_once("200 OK", "text/event-stream", body).await;

        let stream = local_client(base_url)
            .stream(ModelRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["Hel", "lo"]);

        let request = server.await.unwrap();
        assert!(request.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn test_error_status_is_http_error() {
        let (base_url, server) =
            serve_once("500 Internal Server Error", "text/plain", "model not loaded".into()).await;

        let err = local_client(base_url)
            .complete(ModelRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        match err {
            InferenceError::HttpError { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model not loaded");
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
        server.await.unwrap();
    }
}
