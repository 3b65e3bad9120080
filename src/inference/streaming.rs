//! Response parsing for OpenAI-compatible chat completions.
//!
//! Streaming: the HTTP body is read as a byte stream, split on SSE event
//! boundaries (`data: …\n\n`), and each chunk's `delta.content` is yielded as a
//! token. Tool calls are never streamed; the agent loop only streams once it
//! knows no tool is involved.
//!
//! Non-streaming: the whole body is one JSON document with `choices[0].message`.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::tool_call_parser::parse_native_json_tool_call;
use super::types::{ChatCompletionChunk, ModelResponse};

// ─── SSE Events ──────────────────────────────────────────────────────────────

/// What one SSE event contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A non-empty content token.
    Token(String),
    /// `data: [DONE]`.
    Done,
    /// Keep-alive, comment, role-only delta, or empty content.
    Skip,
}

/// Decode a single SSE event (possibly spanning several `data:` lines).
pub fn decode_sse_event(event: &str) -> Result<SseEvent, InferenceError> {
    let mut data = String::new();
    for line in event.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(SseEvent::Done);
        }
        data.push_str(payload);
    }

    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(&data).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
        })?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|token| !token.is_empty())
        .map(SseEvent::Token)
        .unwrap_or(SseEvent::Skip))
}

// ─── Token Stream ────────────────────────────────────────────────────────────

struct SseState<S> {
    bytes: S,
    /// Raw bytes not yet forming a complete event. Kept as bytes so a UTF-8
    /// sequence split across network chunks is decoded intact. Carriage
    /// returns are dropped on arrival, so `\r\n\r\n` separates events too.
    buffer: Vec<u8>,
    finished: bool,
}

fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(String::from_utf8_lossy(&event[..end]).into_owned())
}

/// Turn a raw SSE byte stream into a stream of content tokens.
///
/// Ends at `[DONE]` or when the body ends. A transport error is yielded once
/// and ends the stream.
pub fn sse_token_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(event) = take_event(&mut state.buffer) {
                match decode_sse_event(&event) {
                    Ok(SseEvent::Token(token)) => return Some((Ok(token), state)),
                    Ok(SseEvent::Skip) => continue,
                    Ok(SseEvent::Done) => return None,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => state
                    .buffer
                    .extend(bytes.as_ref().iter().copied().filter(|&b| b != b'\r')),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(InferenceError::StreamError {
                            reason: format!("stream read error: {e}"),
                        }),
                        state,
                    ));
                }
                None => {
                    // Body ended without a trailing blank line.
                    state.finished = true;
                    let rest = String::from_utf8_lossy(&state.buffer).trim().to_string();
                    state.buffer.clear();
                    if rest.is_empty() {
                        return None;
                    }
                    return match decode_sse_event(&rest) {
                        Ok(SseEvent::Token(token)) => Some((Ok(token), state)),
                        Ok(_) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }
            }
        }
    })
}

/// Token stream over a live `reqwest` response body.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, InferenceError>> {
    sse_token_stream(Box::pin(response.bytes_stream()))
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NonStreamResponse {
    choices: Vec<NonStreamChoice>,
}

#[derive(Deserialize)]
struct NonStreamChoice {
    message: NonStreamMessage,
}

#[derive(Deserialize)]
struct NonStreamMessage {
    content: Option<String>,
    tool_calls: Option<Vec<NonStreamToolCall>>,
}

#[derive(Deserialize)]
struct NonStreamToolCall {
    id: Option<String>,
    function: NonStreamFunction,
}

#[derive(Deserialize)]
struct NonStreamFunction {
    name: String,
    /// Some servers send an object here instead of JSON text.
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse a complete response body into content and structured tool calls.
///
/// Argument JSON that cannot be repaired degrades to an empty map; the
/// tool itself reports what is missing.
pub fn parse_non_streaming_response(body: &str) -> Result<ModelResponse, InferenceError> {
    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let message = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::StreamError {
            reason: "empty choices array".into(),
        })?
        .message;

    let content = message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    for tc in message.tool_calls.unwrap_or_default() {
        let raw = match tc.function.arguments {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        match parse_native_json_tool_call(tc.id.as_deref(), &tc.function.name, &raw) {
            Ok(call) => tool_calls.push(call),
            Err(InferenceError::ToolCallParseError { reason, .. })
                if !tc.function.name.trim().is_empty() =>
            {
                tracing::warn!(
                    tool = %tc.function.name,
                    reason = %reason,
                    "unparseable tool call arguments; using empty map"
                );
                let fallback = parse_native_json_tool_call(tc.id.as_deref(), &tc.function.name, "")?;
                tool_calls.push(fallback);
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping tool call without a name");
            }
        }
    }

    Ok(ModelResponse::with_tool_calls(content, tool_calls))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
