//! AgentLoop: the tool-calling state machine.
//!
//! ```text
//! AwaitingResponse ─▶ FinalAnswer ───────────────▶ StreamChannel ─▶ Succeeded / Cancelled
//!        ▲          ─▶ StructuredToolCall ─┐
//!        │          ─▶ TextualToolCall ────┴─▶ ExecutingTools
//!        └──────────────────────────────────────────┘
//! ```
//!
//! The first request carries the tool catalog. Once any tool has run, later
//! requests drop the catalog and swap the system prompt for a directive to
//! answer from the tool results already in the conversation, which makes
//! tool-happy models converge. `max_iterations` bounds the loop.
//!
//! A run never returns `Err`: endpoint failures and the iteration ceiling are
//! reported in [`RunReport::outcome`] next to the tool calls made so far.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, BridgeError};
use crate::inference::client::ModelEndpoint;
use crate::inference::errors::InferenceError;
use crate::inference::tool_call_parser::parse_textual_tool_call;
use crate::inference::types::{ChatMessage, ModelRequest, ModelResponse, Role, ToolCall};

use super::arguments::sanitize_arguments;
use super::conversation::ConversationContext;
use super::errors::RunFailure;
use super::stream_channel::{Delivery, DeliveryReport, StreamChannel, StreamControl};
use super::tokens::{preview, truncate_tool_result};
use super::tool_registry::ToolRegistry;

// ─── Prompts ─────────────────────────────────────────────────────────────────

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
When a tool can answer the question better than you can, call it. \
Otherwise answer directly and concisely.";

/// Replaces the system prompt once tools have run.
const SYNTHESIZE_DIRECTIVE: &str = "You have already called tools for this request. \
Synthesize your answer strictly from the tool results already provided in the conversation. \
Do not call any more tools and do not invent information that is not in those results.";

/// Appended to the original question after each batch of tool results.
const REASK_SUFFIX: &str = "Answer using only the information above.";

// ─── Settings ────────────────────────────────────────────────────────────────

/// Loop knobs (the `agent:` section of the runtime config).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    /// Empty means no system message.
    pub system_prompt: String,
    /// Characters of each tool result kept in [`ToolCallRecord::result_preview`].
    pub result_preview_chars: usize,
    /// Tool results longer than this are cut before entering the context.
    pub max_tool_result_chars: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            result_preview_chars: 200,
            max_tool_result_chars: 6_000,
        }
    }
}

// ─── Run Report ──────────────────────────────────────────────────────────────

/// Audit entry for one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    /// Arguments after sanitization, as the tool received them.
    pub arguments: Value,
    pub result_preview: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(String),
    /// The consumer or the cancel token stopped the run. `partial` is the
    /// answer text delivered before that.
    Cancelled { partial: String },
    Failed(RunFailure),
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Every tool call made, in order, including those of a failed run.
    pub records: Vec<ToolCallRecord>,
    /// Model requests issued.
    pub iterations: usize,
}

impl RunReport {
    fn new() -> Self {
        Self {
            outcome: RunOutcome::Cancelled {
                partial: String::new(),
            },
            records: Vec::new(),
            iterations: 0,
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded(_))
    }

    /// The final answer of a successful run.
    pub fn answer(&self) -> Option<&str> {
        match self.outcome {
            RunOutcome::Succeeded(ref text) => Some(text),
            _ => None,
        }
    }
}

/// How a model response is handled.
#[derive(Debug, PartialEq)]
enum ResponseKind {
    FinalAnswer(String),
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
        textual: bool,
    },
}

/// Structured calls first, then a tool call printed as text, else the answer.
fn classify(response: ModelResponse, known_tools: &[String]) -> ResponseKind {
    if !response.tool_calls.is_empty() {
        return ResponseKind::ToolCalls {
            content: response.content.filter(|c| !c.trim().is_empty()),
            calls: response.tool_calls,
            textual: false,
        };
    }
    let text = response.content.unwrap_or_default();
    match parse_textual_tool_call(&text, known_tools) {
        Some(call) => ResponseKind::ToolCalls {
            content: None,
            calls: vec![call],
            textual: true,
        },
        None => ResponseKind::FinalAnswer(text),
    }
}

// ─── AgentLoop ───────────────────────────────────────────────────────────────

/// One conversation driven against a model endpoint and a tool registry.
///
/// The loop owns its [`ConversationContext`]; the registry may be shared
/// with other loops.
pub struct AgentLoop {
    context: ConversationContext,
    registry: Arc<ToolRegistry>,
    endpoint: Arc<dyn ModelEndpoint>,
    settings: AgentSettings,
    cancel: CancellationToken,
}

impl AgentLoop {
    pub fn new(
        context: ConversationContext,
        registry: Arc<ToolRegistry>,
        endpoint: Arc<dyn ModelEndpoint>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            context,
            registry,
            endpoint,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Clone of the token checked between steps; cancel it to stop the run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn into_context(self) -> ConversationContext {
        self.context
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn system_prompt(&self) -> Option<&str> {
        Some(self.settings.system_prompt.as_str()).filter(|p| !p.trim().is_empty())
    }

    /// Answer `prompt`, calling tools as the model asks, and hand the final
    /// answer to `on_token` piece by piece.
    pub async fn run<F>(&mut self, prompt: &str, mut on_token: F) -> RunReport
    where
        F: FnMut(&str) -> StreamControl + Send,
    {
        let report = RunReport::new();
        self.context.append(Role::User, prompt).await;

        if self.cancel.is_cancelled() {
            return report;
        }
        if self.registry.is_empty() {
            return self.answer_directly(report, &mut on_token).await;
        }

        let known_tools = self.registry.tool_names();
        self.tool_loop(report, prompt, &known_tools, &mut on_token).await
    }

    async fn tool_loop<F>(
        &mut self,
        mut report: RunReport,
        prompt: &str,
        known_tools: &[String],
        on_token: &mut F,
    ) -> RunReport
    where
        F: FnMut(&str) -> StreamControl + Send,
    {
        let max_iterations = self.settings.max_iterations;
        let mut tools_used = false;

        for iteration in 1..=max_iterations {
            if self.cancel.is_cancelled() {
                tracing::info!(iteration, "run cancelled between iterations");
                return report;
            }
            report.iterations = iteration;

            let request = self.build_request(tools_used);
            tracing::info!(
                iteration,
                message_count = request.messages.len(),
                tool_count = request.tools.as_ref().map_or(0, Vec::len),
                synthesize = tools_used,
                "agent iteration start"
            );

            let response = match self.endpoint.complete(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(iteration, error = %e, "model endpoint failed, ending run");
                    return report.finish(RunOutcome::Failed(RunFailure::Transport(e)));
                }
            };

            match classify(response, known_tools) {
                ResponseKind::FinalAnswer(text) => {
                    tracing::info!(iteration, answer_len = text.len(), tool_calls = report.records.len(), "final answer");
                    let delivered = StreamChannel::new(&mut *on_token, self.cancel.clone())
                        .deliver_buffered(&text);
                    return self.finish_answer(report, text, delivered).await;
                }
                ResponseKind::ToolCalls {
                    content,
                    calls,
                    textual,
                } => {
                    tracing::info!(
                        iteration,
                        textual,
                        tool_names = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                        "model requested tools"
                    );
                    if self.cancel.is_cancelled() {
                        return report;
                    }
                    tools_used = true;
                    self.execute_calls(content, calls, &mut report).await;

                    let reask = format!("{prompt}\n\n{REASK_SUFFIX}");
                    self.context.append(Role::User, reask).await;
                }
            }
        }

        tracing::warn!(
            max_iterations,
            tool_calls = report.records.len(),
            "iteration limit reached without a final answer"
        );
        report.finish(RunOutcome::Failed(RunFailure::IterationLimitExceeded {
            max_iterations,
        }))
    }

    fn build_request(&self, tools_used: bool) -> ModelRequest {
        if tools_used {
            return ModelRequest::new(self.context.snapshot_for_model(Some(SYNTHESIZE_DIRECTIVE)));
        }
        ModelRequest::new(self.context.snapshot_for_model(self.system_prompt()))
            .with_tools(self.registry.catalog())
    }

    /// Sanitize, record and run one batch of calls, appending the assistant
    /// turn and then each result in invocation order.
    async fn execute_calls(
        &mut self,
        content: Option<String>,
        calls: Vec<ToolCall>,
        report: &mut RunReport,
    ) {
        let calls: Vec<ToolCall> = calls
            .into_iter()
            .map(|call| {
                let arguments = sanitize_arguments(&call.name, call.arguments);
                ToolCall {
                    arguments: Value::Object(arguments),
                    ..call
                }
            })
            .collect();

        self.context
            .append_message(ChatMessage::assistant_tool_calls(content, &calls))
            .await;

        for call in &calls {
            let arguments = match call.arguments {
                Value::Object(ref map) => map.clone(),
                _ => Map::new(),
            };
            let raw = self.registry.execute(&call.name, arguments).await;
            let result = truncate_tool_result(&raw, &call.name, self.settings.max_tool_result_chars);

            report.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                result_preview: preview(&result, self.settings.result_preview_chars),
                timestamp: Utc::now(),
            });
            self.context
                .append_message(ChatMessage::tool_result(&call.id, result))
                .await;
        }
    }

    /// Record the answer in the context and map the delivery to an outcome.
    async fn finish_answer(&mut self, report: RunReport, answer: String, delivered: DeliveryReport) -> RunReport {
        match delivered.delivery {
            Delivery::Completed => {
                self.context.append(Role::Assistant, answer.clone()).await;
                report.finish(RunOutcome::Succeeded(answer))
            }
            Delivery::Cancelled => {
                if !delivered.text.is_empty() {
                    self.context.append(Role::Assistant, delivered.text.clone()).await;
                }
                report.finish(RunOutcome::Cancelled {
                    partial: delivered.text,
                })
            }
            Delivery::Failed(e) => {
                if !delivered.text.is_empty() {
                    self.context.append(Role::Assistant, delivered.text).await;
                }
                report.finish(RunOutcome::Failed(RunFailure::Transport(e)))
            }
        }
    }

    /// No tools registered: stream the answer straight from the endpoint,
    /// falling back to a buffered answer when it cannot stream.
    async fn answer_directly<F>(&mut self, mut report: RunReport, on_token: &mut F) -> RunReport
    where
        F: FnMut(&str) -> StreamControl + Send,
    {
        report.iterations = 1;
        let messages = self.context.snapshot_for_model(self.system_prompt());
        let mut request = ModelRequest::new(messages.clone());
        request.stream = true;

        tracing::info!(message_count = messages.len(), "no tools registered, streaming answer");

        let mut channel = StreamChannel::new(&mut *on_token, self.cancel.clone());
        let delivered = match self.endpoint.stream(request).await {
            Ok(stream) => channel.deliver_stream(stream).await,
            Err(InferenceError::StreamingUnsupported) => {
                tracing::debug!("endpoint cannot stream, delivering buffered answer");
                match self.endpoint.complete(ModelRequest::new(messages)).await {
                    Ok(response) => channel.deliver_buffered(response.content.as_deref().unwrap_or("")),
                    Err(e) => {
                        tracing::warn!(error = %e, "model endpoint failed, ending run");
                        return report.finish(RunOutcome::Failed(RunFailure::Transport(e)));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "model endpoint failed, ending run");
                return report.finish(RunOutcome::Failed(RunFailure::Transport(e)));
            }
        };

        let answer = delivered.text.clone();
        self.finish_answer(report, answer, delivered).await
    }

    /// [`run`](Self::run) from synchronous code.
    ///
    /// The loop is moved onto the bridge and handed back with the report. On
    /// [`BridgeError::Timeout`] the run continues detached and the loop is
    /// not returned.
    pub fn run_blocking<F>(
        mut self,
        prompt: &str,
        on_token: F,
        timeout: Duration,
    ) -> Result<(Self, RunReport), BridgeError>
    where
        F: FnMut(&str) -> StreamControl + Send + 'static,
    {
        let prompt = prompt.to_string();
        bridge::run_blocking_with_timeout(
            async move {
                let report = self.run(&prompt, on_token).await;
                (self, report)
            },
            timeout,
        )
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
