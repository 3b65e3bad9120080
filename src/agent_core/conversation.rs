//! ConversationContext: in-memory conversation history with a rolling summary.
//!
//! Responsibilities:
//! - Keep messages in append order (the wire order to the model)
//! - Estimate context size after every append
//! - Compress older messages into a summary once the estimate passes the
//!   threshold, keeping the most recent messages verbatim
//! - Build the exact message list sent to the model endpoint
//!
//! Compression never fails from the caller's point of view: when the
//! summarizer is missing or errors, the oldest half is dropped instead
//! (never reaching into the recent messages).

use std::sync::Arc;

use serde::Deserialize;

use crate::inference::client::ModelEndpoint;
use crate::inference::types::{ChatMessage, ModelRequest, Role};

use super::errors::SummarizationError;
use super::tokens::{CharRatioEstimator, TokenEstimator, DEFAULT_CHARS_PER_TOKEN};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Instruction sent with the transcript of messages being compressed.
const SUMMARIZE_INSTRUCTION: &str = "You compress conversation history. \
Summarize the following conversation factually in 3-5 sentences. \
Keep names, numbers, file paths and tool results that later turns may rely on. \
Do not add commentary or answer any question in it.";

/// Heading under which the summary is rendered for the model.
const SUMMARY_HEADING: &str = "## Previous conversation summary:";

/// Marker prepended when the summary is cut instead of re-summarized.
const SUMMARY_OMITTED_MARKER: &str = "[earlier context omitted]";

// ─── Settings ───────────────────────────────────────────────────────────────

fn default_token_threshold() -> usize {
    24_000
}
fn default_recent_keep_count() -> usize {
    20
}
fn default_max_summary_chars() -> usize {
    2_000
}
fn default_chars_per_token() -> f64 {
    DEFAULT_CHARS_PER_TOKEN
}

/// Context budget knobs (the `context:` section of the runtime config).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Estimated tokens above which `append` compresses.
    pub token_threshold: usize,
    /// Most recent messages always kept verbatim.
    pub recent_keep_count: usize,
    /// Summary length above which the merged summary is re-summarized.
    pub max_summary_chars: usize,
    /// Ratio for the default estimator.
    pub chars_per_token: f64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            recent_keep_count: default_recent_keep_count(),
            max_summary_chars: default_max_summary_chars(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// What a compression pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// Nothing to compress.
    Unchanged,
    /// `compressed` messages were folded into the summary.
    Summarized { compressed: usize },
    /// Summarization failed; `dropped` messages were discarded.
    Truncated { dropped: usize },
}

// ─── ConversationContext ────────────────────────────────────────────────────

/// Ordered message log for one session, with its rolling summary.
pub struct ConversationContext {
    messages: Vec<ChatMessage>,
    summary: Option<String>,
    settings: ContextSettings,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Option<Arc<dyn ModelEndpoint>>,
}

impl ConversationContext {
    /// Empty context using the character-ratio estimator and no summarizer.
    pub fn new(settings: ContextSettings) -> Self {
        let estimator = Arc::new(CharRatioEstimator::new(settings.chars_per_token));
        Self {
            messages: Vec::new(),
            summary: None,
            settings,
            estimator,
            summarizer: None,
        }
    }

    /// Endpoint used to summarize older messages.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn ModelEndpoint>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Estimated tokens of all messages plus the summary.
    pub fn estimated_tokens(&self) -> usize {
        self.estimator
            .estimate_context(&self.messages, self.summary.as_deref())
    }

    // ─── Append ─────────────────────────────────────────────────────────

    /// Append a plain message with `role` and `content`.
    pub async fn append(&mut self, role: Role, content: impl Into<String>) -> CompressionOutcome {
        self.append_message(ChatMessage::new(role, content)).await
    }

    /// Append any message (tool calls, tool results) and compress if the
    /// estimate now exceeds the threshold.
    pub async fn append_message(&mut self, message: ChatMessage) -> CompressionOutcome {
        self.messages.push(message);

        let estimated = self.estimated_tokens();
        if estimated <= self.settings.token_threshold {
            return CompressionOutcome::Unchanged;
        }

        tracing::info!(
            estimated_tokens = estimated,
            threshold = self.settings.token_threshold,
            message_count = self.messages.len(),
            "context over budget; compressing"
        );
        self.compress().await
    }

    // ─── Compress ───────────────────────────────────────────────────────

    /// Fold everything but the most recent messages into the summary.
    ///
    /// A no-op while the estimate is within `token_threshold` or there are no
    /// more than `recent_keep_count` messages.
    pub async fn compress(&mut self) -> CompressionOutcome {
        if self.estimated_tokens() <= self.settings.token_threshold {
            return CompressionOutcome::Unchanged;
        }

        let len = self.messages.len();
        let keep = self.settings.recent_keep_count;
        if len <= keep {
            return CompressionOutcome::Unchanged;
        }

        let split = self.adjust_split(len - keep);
        if split == 0 {
            return CompressionOutcome::Unchanged;
        }

        match self.summarize(&self.messages[..split]).await {
            Ok(fresh) => {
                let merged = match self.summary.take() {
                    Some(existing) => format!("{existing}\n{fresh}"),
                    None => fresh,
                };
                self.summary = Some(self.bound_summary(merged).await);
                self.messages.drain(..split);
                tracing::info!(
                    compressed = split,
                    kept = self.messages.len(),
                    summary_chars = self.summary.as_deref().map(|s| s.chars().count()).unwrap_or(0),
                    "older messages summarized"
                );
                CompressionOutcome::Summarized { compressed: split }
            }
            Err(e) => {
                // Oldest half, but never into the recent window.
                let dropped = self.adjust_split((len / 2).min(len - keep));
                if dropped == 0 {
                    tracing::warn!(error = %e, "summarization failed; nothing safe to drop");
                    return CompressionOutcome::Unchanged;
                }
                tracing::warn!(
                    error = %e,
                    dropped,
                    "summarization failed; dropping oldest messages"
                );
                self.messages.drain(..dropped);
                CompressionOutcome::Truncated { dropped }
            }
        }
    }

    /// Move a split point back over tool results to their assistant tool
    /// call, so the kept part never starts with an orphaned result. Only ever
    /// moves toward zero, which keeps more messages, never fewer.
    fn adjust_split(&self, mut split: usize) -> usize {
        while split > 0 && split < self.messages.len() && self.messages[split].role == Role::Tool {
            split -= 1;
        }
        split
    }

    async fn summarize(&self, messages: &[ChatMessage]) -> Result<String, SummarizationError> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or(SummarizationError::NoSummarizer)?;

        let request = ModelRequest::new(vec![
            ChatMessage::system(SUMMARIZE_INSTRUCTION),
            ChatMessage::user(render_transcript(messages)),
        ]);
        let response = summarizer.complete(request).await?;

        response
            .content
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(SummarizationError::EmptySummary)
    }

    /// Keep the merged summary under `max_summary_chars`: re-summarize it,
    /// and if that fails or is still too long, keep its most recent part.
    async fn bound_summary(&self, merged: String) -> String {
        let max = self.settings.max_summary_chars;
        if merged.chars().count() <= max {
            return merged;
        }

        let as_message = [ChatMessage::assistant(merged.clone())];
        match self.summarize(&as_message).await {
            Ok(resummarized) if resummarized.chars().count() <= max => resummarized,
            Ok(too_long) => keep_tail(&too_long, max),
            Err(e) => {
                tracing::warn!(error = %e, "summary re-summarization failed; keeping the tail");
                keep_tail(&merged, max)
            }
        }
    }

    // ─── Snapshot ───────────────────────────────────────────────────────

    /// The messages to send to the model, in order.
    ///
    /// The summary, when present, is rendered ahead of every message: appended
    /// to `system_prompt`, or as its own leading system message.
    pub fn snapshot_for_model(&self, system_prompt: Option<&str>) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);

        let summary_block = self
            .summary
            .as_ref()
            .map(|s| format!("{SUMMARY_HEADING}\n{s}"));
        match (system_prompt, summary_block) {
            (Some(prompt), Some(block)) => out.push(ChatMessage::system(format!("{prompt}\n\n{block}"))),
            (Some(prompt), None) => out.push(ChatMessage::system(prompt)),
            (None, Some(block)) => out.push(ChatMessage::system(block)),
            (None, None) => {}
        }

        out.extend(self.messages.iter().cloned());
        out
    }
}

/// `role: content` lines for the summarizer.
fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let mut line = format!("{}: {}", m.role.as_str(), m.text());
            if let Some(ref calls) = m.tool_calls {
                for call in calls {
                    line.push_str(&format!(
                        " [called {}({})]",
                        call.function.name, call.function.arguments
                    ));
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Last `max_chars` characters of `text`, marked as cut.
fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    let skip = total.saturating_sub(max_chars);
    let tail: String = text.chars().skip(skip).collect();
    format!("{SUMMARY_OMITTED_MARKER}\n{tail}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────
