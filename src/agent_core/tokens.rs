//! Token estimation for context window management.
//!
//! The estimate is a character-ratio heuristic, not a tokenizer count. It is
//! behind [`TokenEstimator`] so a real tokenizer can replace it without touching
//! the conversation logic; the ratio decides when summarization triggers.

use crate::inference::types::ChatMessage;

// ─── Estimator ───────────────────────────────────────────────────────────────

/// Default characters per token.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Estimates how many tokens a piece of context will cost.
pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for `text`.
    fn estimate_text(&self, text: &str) -> usize;

    /// Estimated tokens for a whole message list plus an optional summary.
    fn estimate_context(&self, messages: &[ChatMessage], summary: Option<&str>) -> usize {
        let chars: usize = messages.iter().map(ChatMessage::char_len).sum::<usize>()
            + summary.map(|s| s.chars().count()).unwrap_or(0);
        self.estimate_chars(chars)
    }

    /// Estimated tokens for a raw character count.
    fn estimate_chars(&self, chars: usize) -> usize;
}

/// `tokens = chars / chars_per_token`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate_text(&self, text: &str) -> usize {
        self.estimate_chars(text.chars().count())
    }

    fn estimate_chars(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token) as usize
    }
}

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// First `max_chars` characters of `s`, with `...` appended when cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
        None => s.to_string(),
    }
}

/// Cap a tool result before it enters the conversation.
///
/// Long results crowd out history and push the context over the
/// summarization threshold in one step.
pub fn truncate_tool_result(result: &str, tool_name: &str, max_chars: usize) -> String {
    let total = result.chars().count();
    if total <= max_chars {
        return result.to_string();
    }

    let kept = match result.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &result[..byte_idx],
        None => result,
    };
    tracing::warn!(
        tool = %tool_name,
        original_len = total,
        truncated_to = max_chars,
        "tool result truncated"
    );
    format!("{kept}\n\n[... truncated: showing first {max_chars} of {total} chars]")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_text_default_ratio() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate_text(""), 0);
        assert_eq!(est.estimate_text(&"a".repeat(100)), 25);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        let est = CharRatioEstimator::new(1.0);
        // 3 chars, 9 bytes
        assert_eq!(est.estimate_text("═══"), 3);
    }

    #[test]
    fn test_invalid_ratio_falls_back() {
        assert_eq!(CharRatioEstimator::new(0.0).chars_per_token(), 4.0);
        assert_eq!(CharRatioEstimator::new(f64::NAN).chars_per_token(), 4.0);
        assert_eq!(CharRatioEstimator::new(2.5).chars_per_token(), 2.5);
    }

    #[test]
    fn test_estimate_context_includes_summary() {
        let est = CharRatioEstimator::new(1.0);
        let messages = vec![ChatMessage::user("abcd"), ChatMessage::assistant("ef")];
        assert_eq!(est.estimate_context(&messages, None), 6);
        assert_eq!(est.estimate_context(&messages, Some("xyz")), 9);
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        // '═' is U+2550, encoded as 3 bytes
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("hello world", 5), "hello...");
        assert_eq!(preview("hi", 5), "hi");
        assert_eq!(preview("ééééé", 2), "éé...");
    }

    #[test]
    fn test_truncate_tool_result_under_cap() {
        assert_eq!(truncate_tool_result("short", "t", 100), "short");
    }

    #[test]
    fn test_truncate_tool_result_over_cap_unicode() {
        let result = "═".repeat(50);
        let out = truncate_tool_result(&result, "audit", 10);
        assert!(out.starts_with(&"═".repeat(10)));
        assert!(out.ends_with("[... truncated: showing first 10 of 50 chars]"));
    }
}
