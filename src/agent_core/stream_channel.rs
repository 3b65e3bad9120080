//! StreamChannel: hands the final answer to a consumer token by token.
//!
//! The same callback receives either live endpoint tokens
//! ([`deliver_stream`](StreamChannel::deliver_stream)) or an already buffered
//! answer split word by word ([`deliver_buffered`](StreamChannel::deliver_buffered)),
//! so consumers never special-case the non-streamed path.
//!
//! Cancellation is cooperative and checked at every token boundary: the
//! callback may return [`StreamControl::Cancel`], or another task may cancel
//! the shared [`CancellationToken`].

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::inference::client::TokenStream;
use crate::inference::errors::InferenceError;

/// What the consumer wants after receiving a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Cancel,
}

impl From<bool> for StreamControl {
    /// `true` keeps the stream going.
    fn from(keep_going: bool) -> Self {
        if keep_going {
            StreamControl::Continue
        } else {
            StreamControl::Cancel
        }
    }
}

#[derive(Debug)]
pub enum Delivery {
    Completed,
    Cancelled,
    /// The endpoint stream broke off.
    Failed(InferenceError),
}

/// Result of one delivery.
#[derive(Debug)]
pub struct DeliveryReport {
    pub delivery: Delivery,
    /// Everything handed to the callback, concatenated.
    pub text: String,
    pub chunks: usize,
}

impl DeliveryReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.delivery, Delivery::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.delivery, Delivery::Cancelled)
    }
}

pub struct StreamChannel<F> {
    callback: F,
    cancel: CancellationToken,
}

impl<F> StreamChannel<F>
where
    F: FnMut(&str) -> StreamControl,
{
    pub fn new(callback: F, cancel: CancellationToken) -> Self {
        Self { callback, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hand one chunk to the callback. Returns `false` once delivery must stop.
    fn push(&mut self, chunk: &str, report: &mut DeliveryReport) -> bool {
        if self.cancel.is_cancelled() {
            report.delivery = Delivery::Cancelled;
            return false;
        }
        report.text.push_str(chunk);
        report.chunks += 1;
        if (self.callback)(chunk) == StreamControl::Cancel {
            tracing::debug!(chunks = report.chunks, "consumer cancelled delivery");
            self.cancel.cancel();
            report.delivery = Delivery::Cancelled;
            return false;
        }
        true
    }

    /// Forward tokens from a live endpoint stream.
    pub async fn deliver_stream(&mut self, mut stream: TokenStream) -> DeliveryReport {
        let mut report = DeliveryReport {
            delivery: Delivery::Completed,
            text: String::new(),
            chunks: 0,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.delivery = Delivery::Cancelled;
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                None => break,
                Some(Ok(token)) if token.is_empty() => {}
                Some(Ok(token)) => {
                    if !self.push(&token, &mut report) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, chunks = report.chunks, "token stream failed");
                    report.delivery = Delivery::Failed(e);
                    break;
                }
            }
        }
        report
    }

    /// Deliver an already complete answer word by word (whitespace kept).
    pub fn deliver_buffered(&mut self, text: &str) -> DeliveryReport {
        let mut report = DeliveryReport {
            delivery: Delivery::Completed,
            text: String::with_capacity(text.len()),
            chunks: 0,
        };
        for chunk in text.split_inclusive(char::is_whitespace) {
            if !self.push(chunk, &mut report) {
                break;
            }
        }
        report
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn token_stream(tokens: &[&str]) -> TokenStream {
        let items: Vec<Result<String, InferenceError>> =
            tokens.iter().map(|t| Ok(t.to_string())).collect();
        Box::pin(futures::stream::iter(items))
    }

    #[test]
    fn test_buffered_delivery_is_word_by_word() {
        let mut seen = Vec::new();
        let mut channel = StreamChannel::new(
            |chunk: &str| {
                seen.push(chunk.to_string());
                StreamControl::Continue
            },
            CancellationToken::new(),
        );
        let report = channel.deliver_buffered("The answer is 42.");
        assert!(report.is_completed());
        assert_eq!(report.text, "The answer is 42.");
        drop(channel);
        assert_eq!(seen, vec!["The ", "answer ", "is ", "42."]);
    }

    #[test]
    fn test_buffered_cancel_stops_immediately() {
        let mut count = 0;
        let mut channel = StreamChannel::new(
            |_: &str| {
                count += 1;
                StreamControl::from(count < 2)
            },
            CancellationToken::new(),
        );
        let report = channel.deliver_buffered("one two three four");
        assert!(report.is_cancelled());
        assert_eq!(report.text, "one two ");
        assert!(channel.cancel_token().is_cancelled());
    }

    #[test]
    fn test_buffered_respects_external_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let mut called = false;
        let mut channel = StreamChannel::new(
            |_: &str| {
                called = true;
                StreamControl::Continue
            },
            token,
        );
        let report = channel.deliver_buffered("never seen");
        assert!(report.is_cancelled());
        assert!(report.text.is_empty());
        drop(channel);
        assert!(!called);
    }

    #[tokio::test]
    async fn test_stream_delivery() {
        let mut channel = StreamChannel::new(|_: &str| StreamControl::Continue, CancellationToken::new());
        let report = channel.deliver_stream(token_stream(&["Hel", "lo", "", "!"])).await;
        assert!(report.is_completed());
        assert_eq!(report.text, "Hello!");
        assert_eq!(report.chunks, 3);
    }

    #[tokio::test]
    async fn test_stream_cancel_from_callback() {
        let mut channel = StreamChannel::new(
            |chunk: &str| StreamControl::from(chunk != "stop"),
            CancellationToken::new(),
        );
        let report = channel.deliver_stream(token_stream(&["a", "stop", "b"])).await;
        assert!(report.is_cancelled());
        assert_eq!(report.text, "astop");
    }

    #[tokio::test]
    async fn test_stream_error_is_reported_with_partial_text() {
        let items: Vec<Result<String, InferenceError>> = vec![
            Ok("partial".into()),
            Err(InferenceError::StreamError {
                reason: "connection reset".into(),
            }),
        ];
        let mut channel = StreamChannel::new(|_: &str| StreamControl::Continue, CancellationToken::new());
        let report = channel.deliver_stream(Box::pin(futures::stream::iter(items))).await;
        assert!(matches!(report.delivery, Delivery::Failed(_)));
        assert_eq!(report.text, "partial");
    }

    #[tokio::test]
    async fn test_stream_cancelled_while_waiting() {
        let token = CancellationToken::new();
        let pending: TokenStream = Box::pin(futures::stream::pending());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let mut channel = StreamChannel::new(|_: &str| StreamControl::Continue, token);
        let report = channel.deliver_stream(pending).await;
        assert!(report.is_cancelled());
    }
}
