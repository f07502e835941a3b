//! Streaming event types and utilities

use crate::error::{Error, Result};
use crate::types::{Message, StopReason, Usage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a response streams in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Initial message structure
    Start { message: Message },
    /// Text content delta
    TextDelta { delta: String },
    /// Message completed successfully
    Done {
        message: Message,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Error occurred. HTTP failures carry the response status.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error { .. })
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Drain a stream into the final text.
///
/// Text deltas are accumulated so a stream that ends without a `Done`
/// event still yields what arrived. An `Error` event aborts collection.
pub async fn collect_text(mut stream: MessageEventStream) -> Result<String> {
    let mut text = String::new();

    while let Some(event) = stream.next().await {
        match event {
            MessageEvent::TextDelta { delta } => text.push_str(&delta),
            MessageEvent::Done { message, .. } => {
                let final_text = message.text();
                if !final_text.is_empty() {
                    text = final_text.to_string();
                }
                break;
            }
            MessageEvent::Error {
                message,
                status,
                retry_after,
            } => {
                return Err(match status {
                    Some(status) => Error::from_status(status, retry_after, &message),
                    None => Error::Sse(message),
                });
            }
            MessageEvent::Start { .. } => {}
        }
    }

    if text.trim().is_empty() {
        return Err(Error::UnexpectedResponse("empty completion".to_string()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(events: Vec<MessageEvent>) -> MessageEventStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn test_collect_text_prefers_done_message() {
        let events = vec![
            MessageEvent::TextDelta { delta: "부분".into() },
            MessageEvent::Done {
                message: Message::assistant("최종 답변"),
                stop_reason: StopReason::Stop,
                usage: Usage::default(),
            },
        ];
        assert_eq!(collect_text(stream_of(events)).await.unwrap(), "최종 답변");
    }

    #[tokio::test]
    async fn test_collect_text_without_done_uses_deltas() {
        let events = vec![
            MessageEvent::TextDelta { delta: "hello ".into() },
            MessageEvent::TextDelta { delta: "world".into() },
        ];
        assert_eq!(collect_text(stream_of(events)).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_collect_text_error_event() {
        let events = vec![
            MessageEvent::TextDelta { delta: "x".into() },
            MessageEvent::Error {
                message: "connection reset".into(),
                status: None,
                retry_after: None,
            },
        ];
        let err = collect_text(stream_of(events)).await.unwrap_err();
        assert!(matches!(err, Error::Sse(_)));
    }

    #[tokio::test]
    async fn test_collect_text_status_error_is_typed() {
        let events = vec![MessageEvent::Error {
            message: "slow down".into(),
            status: Some(429),
            retry_after: Some(2),
        }];
        let err = collect_text(stream_of(events)).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after: Some(2) }));
    }

    #[tokio::test]
    async fn test_collect_text_empty_is_error() {
        let err = collect_text(stream_of(vec![])).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse(_)));
    }
}
