//! bokji-ai: chat-completion provider layer
//!
//! This crate provides the message types, streaming events and the
//! OpenAI-compatible provider used by the assistant pipeline.

pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use providers::ChatProvider;
pub use stream::{MessageEvent, MessageEventStream};
pub use types::*;
