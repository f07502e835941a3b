//! External capabilities consumed by the pipeline.
//!
//! Every language-model call the pipeline makes goes through one of these
//! traits. Implementations are injected at construction; nothing in the
//! pipeline reaches for a global client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::ChatMessage;

/// Input to the answer-generation call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Prior conversation, oldest first
    pub history: Vec<ChatMessage>,
    /// The final user turn, carrying the utterance and assembled context
    pub user_prompt: String,
}

/// Classification, summarization and generation
#[async_trait]
pub trait Capability: Send + Sync {
    /// Return the raw model text for a routing decision over `text`
    async fn classify(&self, text: &str) -> Result<String>;

    /// Produce a replacement summary from the previous one and a recent window
    async fn summarize(&self, old_summary: &str, recent: &[ChatMessage]) -> Result<String>;

    /// Produce the user-facing answer
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Structured extraction used by the persistence dispatchers
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Raw JSON object with the nine profile keys, nullable
    async fn extract_profile(&self, text: &str) -> Result<String>;

    /// Raw JSON object of the form `{"facts": [...]}`
    async fn extract_facts(&self, text: &str) -> Result<String>;
}

/// Render messages as `role: content` lines
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
