//! Core types for chat-completion requests

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier (e.g., "gpt-4o-mini")
    pub id: String,
    /// Base URL of an OpenAI-compatible endpoint
    pub base_url: String,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Additional headers for API calls
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Model {
    /// Default OpenAI endpoint
    pub const OPENAI_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Create a model served from the public OpenAI endpoint
    pub fn openai(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: Self::OPENAI_BASE_URL.to_string(),
            max_tokens: 4096,
            headers: HashMap::new(),
        }
    }

    /// Override the base URL (Ollama, Groq, OpenRouter, proxies)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::openai("gpt-4o-mini")
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Content filter triggered
    ContentFilter,
}

/// A chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// User message
    User {
        content: String,
        #[serde(default)]
        timestamp: i64,
    },
    /// Assistant response
    Assistant {
        content: String,
        #[serde(flatten)]
        metadata: AssistantMetadata,
    },
}

/// Metadata for assistant messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMetadata {
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an assistant message without metadata
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: text.into(),
            metadata: AssistantMetadata {
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    /// Get the text content
    pub fn text(&self) -> &str {
        match self {
            Self::User { content, .. } => content,
            Self::Assistant { content, .. } => content,
        }
    }
}

/// Context for a chat request
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Conversation messages
    pub messages: Vec<Message>,
}

impl Context {
    /// Create a new context with a system prompt
    pub fn with_system(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            messages: vec![],
        }
    }

    /// Add a message to the context
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Options for a single request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Maximum tokens to generate (falls back to the model limit)
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Ask the endpoint to return a single JSON object
    pub json_mode: bool,
}

impl RequestOptions {
    /// Deterministic JSON output, used for classification and extraction
    pub fn json() -> Self {
        Self {
            max_tokens: None,
            temperature: Some(0.0),
            json_mode: true,
        }
    }

    /// Free-text output at the given temperature
    pub fn text(temperature: f32) -> Self {
        Self {
            max_tokens: None,
            temperature: Some(temperature),
            json_mode: false,
        }
    }
}
