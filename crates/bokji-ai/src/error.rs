//! Error types for bokji-ai

use thiserror::Error;

/// Result type alias using bokji-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a chat-completion endpoint
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status to a typed error
    pub fn from_status(status: u16, retry_after: Option<u64>, body: &str) -> Self {
        match status {
            401 | 403 => Error::InvalidApiKey,
            429 => Error::RateLimited { retry_after },
            500..=599 => Error::api("server_error", format!("HTTP {status}: {body}")),
            _ => Error::api(format!("http_{status}"), body),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("server_error")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Short stable label for logs and fallback reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Http(_) | Error::Sse(_) => "transport",
            Error::Json(_) | Error::UnexpectedResponse(_) => "response",
            Error::Api { .. } => "api",
            Error::RateLimited { .. } => "rate_limited",
            Error::InvalidApiKey | Error::InvalidConfig(_) => "config",
            Error::Aborted => "aborted",
        }
    }
}
