//! Error types for bokji-pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias using bokji-pipeline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by pipeline stages and their external capabilities
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the chat-completion provider layer
    #[error(transparent)]
    Ai(#[from] bokji_ai::Error),

    /// An external call exceeded its deadline
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },

    /// The invocation was cancelled by the caller
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// Model output was not valid JSON
    #[error("Malformed model output: {0}")]
    Parse(String),

    /// Model output did not match the expected schema
    #[error("Schema validation failed: {0}")]
    Schema(String),

    /// A backing store rejected an operation
    #[error("Store error: {0}")]
    Store(String),

    /// A capability failed for a reason outside the provider layer
    #[error("Capability error: {0}")]
    Capability(String),
}

impl Error {
    /// Short stable label used in fallback reasons and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Ai(e) => e.kind(),
            Error::Timeout { .. } => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Parse(_) => "parse",
            Error::Schema(_) => "schema",
            Error::Store(_) => "store",
            Error::Capability(_) => "capability",
        }
    }
}
