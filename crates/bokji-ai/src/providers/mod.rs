//! Chat-completion provider implementations

pub mod openai;

use crate::{Context, Error, MessageEventStream, Model, RequestOptions, Result};
use async_trait::async_trait;

/// Trait for chat-completion providers
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream a response from the model
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<MessageEventStream>;

    /// Run a request to completion and return the response text
    async fn complete(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<String> {
        let stream = self.stream(model, context, options).await?;
        crate::stream::collect_text(stream).await
    }
}

/// Get an API key from the provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}
