//! Rolling-summary compaction
//!
//! The summary is recomputed on a fixed turn cadence from the previous
//! summary and a short window of recent messages. Every invocation appends
//! exactly one bookkeeping message recording whether the recompute fired.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::retrieval::Retrieval;
use crate::state::{AssembledContext, ChatMessage, MessageMeta, Role};

/// Content of the bookkeeping message
pub const BOOKKEEPING_MARKER: &str = "[context_compactor] prompt_ready";

/// Configuration for context compaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Recompute the summary when `turn_count` is a multiple of this
    pub cadence: u64,
    /// Number of most recent messages handed to the summarizer
    pub window: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            cadence: 15,
            window: 8,
        }
    }
}

impl CompactionConfig {
    pub fn should_update(&self, turn_count: u64) -> bool {
        self.cadence != 0 && turn_count % self.cadence == 0
    }
}

/// Result of a compaction step
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Summary after this step, new or carried
    pub rolling_summary: Option<String>,
    pub summary_updated: bool,
    /// The single message to append to the log
    pub bookkeeping: ChatMessage,
    pub context: AssembledContext,
}

// --- Window selection ---

/// The last `window` messages, or all of them if the log is shorter
pub fn recent_window(messages: &[ChatMessage], window: usize) -> &[ChatMessage] {
    &messages[messages.len().saturating_sub(window)..]
}

// --- Compactor ---

pub struct ContextCompactor {
    capability: Arc<dyn Capability>,
    config: CompactionConfig,
}

impl ContextCompactor {
    pub fn new(capability: Arc<dyn Capability>, config: CompactionConfig) -> Self {
        Self { capability, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Decide on the summary, build the bookkeeping entry and assemble the context.
    /// Summarization failures keep the previous summary.
    pub async fn compact(
        &self,
        messages: &[ChatMessage],
        previous: Option<&str>,
        turn_count: u64,
        retrieval: &Retrieval,
        guard: &CallGuard,
    ) -> CompactionResult {
        let mut rolling_summary = previous.map(String::from);
        let mut summary_updated = false;

        if self.config.should_update(turn_count) {
            let recent = recent_window(messages, self.config.window);
            match self.summarize(previous.unwrap_or_default(), recent, guard).await {
                Ok(summary) => {
                    info!(turn_count, window = recent.len(), "rolling summary updated");
                    rolling_summary = Some(summary);
                    summary_updated = true;
                }
                Err(e) => {
                    warn!(turn_count, error = %e, "summarization failed, keeping previous summary");
                }
            }
        } else {
            debug!(turn_count, "summary carried forward");
        }

        let bookkeeping = ChatMessage::new(Role::Tool, BOOKKEEPING_MARKER).with_meta(MessageMeta {
            summary_updated,
            turn_count,
        });

        let context = AssembledContext {
            profile: retrieval.profile_ctx.clone(),
            collection: retrieval.collection_ctx.clone(),
            documents: retrieval.rag_snippets.clone(),
            summary: rolling_summary.clone(),
        };

        CompactionResult {
            rolling_summary,
            summary_updated,
            bookkeeping,
            context,
        }
    }

    async fn summarize(
        &self,
        old_summary: &str,
        recent: &[ChatMessage],
        guard: &CallGuard,
    ) -> Result<String> {
        let summary = guard
            .call("summarize", self.capability.summarize(old_summary, recent))
            .await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(Error::Capability("summarizer returned empty text".into()));
        }
        Ok(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubCapability;

    fn log(n: usize) -> Vec<ChatMessage> {
        (0..n).map(|i| ChatMessage::user(format!("메시지 {i}"))).collect()
    }

    #[test]
    fn test_should_update_cadence() {
        let config = CompactionConfig::default();
        assert!(config.should_update(15));
        assert!(config.should_update(30));
        assert!(config.should_update(0));
        assert!(!config.should_update(14));
        assert!(!config.should_update(16));

        let disabled = CompactionConfig {
            cadence: 0,
            window: 8,
        };
        assert!(!disabled.should_update(15));
    }

    #[test]
    fn test_recent_window() {
        let messages = log(10);
        let window = recent_window(&messages, 8);
        assert_eq!(window.len(), 8);
        assert_eq!(window[0].content, "메시지 2");
        assert_eq!(recent_window(&messages[..3], 8).len(), 3);
        assert!(recent_window(&[], 8).is_empty());
    }

    #[tokio::test]
    async fn test_compact_on_cadence_replaces_summary() {
        let stub = Arc::new(StubCapability::new().with_summary("new summary"));
        let compactor = ContextCompactor::new(stub.clone(), CompactionConfig::default());
        let messages = log(12);

        let result = compactor
            .compact(&messages, Some("prev summary"), 30, &Retrieval::default(), &CallGuard::default())
            .await;

        assert_eq!(result.rolling_summary.as_deref(), Some("new summary"));
        assert!(result.summary_updated);
        assert_eq!(result.context.summary.as_deref(), Some("new summary"));

        let calls = stub.summarize_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "prev summary");
        assert_eq!(calls[0].1, messages[4..].to_vec());
    }

    #[tokio::test]
    async fn test_compact_off_cadence_passes_through() {
        let stub = Arc::new(StubCapability::new());
        let compactor = ContextCompactor::new(stub.clone(), CompactionConfig::default());

        let result = compactor
            .compact(&log(1), Some("existing summary"), 14, &Retrieval::default(), &CallGuard::default())
            .await;

        assert_eq!(result.rolling_summary.as_deref(), Some("existing summary"));
        assert!(!result.summary_updated);
        assert!(stub.summarize_calls().is_empty());
        let meta = result.bookkeeping.meta.unwrap();
        assert!(!meta.summary_updated);
        assert_eq!(meta.turn_count, 14);
        assert_eq!(result.bookkeeping.role, Role::Tool);
        assert_eq!(result.bookkeeping.content, BOOKKEEPING_MARKER);
    }

    #[tokio::test]
    async fn test_compact_failure_keeps_previous() {
        let stub = Arc::new(StubCapability::new().failing_summary());
        let compactor = ContextCompactor::new(stub.clone(), CompactionConfig::default());

        let result = compactor
            .compact(&log(3), Some("prev summary"), 15, &Retrieval::default(), &CallGuard::default())
            .await;

        assert_eq!(result.rolling_summary.as_deref(), Some("prev summary"));
        assert!(!result.summary_updated);
        assert_eq!(stub.summarize_calls().len(), 1);
        assert_eq!(result.context.summary.as_deref(), Some("prev summary"));
    }

    #[tokio::test]
    async fn test_compact_empty_summary_counts_as_failure() {
        let stub = Arc::new(StubCapability::new().with_summary("   "));
        let compactor = ContextCompactor::new(stub, CompactionConfig::default());

        let result = compactor
            .compact(&log(3), None, 15, &Retrieval::default(), &CallGuard::default())
            .await;
        assert_eq!(result.rolling_summary, None);
        assert!(!result.summary_updated);
    }

    #[tokio::test]
    async fn test_first_summary_uses_empty_previous() {
        let stub = Arc::new(StubCapability::new().with_summary("first"));
        let compactor = ContextCompactor::new(stub.clone(), CompactionConfig::default());

        compactor
            .compact(&log(2), None, 15, &Retrieval::default(), &CallGuard::default())
            .await;
        assert_eq!(stub.summarize_calls()[0].0, "");
    }
}
