//! Pipeline event types

use serde::{Deserialize, Serialize};

use crate::dispatch::WriteOutcome;
use crate::router::Stage;
use crate::state::RoutingDecision;

/// Events emitted while one utterance runs through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Invocation started
    RunStart { user_id: String, turn_count: u64 },

    /// A stage is about to execute
    StageEntered { stage: Stage },

    /// Classification finished (possibly degraded)
    RoutingDecided { decision: RoutingDecision },

    /// A persistence dispatcher returned
    WriteRecorded {
        writer: String,
        outcome: WriteOutcome,
    },

    /// Retrieval finished
    RetrievalAssembled {
        facts: usize,
        documents: usize,
        degraded: Vec<String>,
    },

    /// The compactor decided on the summary
    CompactionDecided {
        turn_count: u64,
        summary_updated: bool,
    },

    /// Generation produced an answer
    AnswerReady { policies: usize },

    /// Invocation failed
    Error { message: String },
}

impl PipelineEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::AnswerReady { .. } | PipelineEvent::Error { .. }
        )
    }
}
