//! Persistence dispatcher contract.
//!
//! Writers never return errors to the orchestrator. Every failure is folded
//! into a [`WriteOutcome`] and recorded on the state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::guard::CallGuard;
use crate::state::RoutingDecision;

/// Result of one dispatcher call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Everything extracted was written
    Committed { applied: Vec<String> },
    /// Some values were written, others rejected
    Partial {
        applied: Vec<String>,
        rejected: Vec<String>,
    },
    /// Nothing to write
    Skipped,
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WriteOutcome::Partial { .. } | WriteOutcome::Failed { .. })
    }
}

/// Outcome tagged with the writer that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub writer: String,
    pub outcome: WriteOutcome,
}

/// A persistence dispatcher
#[async_trait]
pub trait Writer: Send + Sync {
    /// Short name used in records and logs
    fn name(&self) -> &'static str;

    async fn write(
        &self,
        user_id: &str,
        decision: &RoutingDecision,
        text: &str,
        guard: &CallGuard,
    ) -> WriteOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let outcome = WriteOutcome::Failed {
            reason: "timeout".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "timeout");
        assert!(outcome.is_degraded());
        assert!(!WriteOutcome::Skipped.is_degraded());
    }
}
