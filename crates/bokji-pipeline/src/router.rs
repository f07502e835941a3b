//! Stage transition table.
//!
//! The flow graph is a fixed table from `(current stage, target)` to the next
//! stage. `BOTH` reaches the collection writer only through the profile
//! writer, which fixes the write order.

use serde::{Deserialize, Serialize};

use crate::state::{RoutingDecision, Scope};

/// A node of the flow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classifier,
    ProfileWriter,
    CollectionWriter,
    /// Retrieval followed by context compaction
    RetrievalAssembler,
    Generation,
}

impl Stage {
    pub const INITIAL: Stage = Stage::Classifier;

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classifier => "classifier",
            Stage::ProfileWriter => "profile_writer",
            Stage::CollectionWriter => "collection_writer",
            Stage::RetrievalAssembler => "retrieval_assembler",
            Stage::Generation => "generation",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Generation)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next stage after `current` given the routing target. `None` once terminal.
pub fn next_stage(current: Stage, target: Scope) -> Option<Stage> {
    let next = match (current, target) {
        (Stage::Classifier, Scope::Profile) => Stage::ProfileWriter,
        (Stage::Classifier, Scope::Collection) => Stage::CollectionWriter,
        (Stage::Classifier, Scope::Both) => Stage::ProfileWriter,
        (Stage::Classifier, Scope::None) => Stage::RetrievalAssembler,

        (Stage::ProfileWriter, Scope::Both) => Stage::CollectionWriter,
        (Stage::ProfileWriter, _) => Stage::RetrievalAssembler,

        (Stage::CollectionWriter, _) => Stage::RetrievalAssembler,

        (Stage::RetrievalAssembler, _) => Stage::Generation,

        (Stage::Generation, _) => return None,
    };
    Some(next)
}

/// Branch taken right after classification. A missing decision routes as `NONE`.
pub fn route(decision: Option<&RoutingDecision>) -> Stage {
    let target = decision.map(|d| d.target).unwrap_or_default();
    next_stage(Stage::Classifier, target).unwrap_or(Stage::RetrievalAssembler)
}

/// Full path through the graph for a target, starting at the classifier
pub fn plan(target: Scope) -> Vec<Stage> {
    let mut path = vec![Stage::INITIAL];
    let mut current = Stage::INITIAL;
    while let Some(next) = next_stage(current, target) {
        path.push(next);
        current = next;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STAGES: [Stage; 5] = [
        Stage::Classifier,
        Stage::ProfileWriter,
        Stage::CollectionWriter,
        Stage::RetrievalAssembler,
        Stage::Generation,
    ];

    #[test]
    fn test_transition_table_is_exhaustive() {
        use Stage::*;
        let expected = [
            (Classifier, Scope::Profile, Some(ProfileWriter)),
            (Classifier, Scope::Collection, Some(CollectionWriter)),
            (Classifier, Scope::Both, Some(ProfileWriter)),
            (Classifier, Scope::None, Some(RetrievalAssembler)),
            (ProfileWriter, Scope::Profile, Some(RetrievalAssembler)),
            (ProfileWriter, Scope::Collection, Some(RetrievalAssembler)),
            (ProfileWriter, Scope::Both, Some(CollectionWriter)),
            (ProfileWriter, Scope::None, Some(RetrievalAssembler)),
            (CollectionWriter, Scope::Profile, Some(RetrievalAssembler)),
            (CollectionWriter, Scope::Collection, Some(RetrievalAssembler)),
            (CollectionWriter, Scope::Both, Some(RetrievalAssembler)),
            (CollectionWriter, Scope::None, Some(RetrievalAssembler)),
            (RetrievalAssembler, Scope::Profile, Some(Generation)),
            (RetrievalAssembler, Scope::Collection, Some(Generation)),
            (RetrievalAssembler, Scope::Both, Some(Generation)),
            (RetrievalAssembler, Scope::None, Some(Generation)),
            (Generation, Scope::Profile, None),
            (Generation, Scope::Collection, None),
            (Generation, Scope::Both, None),
            (Generation, Scope::None, None),
        ];
        assert_eq!(expected.len(), ALL_STAGES.len() * Scope::ALL.len());
        for (stage, target, next) in expected {
            assert_eq!(next_stage(stage, target), next, "{stage} / {target}");
        }
    }

    #[test]
    fn test_plans() {
        use Stage::*;
        assert_eq!(
            plan(Scope::Both),
            vec![Classifier, ProfileWriter, CollectionWriter, RetrievalAssembler, Generation]
        );
        assert_eq!(
            plan(Scope::Profile),
            vec![Classifier, ProfileWriter, RetrievalAssembler, Generation]
        );
        assert_eq!(
            plan(Scope::Collection),
            vec![Classifier, CollectionWriter, RetrievalAssembler, Generation]
        );
        assert_eq!(plan(Scope::None), vec![Classifier, RetrievalAssembler, Generation]);
    }

    #[test]
    fn test_every_plan_ends_in_generation() {
        for target in Scope::ALL {
            let path = plan(target);
            assert_eq!(path.last(), Some(&Stage::Generation));
            assert!(path.last().unwrap().is_terminal());
        }
    }

    #[test]
    fn test_route_without_decision_falls_back() {
        assert_eq!(route(None), Stage::RetrievalAssembler);
        let decision = RoutingDecision::new(Scope::Collection, Scope::None, "진단명");
        assert_eq!(route(Some(&decision)), Stage::CollectionWriter);
    }
}
