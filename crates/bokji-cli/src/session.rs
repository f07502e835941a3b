//! In-memory conversation carried between turns

use bokji_pipeline::{CarriedState, ChatMessage, ConversationState, Role};

/// Everything one user's conversation keeps between pipeline runs
pub struct Session {
    user_id: String,
    turn_count: u64,
    carried: CarriedState,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            turn_count: 0,
            carried: CarriedState::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// Turn number for the next utterance
    pub fn next_turn(&mut self) -> u64 {
        self.turn_count += 1;
        self.turn_count
    }

    /// State to hand to the next pipeline run
    pub fn carried(&self) -> CarriedState {
        self.carried.clone()
    }

    pub fn rolling_summary(&self) -> Option<&str> {
        self.carried.rolling_summary.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.carried.messages
    }

    /// Keep the finished state, then log the exchange so the next turn sees it.
    /// The utterance goes ahead of the messages the run appended.
    pub fn record(&mut self, state: ConversationState) {
        let input = state.input_text().to_string();
        let answer = state.answer().map(|a| a.display_text());
        let turn_start = self.carried.messages.len();
        self.carried = state.into_carried();
        let at = turn_start.min(self.carried.messages.len());
        self.carried.messages.insert(at, ChatMessage::user(input));
        if let Some(answer) = answer {
            self.carried.messages.push(ChatMessage::assistant(answer));
        }
    }

    /// Forget the conversation but keep the turn counter monotonic
    pub fn clear(&mut self) {
        self.carried = CarriedState::default();
    }

    /// Counts of log entries by role
    pub fn message_counts(&self) -> (usize, usize, usize) {
        let count = |role: Role| self.messages().iter().filter(|m| m.role == role).count();
        (count(Role::User), count(Role::Assistant), count(Role::Tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bokji_pipeline::{Pipeline, PipelineConfig, Scope, Stores, StubCapability};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_appends_exchange() {
        let stub = Arc::new(
            StubCapability::new()
                .with_decision(Scope::None, Scope::None)
                .with_answer("안녕하세요, 무엇을 도와드릴까요?"),
        );
        let pipeline = Pipeline::new(PipelineConfig::default(), stub.clone(), stub, Stores::default());
        let mut session = Session::new("u1");

        for _ in 0..2 {
            let turn = session.next_turn();
            let state = pipeline
                .run(session.user_id(), "안녕하세요", turn, Some(session.carried()))
                .await
                .unwrap();
            session.record(state);
        }

        assert_eq!(session.turn_count(), 2);
        // Per turn: user, bookkeeping, assistant
        assert_eq!(session.messages().len(), 6);
        assert_eq!(session.message_counts(), (2, 2, 2));
        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Tool, Role::Assistant, Role::User, Role::Tool, Role::Assistant]
        );
        assert_eq!(session.messages()[0].content, "안녕하세요");
        assert_eq!(session.messages()[3].content, "안녕하세요");
    }

    #[test]
    fn test_clear_keeps_turn_count() {
        let mut session = Session::new("u1");
        session.next_turn();
        session.next_turn();
        session.clear();
        assert_eq!(session.turn_count(), 2);
        assert!(session.messages().is_empty());
        assert_eq!(session.next_turn(), 3);
    }
}
