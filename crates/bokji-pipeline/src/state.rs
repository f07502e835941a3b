//! Conversation state threaded through one pipeline invocation.
//!
//! Fields are private. Each stage gets a narrow `pub(crate)` setter so the
//! orchestrator is the only writer and only the compactor can touch the
//! rolling summary or the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collection::Fact;
use crate::dispatch::WriteRecord;
use crate::generation::Answer;
use crate::profile::ProfileContext;
use crate::retrieval::{DocumentSnippet, Retrieval};
use crate::router::Stage;

/// The four-valued scope shared by write targets and retrieval needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Profile,
    Collection,
    Both,
    #[default]
    None,
}

impl Scope {
    /// All values, in schema order
    pub const ALL: [Scope; 4] = [Scope::Profile, Scope::Collection, Scope::Both, Scope::None];

    /// Wire label
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Profile => "PROFILE",
            Scope::Collection => "COLLECTION",
            Scope::Both => "BOTH",
            Scope::None => "NONE",
        }
    }

    /// Parse a wire label, case-insensitively. Unknown labels are rejected.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "PROFILE" => Some(Scope::Profile),
            "COLLECTION" => Some(Scope::Collection),
            "BOTH" => Some(Scope::Both),
            "NONE" => Some(Scope::None),
            _ => None,
        }
    }

    pub fn includes_profile(&self) -> bool {
        matches!(self, Scope::Profile | Scope::Both)
    }

    pub fn includes_collection(&self) -> bool {
        matches!(self, Scope::Collection | Scope::Both)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Which structured store(s) receive writes
    pub target: Scope,
    /// Which sources the answer needs
    #[serde(rename = "required_rag", alias = "required_retrieval")]
    pub required_retrieval: Scope,
    pub reason: String,
}

impl RoutingDecision {
    pub fn new(target: Scope, required_retrieval: Scope, reason: impl Into<String>) -> Self {
        Self {
            target,
            required_retrieval,
            reason: reason.into(),
        }
    }

    /// The no-write, no-retrieval branch
    pub fn none(reason: impl Into<String>) -> Self {
        Self::new(Scope::None, Scope::None, reason)
    }
}

/// Author of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Bookkeeping attached to the compactor's tool message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub summary_updated: bool,
    pub turn_count: u64,
}

/// One entry of the append-only message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            meta: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// The object handed to generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub profile: Option<ProfileContext>,
    pub collection: Option<Vec<Fact>>,
    pub documents: Vec<DocumentSnippet>,
    pub summary: Option<String>,
}

/// Fields the caller persists between turns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarriedState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub rolling_summary: Option<String>,
    #[serde(default)]
    pub retrieval: Option<Retrieval>,
}

/// State for a single invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    user_id: String,
    input_text: String,
    turn_count: u64,
    routing_decision: Option<RoutingDecision>,
    messages: Vec<ChatMessage>,
    rolling_summary: Option<String>,
    retrieval: Retrieval,
    context: Option<AssembledContext>,
    writes: Vec<WriteRecord>,
    answer: Option<Answer>,
    trace: Vec<Stage>,
}

impl ConversationState {
    /// Build a fresh state from the utterance and whatever the caller carried over
    pub fn new(
        user_id: impl Into<String>,
        input_text: impl Into<String>,
        turn_count: u64,
        carried: CarriedState,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            input_text: input_text.into(),
            turn_count,
            routing_decision: None,
            messages: carried.messages,
            rolling_summary: carried.rolling_summary,
            retrieval: carried.retrieval.unwrap_or_default(),
            context: None,
            writes: Vec::new(),
            answer: None,
            trace: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn input_text(&self) -> &str {
        &self.input_text
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn routing_decision(&self) -> Option<&RoutingDecision> {
        self.routing_decision.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn rolling_summary(&self) -> Option<&str> {
        self.rolling_summary.as_deref()
    }

    pub fn retrieval(&self) -> &Retrieval {
        &self.retrieval
    }

    pub fn context(&self) -> Option<&AssembledContext> {
        self.context.as_ref()
    }

    /// Outcomes of the persistence dispatchers, in invocation order
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    pub fn answer(&self) -> Option<&Answer> {
        self.answer.as_ref()
    }

    /// Stages visited by this invocation, in order
    pub fn trace(&self) -> &[Stage] {
        &self.trace
    }

    /// The subset worth keeping for the next turn
    pub fn carry_forward(&self) -> CarriedState {
        CarriedState {
            messages: self.messages.clone(),
            rolling_summary: self.rolling_summary.clone(),
            retrieval: Some(self.retrieval.clone()),
        }
    }

    /// Consume the state, keeping the carried subset
    pub fn into_carried(self) -> CarriedState {
        CarriedState {
            messages: self.messages,
            rolling_summary: self.rolling_summary,
            retrieval: Some(self.retrieval),
        }
    }

    // --- stage-scoped writers ---

    pub(crate) fn enter_stage(&mut self, stage: Stage) {
        self.trace.push(stage);
    }

    /// Classifier: set once per invocation
    pub(crate) fn set_routing_decision(&mut self, decision: RoutingDecision) {
        debug_assert!(self.routing_decision.is_none());
        self.routing_decision = Some(decision);
    }

    /// Dispatchers
    pub(crate) fn record_write(&mut self, record: WriteRecord) {
        self.writes.push(record);
    }

    /// Retrieval assembler
    pub(crate) fn set_retrieval(&mut self, retrieval: Retrieval) {
        self.retrieval = retrieval;
    }

    /// Context compactor: the only writer of the summary, the log and the context
    pub(crate) fn apply_compaction(
        &mut self,
        rolling_summary: Option<String>,
        bookkeeping: ChatMessage,
        context: AssembledContext,
    ) {
        debug_assert!(self.context.is_none());
        self.rolling_summary = rolling_summary;
        self.messages.push(bookkeeping);
        self.context = Some(context);
    }

    /// Generation
    pub(crate) fn set_answer(&mut self, answer: Answer) {
        self.answer = Some(answer);
    }
}
