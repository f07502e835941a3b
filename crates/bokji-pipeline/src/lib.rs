//! bokji-pipeline: utterance routing and context assembly
//!
//! Each user utterance is classified, routed to the profile and collection
//! writers, turned into a retrieval result, folded into a periodically
//! compacted rolling summary and finally answered.

pub mod capability;
pub mod classifier;
pub mod collection;
pub mod compaction;
pub mod dispatch;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod generation;
pub mod guard;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod profile;
pub mod retrieval;
pub mod router;
pub mod state;
pub mod stub;

pub use capability::{Capability, Extractor, GenerationRequest};
pub use classifier::Classifier;
pub use collection::{CollectionStore, Fact, MemoryCollectionStore};
pub use compaction::{CompactionConfig, CompactionResult, ContextCompactor};
pub use dispatch::{WriteOutcome, WriteRecord, Writer};
pub use error::{Error, Result};
pub use events::PipelineEvent;
pub use generation::{Answer, PolicyCard};
pub use guard::CallGuard;
pub use llm::{LlmCapability, RetryConfig};
pub use pipeline::{Pipeline, PipelineConfig, Stores};
pub use profile::{MemoryProfileStore, ProfileRecord, ProfileStore};
pub use retrieval::{DocumentIndex, MemoryDocumentIndex, PolicyDocument, Retrieval};
pub use router::Stage;
pub use state::{CarriedState, ChatMessage, ConversationState, Role, RoutingDecision, Scope};
pub use stub::StubCapability;
