//! Flow orchestrator
//!
//! Runs one utterance through the stage graph to completion. Stages execute
//! strictly in sequence; each external call is bounded by the invocation's
//! [`CallGuard`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{Capability, Extractor};
use crate::classifier::Classifier;
use crate::collection::{CollectionStore, CollectionWriter, MemoryCollectionStore};
use crate::compaction::{CompactionConfig, ContextCompactor};
use crate::dispatch::{WriteRecord, Writer};
use crate::error::{Error, Result};
use crate::events::PipelineEvent;
use crate::generation::Generator;
use crate::guard::{CallGuard, DEFAULT_CALL_TIMEOUT};
use crate::profile::{MemoryProfileStore, ProfileStore, ProfileWriter};
use crate::retrieval::{DocumentIndex, MemoryDocumentIndex, RetrievalAssembler};
use crate::router::{Stage, next_stage};
use crate::state::{CarriedState, ConversationState, Scope};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub compaction: CompactionConfig,
    /// Deadline for each external call
    pub call_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compaction: CompactionConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Backing stores shared by the writers and the retrieval assembler
#[derive(Clone)]
pub struct Stores {
    pub profiles: Arc<dyn ProfileStore>,
    pub collection: Arc<dyn CollectionStore>,
    pub documents: Arc<dyn DocumentIndex>,
}

impl Default for Stores {
    fn default() -> Self {
        Self {
            profiles: Arc::new(MemoryProfileStore::new()),
            collection: Arc::new(MemoryCollectionStore::new()),
            documents: Arc::new(MemoryDocumentIndex::new(Vec::new())),
        }
    }
}

/// The routing and state-accumulation pipeline
pub struct Pipeline {
    classifier: Classifier,
    profile_writer: Arc<dyn Writer>,
    collection_writer: Arc<dyn Writer>,
    assembler: RetrievalAssembler,
    compactor: ContextCompactor,
    generator: Generator,
    call_timeout: Duration,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        capability: Arc<dyn Capability>,
        extractor: Arc<dyn Extractor>,
        stores: Stores,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            classifier: Classifier::new(capability.clone()),
            profile_writer: Arc::new(ProfileWriter::new(
                extractor.clone(),
                stores.profiles.clone(),
            )),
            collection_writer: Arc::new(CollectionWriter::new(
                extractor,
                stores.collection.clone(),
            )),
            assembler: RetrievalAssembler::new(stores.profiles, stores.collection, stores.documents),
            compactor: ContextCompactor::new(capability.clone(), config.compaction),
            generator: Generator::new(capability),
            call_timeout: config.call_timeout,
            event_tx,
        }
    }

    /// Replace the persistence dispatchers
    pub fn with_writers(mut self, profile: Arc<dyn Writer>, collection: Arc<dyn Writer>) -> Self {
        self.profile_writer = profile;
        self.collection_writer = collection;
        self
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn compaction_config(&self) -> &CompactionConfig {
        self.compactor.config()
    }

    /// Run one utterance to completion
    pub async fn run(
        &self,
        user_id: &str,
        input_text: &str,
        turn_count: u64,
        carried: Option<CarriedState>,
    ) -> Result<ConversationState> {
        self.run_with_cancel(user_id, input_text, turn_count, carried, CancellationToken::new())
            .await
    }

    /// Run one utterance, aborting at the next suspension point once `cancel` fires
    pub async fn run_with_cancel(
        &self,
        user_id: &str,
        input_text: &str,
        turn_count: u64,
        carried: Option<CarriedState>,
        cancel: CancellationToken,
    ) -> Result<ConversationState> {
        let guard = CallGuard::new(self.call_timeout, cancel);
        let mut state =
            ConversationState::new(user_id, input_text, turn_count, carried.unwrap_or_default());
        let today = Utc::now().date_naive();

        let _ = self.event_tx.send(PipelineEvent::RunStart {
            user_id: user_id.to_string(),
            turn_count,
        });
        info!(user_id, turn_count, "pipeline run started");

        let mut stage = Stage::INITIAL;
        loop {
            if guard.is_cancelled() {
                let _ = self.event_tx.send(PipelineEvent::Error {
                    message: format!("cancelled before {stage}"),
                });
                return Err(Error::Cancelled(stage.as_str()));
            }

            debug!(%stage, "entering stage");
            state.enter_stage(stage);
            let _ = self.event_tx.send(PipelineEvent::StageEntered { stage });

            if let Err(e) = self.execute(stage, &mut state, today, &guard).await {
                warn!(%stage, error = %e, "pipeline run failed");
                let _ = self.event_tx.send(PipelineEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }

            let target = state
                .routing_decision()
                .map_or(Scope::None, |d| d.target);
            match next_stage(stage, target) {
                Some(next) => stage = next,
                None => break,
            }
        }

        Ok(state)
    }

    async fn execute(
        &self,
        stage: Stage,
        state: &mut ConversationState,
        today: NaiveDate,
        guard: &CallGuard,
    ) -> Result<()> {
        match stage {
            Stage::Classifier => {
                let decision = self.classifier.classify(state.input_text(), guard).await;
                let _ = self.event_tx.send(PipelineEvent::RoutingDecided {
                    decision: decision.clone(),
                });
                state.set_routing_decision(decision);
            }
            Stage::ProfileWriter => self.dispatch(&*self.profile_writer, state, guard).await,
            Stage::CollectionWriter => self.dispatch(&*self.collection_writer, state, guard).await,
            Stage::RetrievalAssembler => {
                let required = state
                    .routing_decision()
                    .map_or(Scope::None, |d| d.required_retrieval);
                let retrieval = self
                    .assembler
                    .assemble(
                        state.user_id(),
                        state.input_text(),
                        required,
                        state.retrieval(),
                        today,
                        guard,
                    )
                    .await;
                let _ = self.event_tx.send(PipelineEvent::RetrievalAssembled {
                    facts: retrieval.collection_ctx.as_ref().map_or(0, Vec::len),
                    documents: retrieval.rag_snippets.len(),
                    degraded: retrieval.degraded.clone(),
                });
                state.set_retrieval(retrieval);

                let compaction = self
                    .compactor
                    .compact(
                        state.messages(),
                        state.rolling_summary(),
                        state.turn_count(),
                        state.retrieval(),
                        guard,
                    )
                    .await;
                let _ = self.event_tx.send(PipelineEvent::CompactionDecided {
                    turn_count: state.turn_count(),
                    summary_updated: compaction.summary_updated,
                });
                state.apply_compaction(
                    compaction.rolling_summary,
                    compaction.bookkeeping,
                    compaction.context,
                );
            }
            Stage::Generation => {
                let context = state.context().cloned().unwrap_or_default();
                let answer = self
                    .generator
                    .generate(state.input_text(), state.messages(), &context, guard)
                    .await?;
                let _ = self.event_tx.send(PipelineEvent::AnswerReady {
                    policies: answer.policies.len(),
                });
                state.set_answer(answer);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, writer: &dyn Writer, state: &mut ConversationState, guard: &CallGuard) {
        let Some(decision) = state.routing_decision().cloned() else {
            return;
        };
        let outcome = writer
            .write(state.user_id(), &decision, state.input_text(), guard)
            .await;
        if outcome.is_degraded() {
            warn!(writer = writer.name(), ?outcome, "write degraded");
        }
        let _ = self.event_tx.send(PipelineEvent::WriteRecorded {
            writer: writer.name().to_string(),
            outcome: outcome.clone(),
        });
        state.record_write(WriteRecord {
            writer: writer.name().to_string(),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubCapability;

    fn pipeline(stub: Arc<StubCapability>) -> Pipeline {
        Pipeline::new(PipelineConfig::default(), stub.clone(), stub, Stores::default())
    }

    #[tokio::test]
    async fn test_trace_follows_plan() {
        let stub = Arc::new(
            StubCapability::new()
                .with_decision(Scope::Both, Scope::None)
                .with_profile_extraction("{}")
                .with_fact_extraction(r#"{"facts": []}"#),
        );
        let state = pipeline(stub).run("u1", "정보", 1, None).await.unwrap();
        assert_eq!(state.trace(), crate::router::plan(Scope::Both).as_slice());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let stub = Arc::new(StubCapability::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline(stub.clone())
            .run_with_cancel("u1", "안녕", 1, None, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled("classifier")));
        assert!(stub.calls().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let stub = Arc::new(StubCapability::new().with_decision(Scope::None, Scope::None));
        let pipeline = pipeline(stub);
        let mut rx = pipeline.subscribe();
        pipeline.run("u1", "안녕하세요", 1, None).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(PipelineEvent::RunStart { .. })));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::CompactionDecided { .. })));
        assert!(events.last().is_some_and(PipelineEvent::is_terminal));
    }
}
