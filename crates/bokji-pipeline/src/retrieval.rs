//! Retrieval sources: profile context, collection context and policy documents.
//!
//! Which sources are fetched depends only on `required_retrieval`. A source
//! that fails is recorded in `degraded` and the others still run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collection::{CollectionStore, Fact, FactQuery, Predicate};
use crate::eligibility;
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::profile::{ProfileContext, ProfileStore};
use crate::state::Scope;

/// Facts returned for the collection context
pub const COLLECTION_LIMIT: usize = 12;
/// Keywords used for fact lookup
pub const COLLECTION_KEYWORDS: usize = 6;
/// Keywords used for document search
pub const DOCUMENT_KEYWORDS: usize = 8;
/// Document snippets returned
pub const DOCUMENT_TOP_K: usize = 8;
/// Candidates fetched per returned snippet, so eligibility filtering still leaves enough
const CANDIDATE_FACTOR: usize = 3;
/// Share of the BM25 score in the reranked score
pub const BM25_WEIGHT: f64 = 0.35;
const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[가-힣A-Za-z0-9]+").unwrap());

const STOPWORDS: &[&str] = &[
    "그리고", "하지만", "그리고요", "근데", "가능한가요", "신청", "문의", "가능", "여부", "해당",
    "있는", "없는", "있나요", "인가요", "혹시",
];

/// Lowercased tokens of two or more characters, stop-words removed, deduplicated
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.chars().count() >= 2 && !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .take(max)
        .collect()
}

/// Fact query for an utterance: keywords plus the predicates they hint at
pub fn fact_query(text: &str) -> FactQuery {
    let keywords = extract_keywords(text, COLLECTION_KEYWORDS);
    let mut predicates: Vec<Predicate> = Vec::new();
    for kw in &keywords {
        if let Some(p) = Predicate::hint_for_keyword(kw) {
            if !predicates.contains(&p) {
                predicates.push(p);
            }
        }
    }
    FactQuery {
        keywords,
        predicates,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    TOKEN.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

/// Document query terms: utterance keywords, then object and code tokens of known facts
pub fn rerank_terms(keywords: &[String], facts: &[Fact]) -> Vec<String> {
    let mut terms = keywords.to_vec();
    for fact in facts {
        let text = format!("{} {}", fact.object, fact.code.as_deref().unwrap_or_default());
        for token in tokenize(&text) {
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
    }
    terms
}

/// Blend each snippet's index score with its normalized BM25 score over
/// title, requirements and benefits, then sort best first.
pub fn bm25_rerank(snippets: &mut [DocumentSnippet], terms: &[String]) {
    if snippets.is_empty() || terms.is_empty() {
        return;
    }
    let docs: Vec<Vec<String>> = snippets
        .iter()
        .map(|s| tokenize(&format!("{} {} {}", s.title, s.requirements, s.benefits)))
        .collect();
    let n = docs.len() as f64;
    let avgdl = docs.iter().map(|d| d.len().max(1) as f64).sum::<f64>() / n;

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for tokens in &docs {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in terms {
            if unique.contains(term.as_str()) {
                *doc_freq.entry(term.as_str()).or_default() += 1;
            }
        }
    }

    let scores: Vec<f64> = docs
        .iter()
        .map(|tokens| {
            let dl = tokens.len().max(1) as f64;
            terms
                .iter()
                .filter_map(|term| {
                    let df = *doc_freq.get(term.as_str())? as f64;
                    let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                    (tf > 0.0).then(|| {
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl))
                    })
                })
                .sum()
        })
        .collect();
    let max = scores.iter().copied().fold(0.0, f64::max);

    for (snippet, bm25) in snippets.iter_mut().zip(scores) {
        let normalized = if max > 0.0 { bm25 / max } else { 0.0 };
        snippet.score = (1.0 - BM25_WEIGHT) * snippet.score + BM25_WEIGHT * normalized;
    }
    snippets.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
}

/// A policy document in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub benefits: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PolicyDocument {
    fn haystack(&self) -> String {
        format!("{} {} {}", self.title, self.requirements, self.benefits).to_lowercase()
    }

    /// Nationwide documents pass every region filter
    fn in_region(&self, region: &str) -> bool {
        match self.region.as_deref().map(str::trim) {
            None | Some("") | Some("전국") => true,
            Some(r) => r == region,
        }
    }
}

/// A scored search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnippet {
    pub doc_id: String,
    pub title: String,
    pub requirements: String,
    pub benefits: String,
    pub region: Option<String>,
    pub url: Option<String>,
    pub score: f64,
}

impl DocumentSnippet {
    fn from_document(doc: &PolicyDocument, score: f64) -> Self {
        Self {
            doc_id: doc.id.clone(),
            title: doc.title.clone(),
            requirements: doc.requirements.clone(),
            benefits: doc.benefits.clone(),
            region: doc.region.clone(),
            url: doc.url.clone(),
            score,
        }
    }
}

/// Free-text document search
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn search(
        &self,
        keywords: &[String],
        region: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<DocumentSnippet>>;
}

/// Keyword-overlap index held in memory
#[derive(Default)]
pub struct MemoryDocumentIndex {
    docs: RwLock<Vec<PolicyDocument>>,
}

impl MemoryDocumentIndex {
    pub fn new(docs: Vec<PolicyDocument>) -> Self {
        Self {
            docs: RwLock::new(docs),
        }
    }

    /// Load a JSON array of documents
    pub fn from_json(json: &str) -> Result<Self> {
        let docs: Vec<PolicyDocument> =
            serde_json::from_str(json).map_err(|e| Error::Store(format!("document index: {e}")))?;
        Ok(Self::new(docs))
    }

    pub fn add(&self, doc: PolicyDocument) {
        self.docs.write().push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentIndex for MemoryDocumentIndex {
    async fn search(
        &self,
        keywords: &[String],
        region: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<DocumentSnippet>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.docs.read();
        let mut hits: Vec<DocumentSnippet> = docs
            .iter()
            .filter(|d| region.is_none_or(|r| d.in_region(r)))
            .filter_map(|d| {
                let haystack = d.haystack();
                let matched = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
                (matched > 0)
                    .then(|| DocumentSnippet::from_document(d, matched as f64 / keywords.len() as f64))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Sub-results keyed by source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    /// Sources requested for this turn
    pub used: Scope,
    pub profile_ctx: Option<ProfileContext>,
    pub collection_ctx: Option<Vec<Fact>>,
    #[serde(default)]
    pub rag_snippets: Vec<DocumentSnippet>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Sources that failed this turn, as `source: error kind`
    #[serde(default)]
    pub degraded: Vec<String>,
}

/// Fetches the sources named by `required_retrieval`
pub struct RetrievalAssembler {
    profiles: Arc<dyn ProfileStore>,
    collection: Arc<dyn CollectionStore>,
    documents: Arc<dyn DocumentIndex>,
}

impl RetrievalAssembler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        collection: Arc<dyn CollectionStore>,
        documents: Arc<dyn DocumentIndex>,
    ) -> Self {
        Self {
            profiles,
            collection,
            documents,
        }
    }

    /// Build this turn's retrieval, starting from what the caller carried in
    pub async fn assemble(
        &self,
        user_id: &str,
        text: &str,
        required: Scope,
        carried: &Retrieval,
        today: NaiveDate,
        guard: &CallGuard,
    ) -> Retrieval {
        let mut out = Retrieval {
            used: required,
            degraded: Vec::new(),
            ..carried.clone()
        };

        if required.includes_profile() {
            match guard.call("profile_lookup", self.profiles.get(user_id)).await {
                Ok(row) => out.profile_ctx = row.map(|p| ProfileContext::from_record(p, today)),
                Err(e) => {
                    warn!(user_id, error = %e, "profile retrieval failed");
                    out.degraded.push(format!("profile: {}", e.kind()));
                }
            }
        }

        if required.includes_collection() {
            let query = fact_query(text);
            let lookup = self.collection.search(user_id, &query, COLLECTION_LIMIT);
            match guard.call("collection_lookup", lookup).await {
                Ok(facts) => out.collection_ctx = Some(facts),
                Err(e) => {
                    warn!(user_id, error = %e, "collection retrieval failed");
                    out.degraded.push(format!("collection: {}", e.kind()));
                }
            }
        }

        if required != Scope::None {
            let keywords = extract_keywords(text, DOCUMENT_KEYWORDS);
            let terms = rerank_terms(&keywords, out.collection_ctx.as_deref().unwrap_or_default());
            let region = out
                .profile_ctx
                .as_ref()
                .and_then(|p| p.profile.residency.clone());
            let search = self
                .documents
                .search(&terms, region.as_deref(), DOCUMENT_TOP_K * CANDIDATE_FACTOR);
            match guard.call("document_search", search).await {
                Ok(mut snippets) => {
                    if let Some(ctx) = &out.profile_ctx {
                        let before = snippets.len();
                        snippets.retain(|s| eligibility::is_eligible(&ctx.profile, s));
                        if snippets.len() < before {
                            debug!(user_id, dropped = before - snippets.len(), "ineligible documents filtered");
                        }
                    }
                    bm25_rerank(&mut snippets, &terms);
                    snippets.truncate(DOCUMENT_TOP_K);
                    out.rag_snippets = snippets;
                }
                Err(e) => {
                    warn!(user_id, error = %e, "document search failed");
                    out.degraded.push(format!("documents: {}", e.kind()));
                }
            }
            out.keywords = keywords;
        }

        debug!(
            user_id,
            used = %required,
            profile = out.profile_ctx.is_some(),
            facts = out.collection_ctx.as_ref().map_or(0, Vec::len),
            documents = out.rag_snippets.len(),
            "retrieval assembled"
        );
        out
    }
}
