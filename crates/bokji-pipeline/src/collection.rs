//! Narrative facts (subject, predicate, object) with a controlled predicate set.
//!
//! Facts are append-only. The same statement made twice is stored twice.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::capability::Extractor;
use crate::dispatch::{WriteOutcome, Writer};
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::state::RoutingDecision;

/// Confidence assigned when the extractor gives none
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

static DIAGNOSIS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\d{2}(\.\d+)?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Predicate {
    HasCondition,
    HasChronicDisease,
    HasDisability,
    UnderTreatment,
    #[serde(alias = "HAS_SANJEONGTEUKRYE")]
    HasRareDiseaseExemption,
    PregnancyStatus,
    HasInfertility,
    FinancialShock,
    HasDocument,
    EligibilityHint,
    Temporality,
    Denies,
}

impl Predicate {
    pub const ALL: [Predicate; 12] = [
        Predicate::HasCondition,
        Predicate::HasChronicDisease,
        Predicate::HasDisability,
        Predicate::UnderTreatment,
        Predicate::HasRareDiseaseExemption,
        Predicate::PregnancyStatus,
        Predicate::HasInfertility,
        Predicate::FinancialShock,
        Predicate::HasDocument,
        Predicate::EligibilityHint,
        Predicate::Temporality,
        Predicate::Denies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::HasCondition => "HAS_CONDITION",
            Predicate::HasChronicDisease => "HAS_CHRONIC_DISEASE",
            Predicate::HasDisability => "HAS_DISABILITY",
            Predicate::UnderTreatment => "UNDER_TREATMENT",
            Predicate::HasRareDiseaseExemption => "HAS_RARE_DISEASE_EXEMPTION",
            Predicate::PregnancyStatus => "PREGNANCY_STATUS",
            Predicate::HasInfertility => "HAS_INFERTILITY",
            Predicate::FinancialShock => "FINANCIAL_SHOCK",
            Predicate::HasDocument => "HAS_DOCUMENT",
            Predicate::EligibilityHint => "ELIGIBILITY_HINT",
            Predicate::Temporality => "TEMPORALITY",
            Predicate::Denies => "DENIES",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_uppercase();
        if label == "HAS_SANJEONGTEUKRYE" {
            return Some(Predicate::HasRareDiseaseExemption);
        }
        Self::ALL.into_iter().find(|p| p.as_str() == label)
    }

    /// Predicate suggested by a query keyword, if any
    pub fn hint_for_keyword(keyword: &str) -> Option<Self> {
        let hint = match keyword {
            "암" | "유방암" => Predicate::HasCondition,
            "치료" | "항암" | "투석" => Predicate::UnderTreatment,
            "산정특례" => Predicate::HasRareDiseaseExemption,
            "임신" => Predicate::PregnancyStatus,
            "난임" => Predicate::HasInfertility,
            "문서" | "영수증" | "증빙" => Predicate::HasDocument,
            "재난" | "실직" => Predicate::FinancialShock,
            _ if DIAGNOSIS_CODE.is_match(&keyword.to_uppercase()) => Predicate::HasCondition,
            _ => return None,
        };
        Some(hint)
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeSystem {
    #[serde(rename = "KCD10")]
    Kcd10,
    #[serde(rename = "SNOMED")]
    Snomed,
    #[serde(rename = "HIRA")]
    Hira,
    #[serde(rename = "ATC")]
    Atc,
    #[serde(rename = "ICD10")]
    Icd10,
    #[serde(rename = "NONE")]
    None,
}

impl CodeSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeSystem::Kcd10 => "KCD10",
            CodeSystem::Snomed => "SNOMED",
            CodeSystem::Hira => "HIRA",
            CodeSystem::Atc => "ATC",
            CodeSystem::Icd10 => "ICD10",
            CodeSystem::None => "NONE",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "KCD10" => Some(CodeSystem::Kcd10),
            "SNOMED" => Some(CodeSystem::Snomed),
            "HIRA" => Some(CodeSystem::Hira),
            "ATC" => Some(CodeSystem::Atc),
            "ICD10" => Some(CodeSystem::Icd10),
            "NONE" => Some(CodeSystem::None),
            _ => None,
        }
    }
}

/// One stored fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub predicate: Predicate,
    pub object: String,
    pub code_system: Option<CodeSystem>,
    pub code: Option<String>,
    /// `YYYY-MM-DD` or `YYYY-MM`
    pub onset_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub negation: bool,
    pub confidence: f64,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// Compact prompt line, e.g. `HAS_CONDITION 유방암 (KCD10 C50.9, 2025-06~)`
    pub fn line(&self) -> String {
        let mut line = format!("{} {}", self.predicate, self.object);
        let mut details = Vec::new();
        if let Some(code) = &self.code {
            match self.code_system {
                Some(cs) if cs != CodeSystem::None => {
                    details.push(format!("{} {code}", cs.as_str()));
                }
                _ => details.push(code.clone()),
            }
        }
        match (&self.onset_date, &self.end_date) {
            (Some(start), Some(end)) => details.push(format!("{start}~{end}")),
            (Some(start), None) => details.push(format!("{start}~")),
            (None, Some(end)) => details.push(format!("~{end}")),
            (None, None) => {}
        }
        if !details.is_empty() {
            line.push_str(&format!(" ({})", details.join(", ")));
        }
        if self.negation {
            line.push_str(" [부정]");
        }
        line
    }
}

/// Extractor output for one fact, before validation
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFact {
    subject: Option<String>,
    predicate: Option<String>,
    object: Option<String>,
    code_system: Option<String>,
    code: Option<String>,
    onset_date: Option<String>,
    end_date: Option<String>,
    negation: Option<bool>,
    confidence: Option<f64>,
    source_id: Option<String>,
}

/// Accept `YYYY-MM-DD` or `YYYY-MM`, zero-padding month and day. Anything else is dropped.
pub fn normalize_fact_date(raw: Option<&str>) -> Option<String> {
    let s = raw.map(str::trim).filter(|s| !s.is_empty())?;
    let parts: Vec<&str> = s.split('-').collect();
    let number = |p: &str| -> Option<u32> {
        (!p.is_empty() && p.len() <= 2 && p.bytes().all(|b| b.is_ascii_digit()))
            .then(|| p.parse().ok())
            .flatten()
    };
    let year: i32 = match parts.first() {
        Some(y) if y.len() == 4 && y.bytes().all(|b| b.is_ascii_digit()) => y.parse().ok()?,
        _ => return None,
    };
    match parts[1..] {
        [month] => {
            let month = number(month)?;
            NaiveDate::from_ymd_opt(year, month, 1).map(|d| d.format("%Y-%m").to_string())
        }
        [month, day] => {
            NaiveDate::from_ymd_opt(year, number(month)?, number(day)?).map(|d| d.format("%Y-%m-%d").to_string())
        }
        _ => None,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Validate one extracted item into a fact for `user_id`
pub fn validate_fact(user_id: &str, item: &Value) -> std::result::Result<Fact, String> {
    let raw: RawFact = serde_json::from_value(item.clone()).map_err(|e| format!("malformed fact: {e}"))?;

    let predicate_label = non_empty(raw.predicate).ok_or("missing predicate")?;
    let predicate = Predicate::parse(&predicate_label)
        .ok_or_else(|| format!("unknown predicate {predicate_label:?}"))?;
    let object = non_empty(raw.object).ok_or("missing object")?;

    let code_system = match non_empty(raw.code_system) {
        None => None,
        Some(label) => Some(
            CodeSystem::parse(&label).ok_or_else(|| format!("unknown code system {label:?}"))?,
        ),
    };

    Ok(Fact {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        subject: non_empty(raw.subject).unwrap_or_else(|| "user".to_string()),
        predicate,
        object,
        code_system,
        code: non_empty(raw.code),
        onset_date: normalize_fact_date(raw.onset_date.as_deref()),
        end_date: normalize_fact_date(raw.end_date.as_deref()),
        negation: raw.negation.unwrap_or(false),
        confidence: raw.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
        source_id: non_empty(raw.source_id),
        created_at: Utc::now(),
    })
}

/// Keyword and predicate filter for fact lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactQuery {
    pub keywords: Vec<String>,
    pub predicates: Vec<Predicate>,
}

impl FactQuery {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.predicates.is_empty()
    }

    pub fn matches(&self, fact: &Fact) -> bool {
        if self.predicates.contains(&fact.predicate) {
            return true;
        }
        let object = fact.object.to_lowercase();
        let code = fact.code.as_deref().unwrap_or_default().to_lowercase();
        self.keywords
            .iter()
            .map(|k| k.to_lowercase())
            .any(|k| object.contains(&k) || code.contains(&k))
    }
}

/// Append-only fact storage
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn append(&self, facts: Vec<Fact>) -> Result<()>;

    /// Matching facts for a user, newest first. An empty query returns the most recent.
    async fn search(&self, user_id: &str, query: &FactQuery, limit: usize) -> Result<Vec<Fact>>;
}

/// In-process fact store
#[derive(Default)]
pub struct MemoryCollectionStore {
    facts: Mutex<Vec<Fact>>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.facts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Fact> {
        self.facts.lock().clone()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn append(&self, facts: Vec<Fact>) -> Result<()> {
        self.facts.lock().extend(facts);
        Ok(())
    }

    async fn search(&self, user_id: &str, query: &FactQuery, limit: usize) -> Result<Vec<Fact>> {
        let facts = self.facts.lock();
        // Insertion order is chronological, so reverse for newest first
        Ok(facts
            .iter()
            .rev()
            .filter(|f| f.user_id == user_id)
            .filter(|f| query.is_empty() || query.matches(f))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Extracts facts from an utterance and appends them
pub struct CollectionWriter {
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn CollectionStore>,
}

impl CollectionWriter {
    pub fn new(extractor: Arc<dyn Extractor>, store: Arc<dyn CollectionStore>) -> Self {
        Self { extractor, store }
    }

    async fn try_write(&self, user_id: &str, text: &str, guard: &CallGuard) -> Result<WriteOutcome> {
        let raw = guard
            .call("extract_facts", self.extractor.extract_facts(text))
            .await?;
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| Error::Parse(e.to_string()))?;
        let items = value
            .get("facts")
            .or_else(|| value.get("triples"))
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Schema("expected a \"facts\" array".into()))?;

        let mut facts = Vec::new();
        let mut rejected = Vec::new();
        for item in items {
            match validate_fact(user_id, item) {
                Ok(fact) => facts.push(fact),
                Err(reason) => {
                    warn!(user_id, %reason, "fact rejected");
                    rejected.push(reason);
                }
            }
        }

        if facts.is_empty() && rejected.is_empty() {
            return Ok(WriteOutcome::Skipped);
        }

        let applied: Vec<String> = facts
            .iter()
            .map(|f| format!("{}:{}", f.predicate, f.object))
            .collect();
        if !facts.is_empty() {
            let count = facts.len();
            self.store.append(facts).await?;
            info!(user_id, count, "facts appended");
        }

        Ok(if rejected.is_empty() {
            WriteOutcome::Committed { applied }
        } else {
            WriteOutcome::Partial { applied, rejected }
        })
    }
}

#[async_trait]
impl Writer for CollectionWriter {
    fn name(&self) -> &'static str {
        "collection"
    }

    async fn write(
        &self,
        user_id: &str,
        _decision: &RoutingDecision,
        text: &str,
        guard: &CallGuard,
    ) -> WriteOutcome {
        match self.try_write(user_id, text, guard).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id, error = %e, "collection write failed");
                WriteOutcome::Failed {
                    reason: e.kind().to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Scope;
    use crate::stub::StubCapability;
    use serde_json::json;

    #[test]
    fn test_predicate_parse() {
        assert_eq!(Predicate::parse("has_condition"), Some(Predicate::HasCondition));
        assert_eq!(
            Predicate::parse("HAS_SANJEONGTEUKRYE"),
            Some(Predicate::HasRareDiseaseExemption)
        );
        assert_eq!(Predicate::parse("LIKES_CATS"), None);
    }

    #[test]
    fn test_predicate_hints() {
        assert_eq!(Predicate::hint_for_keyword("항암"), Some(Predicate::UnderTreatment));
        assert_eq!(Predicate::hint_for_keyword("c50.9"), Some(Predicate::HasCondition));
        assert_eq!(Predicate::hint_for_keyword("영수증"), Some(Predicate::HasDocument));
        assert_eq!(Predicate::hint_for_keyword("서울"), None);
    }

    #[test]
    fn test_fact_dates() {
        assert_eq!(normalize_fact_date(Some("2025-06-01")), Some("2025-06-01".into()));
        assert_eq!(normalize_fact_date(Some("2025-06")), Some("2025-06".into()));
        assert_eq!(normalize_fact_date(Some("2025-06-1")), Some("2025-06-01".into()));
        assert_eq!(normalize_fact_date(Some(" 2025-6-9 ")), Some("2025-06-09".into()));
        assert_eq!(normalize_fact_date(Some("2025-6")), Some("2025-06".into()));
        assert_eq!(normalize_fact_date(Some("2025-02-30")), None);
        assert_eq!(normalize_fact_date(Some("2025-06-001")), None);
        assert_eq!(normalize_fact_date(Some("25-06-01")), None);
        assert_eq!(normalize_fact_date(Some("2025")), None);
        assert_eq!(normalize_fact_date(Some("2025-13")), None);
        assert_eq!(normalize_fact_date(Some("지난달")), None);
        assert_eq!(normalize_fact_date(None), None);
    }

    #[test]
    fn test_validate_fact_defaults_and_clamping() {
        let fact = validate_fact(
            "u1",
            &json!({"predicate": "HAS_CONDITION", "object": "유방암", "code_system": "KCD10", "code": "C50.9", "confidence": 1.7}),
        )
        .unwrap();
        assert_eq!(fact.subject, "user");
        assert_eq!(fact.code_system, Some(CodeSystem::Kcd10));
        assert_eq!(fact.confidence, 1.0);
        assert!(!fact.negation);

        let fact = validate_fact("u1", &json!({"predicate": "UNDER_TREATMENT", "object": "항암"})).unwrap();
        assert_eq!(fact.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_validate_fact_rejections() {
        assert!(validate_fact("u1", &json!({"predicate": "FAVORITE_FOOD", "object": "김치"})).is_err());
        assert!(validate_fact("u1", &json!({"predicate": "HAS_CONDITION"})).is_err());
        assert!(
            validate_fact("u1", &json!({"predicate": "HAS_CONDITION", "object": "x", "code_system": "KCD7"}))
                .is_err()
        );
        assert!(validate_fact("u1", &json!("HAS_CONDITION")).is_err());
    }

    #[test]
    fn test_fact_line() {
        let mut fact = validate_fact(
            "u1",
            &json!({"predicate": "HAS_CONDITION", "object": "유방암", "code_system": "KCD10", "code": "C50.9", "onset_date": "2025-06"}),
        )
        .unwrap();
        assert_eq!(fact.line(), "HAS_CONDITION 유방암 (KCD10 C50.9, 2025-06~)");
        fact.negation = true;
        assert!(fact.line().ends_with("[부정]"));
    }

    #[tokio::test]
    async fn test_store_search_newest_first() {
        let store = MemoryCollectionStore::new();
        let mk = |obj: &str, pred: &str| validate_fact("u1", &json!({"predicate": pred, "object": obj})).unwrap();
        store
            .append(vec![
                mk("고혈압", "HAS_CHRONIC_DISEASE"),
                mk("유방암", "HAS_CONDITION"),
                mk("항암치료", "UNDER_TREATMENT"),
            ])
            .await
            .unwrap();
        store
            .append(vec![validate_fact("u2", &json!({"predicate": "HAS_CONDITION", "object": "유방암"})).unwrap()])
            .await
            .unwrap();

        let query = FactQuery {
            keywords: vec!["유방암".into()],
            predicates: vec![Predicate::UnderTreatment],
        };
        let found = store.search("u1", &query, 12).await.unwrap();
        let objects: Vec<_> = found.iter().map(|f| f.object.as_str()).collect();
        assert_eq!(objects, vec!["항암치료", "유방암"]);

        let recent = store.search("u1", &FactQuery::default(), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].object, "항암치료");
    }

    #[tokio::test]
    async fn test_writer_appends_without_dedup() {
        let reply = r#"{"facts":[{"predicate":"HAS_CONDITION","object":"유방암"},{"predicate":"BOGUS","object":"x"}]}"#;
        let stub = Arc::new(StubCapability::new().with_fact_extraction(reply));
        let store = Arc::new(MemoryCollectionStore::new());
        let writer = CollectionWriter::new(stub, store.clone());
        let decision = RoutingDecision::new(Scope::Collection, Scope::Collection, "진단");

        for _ in 0..2 {
            let outcome = writer.write("u1", &decision, "유방암 진단", &CallGuard::default()).await;
            assert!(matches!(outcome, WriteOutcome::Partial { ref applied, ref rejected }
                if applied == &vec!["HAS_CONDITION:유방암".to_string()] && rejected.len() == 1));
        }
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_accepts_triples_key_and_skips_empty() {
        let stub = Arc::new(StubCapability::new().with_fact_extraction(r#"{"triples":[]}"#));
        let writer = CollectionWriter::new(stub, Arc::new(MemoryCollectionStore::new()));
        let decision = RoutingDecision::new(Scope::Collection, Scope::None, "x");
        let outcome = writer.write("u1", &decision, "...", &CallGuard::default()).await;
        assert_eq!(outcome, WriteOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_writer_rejects_missing_array() {
        let stub = Arc::new(StubCapability::new().with_fact_extraction(r#"{"items":[]}"#));
        let writer = CollectionWriter::new(stub, Arc::new(MemoryCollectionStore::new()));
        let decision = RoutingDecision::new(Scope::Collection, Scope::None, "x");
        let outcome = writer.write("u1", &decision, "...", &CallGuard::default()).await;
        assert_eq!(
            outcome,
            WriteOutcome::Failed {
                reason: "schema".into()
            }
        );
    }
}
