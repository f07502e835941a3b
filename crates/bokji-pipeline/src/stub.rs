//! Deterministic capability for tests and offline runs.
//!
//! Replies can be scripted per call kind. Anything not scripted falls back
//! to small keyword heuristics so the whole flow runs without a network.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::capability::{Capability, Extractor, GenerationRequest, render_transcript};
use crate::collection::Predicate;
use crate::error::{Error, Result};
use crate::state::{ChatMessage, RoutingDecision, Scope};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail,
}

impl Reply {
    fn into_result(self, what: &str) -> Result<String> {
        match self {
            Reply::Text(t) => Ok(t),
            Reply::Fail => Err(Error::Capability(format!("stub {what} failure"))),
        }
    }
}

/// A recorded call
#[derive(Debug, Clone, PartialEq)]
pub enum StubCall {
    Classify(String),
    Summarize {
        old_summary: String,
        recent: Vec<ChatMessage>,
    },
    Generate(GenerationRequest),
    ExtractProfile(String),
    ExtractFacts(String),
}

#[derive(Default)]
pub struct StubCapability {
    classifications: Mutex<VecDeque<Reply>>,
    summary: Option<Reply>,
    answer: Option<Reply>,
    profile: Option<Reply>,
    facts: Option<Reply>,
    delay: Option<Duration>,
    calls: Mutex<Vec<StubCall>>,
}

impl StubCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw classifier reply. The last queued reply repeats.
    pub fn with_classification(self, raw: impl Into<String>) -> Self {
        self.classifications.lock().push_back(Reply::Text(raw.into()));
        self
    }

    /// Queue a classifier reply built from a decision
    pub fn with_decision(self, target: Scope, required: Scope) -> Self {
        let raw = json!({
            "target": target.as_str(),
            "required_rag": required.as_str(),
            "reason": "scripted"
        });
        self.with_classification(raw.to_string())
    }

    pub fn failing_classification(self) -> Self {
        self.classifications.lock().push_back(Reply::Fail);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(Reply::Text(summary.into()));
        self
    }

    pub fn failing_summary(mut self) -> Self {
        self.summary = Some(Reply::Fail);
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(Reply::Text(answer.into()));
        self
    }

    pub fn failing_generation(mut self) -> Self {
        self.answer = Some(Reply::Fail);
        self
    }

    pub fn with_profile_extraction(mut self, raw: impl Into<String>) -> Self {
        self.profile = Some(Reply::Text(raw.into()));
        self
    }

    pub fn with_fact_extraction(mut self, raw: impl Into<String>) -> Self {
        self.facts = Some(Reply::Text(raw.into()));
        self
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().clone()
    }

    pub fn classify_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StubCall::Classify(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn summarize_calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StubCall::Summarize {
                    old_summary,
                    recent,
                } => Some((old_summary, recent)),
                _ => None,
            })
            .collect()
    }

    pub fn generate_calls(&self) -> Vec<GenerationRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StubCall::Generate(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    async fn enter(&self, call: StubCall) {
        self.calls.lock().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_classification(&self) -> Option<Reply> {
        let mut queue = self.classifications.lock();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Capability for StubCapability {
    async fn classify(&self, text: &str) -> Result<String> {
        self.enter(StubCall::Classify(text.to_string())).await;
        match self.next_classification() {
            Some(reply) => reply.into_result("classify"),
            None => serde_json::to_string(&heuristic_decision(text))
                .map_err(|e| Error::Parse(e.to_string())),
        }
    }

    async fn summarize(&self, old_summary: &str, recent: &[ChatMessage]) -> Result<String> {
        self.enter(StubCall::Summarize {
            old_summary: old_summary.to_string(),
            recent: recent.to_vec(),
        })
        .await;
        match &self.summary {
            Some(reply) => reply.clone().into_result("summarize"),
            None => Ok(heuristic_summary(old_summary, recent)),
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.enter(StubCall::Generate(request.clone())).await;
        match &self.answer {
            Some(reply) => reply.clone().into_result("generate"),
            None => Ok(format!(
                "[오프라인 응답] 아래 정보를 바탕으로 답변을 준비했습니다.\n\n{}",
                request.user_prompt
            )),
        }
    }
}

#[async_trait]
impl Extractor for StubCapability {
    async fn extract_profile(&self, text: &str) -> Result<String> {
        self.enter(StubCall::ExtractProfile(text.to_string())).await;
        match &self.profile {
            Some(reply) => reply.clone().into_result("extract_profile"),
            None => Ok(heuristic_profile(text).to_string()),
        }
    }

    async fn extract_facts(&self, text: &str) -> Result<String> {
        self.enter(StubCall::ExtractFacts(text.to_string())).await;
        match &self.facts {
            Some(reply) => reply.clone().into_result("extract_facts"),
            None => Ok(heuristic_facts(text).to_string()),
        }
    }
}

// --- Keyword heuristics ---

static AGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,3}\s*세|\d{4}\s*년생").unwrap());
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]\d{2}(?:\.\d+)?\b").unwrap());
static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[-.년]\s*(\d{1,2})[-.월]\s*(\d{1,2})").unwrap());
static MEDICAL_AID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"의료급여\s*([12])\s*종").unwrap());
static INCOME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"중위소득\s*(\d+(?:\.\d+)?)\s*%").unwrap());
static BENEFIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(생계|주거|교육)\s*급여").unwrap());
static LTCI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"장기요양\s*([1-5])\s*등급").unwrap());
static RESIDENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([가-힣]+(?:시|군|구))\s*(?:에\s*)?(?:거주|살)").unwrap());

const PROFILE_CUES: &[&str] = &[
    "의료급여", "직장가입", "지역가입", "피부양", "중위소득", "기초생활", "생계급여", "주거급여",
    "교육급여", "장애", "장기요양", "임신", "출산", "남성", "여성", "거주",
];
const CLINICAL_CUES: &[&str] = &[
    "진단", "치료", "항암", "투석", "암", "산정특례", "난임", "수술", "입원", "영수증", "진단서",
    "실직", "재난",
];
const ELIGIBILITY_CUES: &[&str] = &["자격", "지원", "혜택", "대상", "되나요", "가능", "요건", "조건"];
const RETRIEVAL_CLINICAL_CUES: &[&str] = &[
    "진단", "치료", "항암", "투석", "암", "산정특례", "임신", "난임", "문서", "영수증",
];
const FACT_CUES: &[(&str, Predicate)] = &[
    ("유방암", Predicate::HasCondition),
    ("폐암", Predicate::HasCondition),
    ("위암", Predicate::HasCondition),
    ("암", Predicate::HasCondition),
    ("항암", Predicate::UnderTreatment),
    ("투석", Predicate::UnderTreatment),
    ("산정특례", Predicate::HasRareDiseaseExemption),
    ("난임", Predicate::HasInfertility),
    ("영수증", Predicate::HasDocument),
    ("진단서", Predicate::HasDocument),
    ("실직", Predicate::FinancialShock),
    ("재난", Predicate::FinancialShock),
];

fn any_cue(text: &str, cues: &[&str]) -> bool {
    cues.iter().any(|c| text.contains(c))
}

/// Keyword routing used when no classifier reply is scripted
pub fn heuristic_decision(text: &str) -> RoutingDecision {
    if text.trim().is_empty() {
        return RoutingDecision::none("empty input");
    }
    let profile = AGE.is_match(text) || any_cue(text, PROFILE_CUES);
    let clinical = CODE.is_match(text) || any_cue(text, CLINICAL_CUES);
    let target = match (profile, clinical) {
        (true, true) => Scope::Both,
        (true, false) => Scope::Profile,
        (false, true) => Scope::Collection,
        (false, false) => Scope::None,
    };
    let required = if any_cue(text, ELIGIBILITY_CUES) {
        Scope::Both
    } else if any_cue(text, RETRIEVAL_CLINICAL_CUES) {
        Scope::Collection
    } else {
        Scope::None
    };
    RoutingDecision::new(target, required, "keyword heuristic")
}

fn heuristic_summary(old_summary: &str, recent: &[ChatMessage]) -> String {
    let transcript = render_transcript(recent);
    let tail: String = transcript.chars().take(300).collect();
    if old_summary.is_empty() {
        tail
    } else {
        format!("{old_summary}\n{tail}")
    }
}

fn heuristic_profile(text: &str) -> Value {
    let mut out = Map::new();
    let mut put = |key: &str, value: String| {
        out.insert(key.to_string(), Value::String(value));
    };

    if let Some(c) = DATE.captures(text) {
        put("birth_date", format!("{}-{:0>2}-{:0>2}", &c[1], &c[2], &c[3]));
    }
    if text.contains("남성") || text.contains("남자") {
        put("sex", "남".into());
    } else if text.contains("여성") || text.contains("여자") {
        put("sex", "여".into());
    }
    if let Some(c) = RESIDENCY.captures(text) {
        put("residency", c[1].to_string());
    }
    if let Some(c) = MEDICAL_AID.captures(text) {
        put("insurance_type", format!("의료급여 {}종", &c[1]));
    } else if text.contains("피부양") {
        put("insurance_type", "피부양".into());
    } else if text.contains("직장") {
        put("insurance_type", "직장".into());
    } else if text.contains("지역가입") {
        put("insurance_type", "지역".into());
    }
    if let Some(c) = INCOME.captures(text) {
        put("median_income_ratio", c[1].to_string());
    }
    if let Some(c) = BENEFIT.captures(text) {
        put("basic_benefit_type", c[1].to_string());
    }
    if text.contains("심하지 않은 장애") {
        put("disability_grade", "2".into());
    } else if text.contains("심한 장애") {
        put("disability_grade", "1".into());
    }
    if let Some(c) = LTCI.captures(text) {
        put("ltci_grade", format!("G{}", &c[1]));
    } else if text.contains("인지지원") {
        put("ltci_grade", "COGNITIVE".into());
    }
    if text.contains("임신") || text.contains("출산") {
        put("pregnant_or_postpartum", "true".into());
    }
    Value::Object(out)
}

fn heuristic_facts(text: &str) -> Value {
    let mut facts: Vec<Value> = Vec::new();
    let mut objects: Vec<&str> = Vec::new();
    for (cue, predicate) in FACT_CUES {
        if text.contains(cue) && !objects.iter().any(|o| o.contains(cue)) {
            objects.push(cue);
            facts.push(json!({"predicate": predicate.as_str(), "object": cue}));
        }
    }
    for m in CODE.find_iter(text) {
        facts.push(json!({
            "predicate": "HAS_CONDITION",
            "object": m.as_str(),
            "code_system": "KCD10",
            "code": m.as_str()
        }));
    }
    json!({ "facts": facts })
}
