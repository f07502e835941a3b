//! Answer generation: prompt assembly and policy-card extraction

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::capability::{Capability, GenerationRequest};
use crate::error::Result;
use crate::guard::CallGuard;
use crate::profile::ProfileContext;
use crate::state::{AssembledContext, ChatMessage, Role};

/// Facts rendered into the prompt
pub const MAX_PROMPT_FACTS: usize = 8;
/// Document snippets rendered into the prompt
pub const MAX_PROMPT_DOCUMENTS: usize = 6;
const MAX_SNIPPET_CHARS: usize = 280;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json\s*(.*?)\s*```").unwrap());

const SYSTEM_PROMPT: &str = "\
당신은 의료·복지 지원 제도를 안내하는 상담사입니다.

지침:
- 항상 한국어로 답변합니다.
- 맨 앞에 결론을 한 문장으로 제시하고, 이어서 근거, 마지막에 다음 단계(필요 서류, 추가 확인 사항, 신청 경로)를 안내합니다.
- 근거는 제공된 프로필, 건강/상황 정보, 정책 문서에서만 인용합니다. 추정하거나 제공되지 않은 사실을 만들지 않습니다.
- 사용자의 나이, 건강보험 자격, 소득 수준, 건강 상태를 고려해 해당되는 지원 사업을 우선 추천합니다.
- 주민등록번호, 계좌번호 등 민감한 개인정보를 요청하지 않습니다.
- 정보가 부족하면 \"해당 정보를 찾을 수 없습니다\"라고 솔직하게 답합니다.
- 추천할 정책이 있으면 답변 끝에 다음 형식의 JSON 블록을 하나만 덧붙일 수 있습니다.

```json
{\"policies\": [{\"id\": \"...\", \"title\": \"...\", \"description\": \"...\", \"eligibility\": \"...\", \"benefits\": \"...\", \"applicationUrl\": \"...\"}]}
```";

/// A recommended policy parsed from the answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCard {
    pub id: String,
    pub title: String,
    pub description: String,
    pub eligibility: String,
    pub benefits: String,
    #[serde(alias = "applicationUrl")]
    pub application_url: Option<String>,
}

/// Final answer for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub policies: Vec<PolicyCard>,
}

impl Answer {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let policies = extract_policies(&text);
        Self { text, policies }
    }

    /// The answer with fenced JSON blocks removed
    pub fn display_text(&self) -> String {
        FENCED_JSON.replace_all(&self.text, "").trim().to_string()
    }
}

/// Cards from the first fenced ```json block holding a `policies` array
pub fn extract_policies(text: &str) -> Vec<PolicyCard> {
    for captures in FENCED_JSON.captures_iter(text) {
        let Ok(value) = serde_json::from_str::<Value>(&captures[1]) else {
            continue;
        };
        let Some(items) = value.get("policies").and_then(Value::as_array) else {
            continue;
        };
        return items.iter().filter_map(parse_card).collect();
    }
    Vec::new()
}

fn parse_card(item: &Value) -> Option<PolicyCard> {
    let mut item = item.clone();
    // Numeric ids are common in model output
    if let Some(id) = item.get_mut("id") {
        if let Value::Number(n) = id {
            *id = Value::String(n.to_string());
        }
    }
    serde_json::from_value(item).ok()
}

// --- Prompt assembly ---

/// Profile lines for the system prompt and the user prompt
pub fn profile_lines(ctx: &ProfileContext) -> Vec<String> {
    let p = &ctx.profile;
    let mut lines = Vec::new();
    if !ctx.summary.is_empty() {
        lines.push(format!("- 요약: {}", ctx.summary));
    }
    if let Some(residency) = &p.residency {
        lines.push(format!("- 거주지: {residency}"));
    }
    if let Some(ins) = p.insurance_type {
        lines.push(format!("- 건보 자격: {}", ins.label()));
    }
    if let Some(ratio) = p.median_income_ratio {
        lines.push(format!("- 중위소득 비율: {ratio:.1}%"));
    }
    if let Some(benefit) = p.basic_benefit_type {
        lines.push(format!("- 기초생활보장: {}", benefit.label()));
    }
    let disability = match p.disability_grade {
        Some(1) => "심한 장애",
        Some(2) => "심하지 않은 장애",
        _ => "미등록",
    };
    lines.push(format!("- 장애 등급: {disability}"));
    if let Some(ltci) = p.ltci_grade {
        lines.push(format!("- 장기요양 등급: {}", ltci.label()));
    }
    if p.pregnant_or_postpartum {
        lines.push("- 임신/출산 12개월 이내".to_string());
    }
    lines
}

fn document_lines(context: &AssembledContext) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, doc) in context.documents.iter().take(MAX_PROMPT_DOCUMENTS).enumerate() {
        let mut header = format!("{}. {}", idx + 1, doc.title);
        if let Some(region) = &doc.region {
            header.push_str(&format!(" ({region})"));
        }
        out.push(format!("- {header}"));
        let body = format!("{} {}", doc.requirements, doc.benefits);
        let body: String = body.trim().chars().take(MAX_SNIPPET_CHARS).collect();
        if !body.is_empty() {
            out.push(format!("  > {body}"));
        }
        if let Some(url) = &doc.url {
            out.push(format!("  출처: {url}"));
        }
    }
    out
}

/// Build the generation request for one turn
pub fn build_request(
    input_text: &str,
    history: &[ChatMessage],
    context: &AssembledContext,
) -> GenerationRequest {
    let mut system_prompt = SYSTEM_PROMPT.to_string();
    if let Some(profile) = &context.profile {
        system_prompt.push_str("\n\n[사용자 프로필]\n");
        system_prompt.push_str(&profile_lines(profile).join("\n"));
    }

    let mut sections = vec![format!("사용자 질문:\n{}", input_text.trim())];
    if let Some(summary) = context.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        sections.push(format!("[이전 대화 요약]\n{summary}"));
    }
    if let Some(profile) = &context.profile {
        sections.push(format!("[프로필]\n{}", profile_lines(profile).join("\n")));
    }
    if let Some(facts) = context.collection.as_ref().filter(|f| !f.is_empty()) {
        let lines: Vec<String> = facts
            .iter()
            .take(MAX_PROMPT_FACTS)
            .map(|f| format!("- {}", f.line()))
            .collect();
        sections.push(format!("[건강/상황 정보]\n{}", lines.join("\n")));
    }
    let docs = document_lines(context);
    if !docs.is_empty() {
        sections.push(format!("[관련 정책 문서]\n{}", docs.join("\n")));
    }

    GenerationRequest {
        system_prompt,
        history: history
            .iter()
            .filter(|m| m.role != Role::Tool)
            .cloned()
            .collect(),
        user_prompt: sections.join("\n\n"),
    }
}

/// Produces the answer from the assembled context
pub struct Generator {
    capability: Arc<dyn Capability>,
}

impl Generator {
    pub fn new(capability: Arc<dyn Capability>) -> Self {
        Self { capability }
    }

    /// Failures propagate; no partial answer is produced
    pub async fn generate(
        &self,
        input_text: &str,
        history: &[ChatMessage],
        context: &AssembledContext,
        guard: &CallGuard,
    ) -> Result<Answer> {
        let request = build_request(input_text, history, context);
        debug!(history = request.history.len(), "generating answer");
        let text = guard.call("generate", self.capability.generate(&request)).await?;
        let answer = Answer::from_text(text);
        info!(policies = answer.policies.len(), "answer ready");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::validate_fact;
    use crate::normalize::InsuranceType;
    use crate::profile::ProfileRecord;
    use crate::retrieval::DocumentSnippet;
    use serde_json::json;

    #[test]
    fn test_extract_policies_first_valid_block() {
        let text = "결론입니다.\n```json\n{not json}\n```\n그리고\n```JSON\n{\"policies\":[{\"id\":7,\"title\":\"재난적의료비\",\"applicationUrl\":\"https://example.go.kr\"}]}\n```\n```json\n{\"policies\":[{\"title\":\"두번째\"}]}\n```";
        let cards = extract_policies(text);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, "7");
        assert_eq!(cards[0].title, "재난적의료비");
        assert_eq!(cards[0].application_url.as_deref(), Some("https://example.go.kr"));
    }

    #[test]
    fn test_extract_policies_none() {
        assert!(extract_policies("그냥 답변").is_empty());
        assert!(extract_policies("```json\n{\"other\": []}\n```").is_empty());
    }

    #[test]
    fn test_display_text_strips_blocks() {
        let answer = Answer::from_text("결론.\n```json\n{\"policies\":[]}\n```");
        assert_eq!(answer.display_text(), "결론.");
        assert!(answer.policies.is_empty());
    }

    #[test]
    fn test_build_request_sections() {
        let facts: Vec<_> = (0..10)
            .map(|i| validate_fact("u1", &json!({"predicate":"HAS_CONDITION","object":format!("질환{i}")})).unwrap())
            .collect();
        let context = AssembledContext {
            profile: Some(ProfileContext {
                profile: ProfileRecord {
                    insurance_type: Some(InsuranceType::Local),
                    ..ProfileRecord::new("u1")
                },
                age: Some(40),
                summary: "연령 40세, 건보자격 지역가입자".into(),
            }),
            collection: Some(facts),
            documents: vec![DocumentSnippet {
                doc_id: "d1".into(),
                title: "재난적의료비 지원".into(),
                requirements: "중위소득 100% 이하".into(),
                benefits: "본인부담 50~80%".into(),
                region: None,
                url: Some("https://example.go.kr".into()),
                score: 1.0,
            }],
            summary: Some("이전 상담 요약".into()),
        };
        let history = vec![
            ChatMessage::user("안녕하세요"),
            ChatMessage::new(Role::Tool, "marker"),
            ChatMessage::assistant("무엇을 도와드릴까요"),
        ];

        let request = build_request("지원 대상인가요?", &history, &context);
        assert!(request.system_prompt.contains("[사용자 프로필]"));
        assert!(request.system_prompt.contains("- 건보 자격: 지역가입자"));
        assert_eq!(request.history.len(), 2);
        assert!(request.user_prompt.starts_with("사용자 질문:\n지원 대상인가요?"));
        assert!(request.user_prompt.contains("[이전 대화 요약]\n이전 상담 요약"));
        assert!(request.user_prompt.contains("질환7"));
        assert!(!request.user_prompt.contains("질환8"));
        assert!(request.user_prompt.contains("출처: https://example.go.kr"));
    }

    #[test]
    fn test_build_request_without_context() {
        let request = build_request("안녕하세요", &[], &AssembledContext::default());
        assert!(!request.system_prompt.contains("[사용자 프로필]"));
        assert_eq!(request.user_prompt, "사용자 질문:\n안녕하세요");
    }
}
