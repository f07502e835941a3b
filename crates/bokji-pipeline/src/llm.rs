//! Production capability backed by a chat-completion provider

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bokji_ai::{ChatProvider, Context, Message, Model, RequestOptions};
use tracing::warn;

use crate::capability::{Capability, Extractor, GenerationRequest, render_transcript};
use crate::collection::Predicate;
use crate::error::Result;
use crate::state::{ChatMessage, Role};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

// --- Prompts ---

const ROUTER_PROMPT: &str = "\
당신은 의료복지 상담 시스템의 라우터입니다. 사용자 입력을 분석해 JSON 하나로만 답하세요.

[저장 대상 target]
- PROFILE: 다음 9개 항목 중 하나에 정확히 대응하는 값이 있을 때
  나이/생년월일, 성별, 거주지(시군구), 건강보험 자격(직장/지역/피부양/의료급여),
  중위소득 대비 소득수준(%), 기초생활보장 급여(없음/생계/의료/주거/교육),
  장애 등급(미등록/심한/심하지 않음), 장기요양 등급(NONE/G1~G5/COGNITIVE), 임신·출산 12개월 이내 여부
- COLLECTION: 진단/질병 코드, 증상, 치료/수술/약물, 산정특례, 난임, 실직·소득 급감,
  진단서·영수증 같은 문서, 기간이 있는 사건 등 9개 항목 밖의 서술형 정보
- BOTH: 두 종류가 함께 있을 때
- NONE: 인사, 잡담, 개인 정보가 없는 일반 문의

[답변에 필요한 정보 required_rag]
- 프로필 관련 질문은 PROFILE, 의료·치료·특례·문서는 COLLECTION,
  자격 판단이나 혜택 추천은 BOTH, 일반 정책 문의는 NONE

[출력 형식]
{\"target\": \"PROFILE|COLLECTION|BOTH|NONE\", \"required_rag\": \"PROFILE|COLLECTION|BOTH|NONE\", \"reason\": \"한 문장\"}";

const SUMMARY_PROMPT: &str = "\
이전 대화 요약과 최근 메시지를 바탕으로, 이후 질문에서도 맥락을 잃지 않도록 \
중요한 정보만 간결하게 새 요약을 작성하세요. 요약 본문만 출력합니다.";

const PROFILE_PROMPT: &str = "\
당신은 의료복지 프로필 추출기입니다. 사용자 입력에서 아래 9개 항목만 추출해 JSON 하나로 답하세요.
명시되지 않았거나 추정이 필요한 값은 null로 둡니다. 다른 키는 넣지 않습니다.

{
  \"birth_date\": \"YYYY-MM-DD\" | null,
  \"sex\": \"M\" | \"F\" | null,
  \"residency\": \"시도 시군구\" | null,
  \"insurance_type\": \"EMPLOYED\" | \"LOCAL\" | \"DEPENDENT\" | \"MEDICAL_AID_1\" | \"MEDICAL_AID_2\" | null,
  \"median_income_ratio\": 0~300 사이 숫자 | null,
  \"basic_benefit_type\": \"NONE\" | \"LIVELIHOOD\" | \"MEDICAL\" | \"HOUSING\" | \"EDUCATION\" | null,
  \"disability_grade\": 0 | 1 | 2 | null,
  \"ltci_grade\": \"NONE\" | \"G1\" | \"G2\" | \"G3\" | \"G4\" | \"G5\" | \"COGNITIVE\" | null,
  \"pregnant_or_postpartum\": true | false | null
}

'68세'처럼 나이만 있으면 birth_date는 null입니다.";

fn facts_prompt() -> String {
    let predicates: Vec<&str> = Predicate::ALL.iter().map(Predicate::as_str).collect();
    format!(
        "\
당신은 의료복지 정보의 사실 추출기입니다. 입력에서 주어-술어-목적어 사실 목록을 JSON 하나로 답하세요.

[술어] {}

{{\"facts\": [{{\"subject\": \"user\", \"predicate\": \"술어\", \"object\": \"라벨 또는 서술\", \
\"code_system\": \"KCD10|SNOMED|HIRA|ATC|ICD10|NONE\" | null, \"code\": string | null, \
\"onset_date\": \"YYYY-MM-DD|YYYY-MM\" | null, \"end_date\": \"YYYY-MM-DD|YYYY-MM\" | null, \
\"negation\": true | false, \"confidence\": 0.0~1.0}}]}}

- 진단은 HAS_CONDITION, 치료 중이면 UNDER_TREATMENT, 산정특례는 HAS_RARE_DISEASE_EXEMPTION을 씁니다.
- 부정하는 내용은 negation=true 또는 DENIES로 표시합니다.
- 월까지만 있는 날짜는 YYYY-MM으로 씁니다. 불명확하면 null입니다.",
        predicates.join(", ")
    )
}

fn json_user_prompt(text: &str) -> String {
    format!("사용자 입력:\n{text}\n\n위 기준에 따라 JSON으로만 답하세요.")
}

fn to_message(message: &ChatMessage) -> Option<Message> {
    match message.role {
        Role::User => Some(Message::user(&message.content)),
        Role::Assistant => Some(Message::assistant(&message.content)),
        Role::Tool => None,
    }
}

// --- Capability ---

/// Capability implemented with a chat-completion provider
pub struct LlmCapability {
    provider: Arc<dyn ChatProvider>,
    model: Model,
    retry: RetryConfig,
    answer_temperature: f32,
}

impl LlmCapability {
    pub fn new(provider: Arc<dyn ChatProvider>, model: Model) -> Self {
        Self {
            provider,
            model,
            retry: RetryConfig::default(),
            answer_temperature: 0.2,
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_answer_temperature(mut self, temperature: f32) -> Self {
        self.answer_temperature = temperature;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    async fn complete(&self, context: &Context, options: &RequestOptions) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.provider.complete(&self.model, context, options).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry.max_retries && e.is_retryable() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.retry.max_retries + 1,
                        error = %e,
                        ?delay,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn complete_json(&self, system: &str, text: &str) -> Result<String> {
        let mut context = Context::with_system(system);
        context.push(Message::user(json_user_prompt(text)));
        self.complete(&context, &RequestOptions::json()).await
    }
}

#[async_trait]
impl Capability for LlmCapability {
    async fn classify(&self, text: &str) -> Result<String> {
        self.complete_json(ROUTER_PROMPT, text).await
    }

    async fn summarize(&self, old_summary: &str, recent: &[ChatMessage]) -> Result<String> {
        let mut context = Context::with_system(SUMMARY_PROMPT);
        context.push(Message::user(format!(
            "[이전 요약]\n{old_summary}\n\n[최근 메시지]\n{}",
            render_transcript(recent)
        )));
        self.complete(&context, &RequestOptions::text(0.0)).await
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut context = Context::with_system(&request.system_prompt);
        for message in request.history.iter().filter_map(to_message) {
            context.push(message);
        }
        context.push(Message::user(&request.user_prompt));
        self.complete(&context, &RequestOptions::text(self.answer_temperature))
            .await
    }
}

#[async_trait]
impl Extractor for LlmCapability {
    async fn extract_profile(&self, text: &str) -> Result<String> {
        self.complete_json(PROFILE_PROMPT, text).await
    }

    async fn extract_facts(&self, text: &str) -> Result<String> {
        self.complete_json(&facts_prompt(), text).await
    }
}
