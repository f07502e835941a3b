//! Utterance classification.
//!
//! The capability returns raw text. We parse it as JSON (falling back to the
//! widest `{...}` span), validate it against a fixed schema and map every
//! failure to the `NONE`/`NONE` branch.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::state::RoutingDecision;

/// Reason recorded when the utterance is blank
pub const EMPTY_INPUT_REASON: &str = "empty input";

/// Upper bound on the reason length, in characters
pub const MAX_REASON_CHARS: u64 = 400;

static JSON_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

static DECISION_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let scopes = json!(["PROFILE", "COLLECTION", "BOTH", "NONE"]);
    json!({
        "type": "object",
        "required": ["target", "required_rag", "reason"],
        "properties": {
            "target": { "enum": scopes },
            "required_rag": { "enum": scopes },
            "reason": {
                "type": "string",
                "minLength": 1,
                "maxLength": MAX_REASON_CHARS
            }
        }
    })
});

static DECISION_VALIDATOR: LazyLock<jsonschema::Validator> =
    LazyLock::new(|| jsonschema::validator_for(&DECISION_SCHEMA).unwrap());

/// Routes utterances through the classification capability
pub struct Classifier {
    capability: Arc<dyn Capability>,
}

impl Classifier {
    pub fn new(capability: Arc<dyn Capability>) -> Self {
        Self { capability }
    }

    /// Classify one utterance. Never fails: blank input and every capability
    /// or validation error degrade to `NONE`/`NONE`.
    pub async fn classify(&self, text: &str, guard: &CallGuard) -> RoutingDecision {
        if text.trim().is_empty() {
            debug!("blank utterance, skipping classification");
            return RoutingDecision::none(EMPTY_INPUT_REASON);
        }

        match self.try_classify(text, guard).await {
            Ok(decision) => {
                debug!(
                    target = %decision.target,
                    required_retrieval = %decision.required_retrieval,
                    "utterance classified"
                );
                decision
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "classification failed, routing to NONE");
                RoutingDecision::none(format!("routing failed: {}", e.kind()))
            }
        }
    }

    async fn try_classify(&self, text: &str, guard: &CallGuard) -> Result<RoutingDecision> {
        let raw = guard.call("classify", self.capability.classify(text)).await?;
        parse_decision(&raw)
    }
}

/// Parse and validate raw classifier output
pub fn parse_decision(raw: &str) -> Result<RoutingDecision> {
    let mut value = parse_json_object(raw)?;
    canonicalize_keys(&mut value);
    validate_decision(&value)?;
    serde_json::from_value(value).map_err(|e| Error::Schema(e.to_string()))
}

/// Whole text first, then the widest brace-delimited span
fn parse_json_object(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Ok(value),
        Err(first) => {
            let span = JSON_SPAN
                .find(trimmed)
                .ok_or_else(|| Error::Parse(format!("no JSON object in output: {first}")))?;
            serde_json::from_str(span.as_str()).map_err(|e| Error::Parse(e.to_string()))
        }
    }
}

/// Accept `required_retrieval` as a spelling of `required_rag`
fn canonicalize_keys(value: &mut Value) {
    if let Value::Object(map) = value {
        if !map.contains_key("required_rag") {
            if let Some(v) = map.remove("required_retrieval") {
                map.insert("required_rag".to_string(), v);
            }
        }
    }
}

fn validate_decision(value: &Value) -> Result<()> {
    let errors: Vec<String> = DECISION_VALIDATOR
        .iter_errors(value)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Schema(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Scope;
    use crate::stub::StubCapability;

    #[test]
    fn test_parse_plain_json() {
        let d = parse_decision(r#"{"target":"PROFILE","required_rag":"NONE","reason":"나이와 의료급여"}"#)
            .unwrap();
        assert_eq!(d.target, Scope::Profile);
        assert_eq!(d.required_retrieval, Scope::None);
    }

    #[test]
    fn test_parse_falls_back_to_embedded_object() {
        let raw = "결과는 다음과 같습니다:\n```json\n{\"target\":\"BOTH\",\"required_rag\":\"BOTH\",\"reason\":\"혼합\"}\n```";
        let d = parse_decision(raw).unwrap();
        assert_eq!(d.target, Scope::Both);
        assert_eq!(d.reason, "혼합");
    }

    #[test]
    fn test_parse_accepts_required_retrieval_key() {
        let d = parse_decision(
            r#"{"target":"COLLECTION","required_retrieval":"COLLECTION","reason":"진단 코드"}"#,
        )
        .unwrap();
        assert_eq!(d.required_retrieval, Scope::Collection);
    }

    #[test]
    fn test_parse_rejects_out_of_vocabulary_target() {
        let err = parse_decision(r#"{"target":"EVERYTHING","required_rag":"NONE","reason":"x"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_parse_rejects_lowercase_values() {
        let err = parse_decision(r#"{"target":"profile","required_rag":"NONE","reason":"x"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_parse_rejects_empty_and_long_reasons() {
        let empty = parse_decision(r#"{"target":"NONE","required_rag":"NONE","reason":""}"#);
        assert!(matches!(empty, Err(Error::Schema(_))));

        let long = "가".repeat(401);
        let raw = json!({"target": "NONE", "required_rag": "NONE", "reason": long}).to_string();
        assert!(matches!(parse_decision(&raw), Err(Error::Schema(_))));

        let max = "가".repeat(400);
        let raw = json!({"target": "NONE", "required_rag": "NONE", "reason": max}).to_string();
        assert!(parse_decision(&raw).is_ok());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = parse_decision(r#"{"target":"NONE","reason":"x"}"#).unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_decision("I cannot help with that").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[tokio::test]
    async fn test_blank_input_skips_capability() {
        let stub = Arc::new(StubCapability::new());
        let classifier = Classifier::new(stub.clone());

        for input in ["", "   ", "\n\t"] {
            let d = classifier.classify(input, &CallGuard::default()).await;
            assert_eq!(d, RoutingDecision::none(EMPTY_INPUT_REASON));
        }
        assert_eq!(stub.classify_calls().len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_output_falls_back() {
        let stub = Arc::new(StubCapability::new().with_classification("not json at all"));
        let classifier = Classifier::new(stub.clone());

        let d = classifier.classify("안녕하세요", &CallGuard::default()).await;
        assert_eq!(d.target, Scope::None);
        assert_eq!(d.required_retrieval, Scope::None);
        assert_eq!(d.reason, "routing failed: parse");
        assert_eq!(stub.classify_calls(), vec!["안녕하세요".to_string()]);
    }

    #[tokio::test]
    async fn test_capability_error_falls_back() {
        let stub = Arc::new(StubCapability::new().failing_classification());
        let classifier = Classifier::new(stub);

        let d = classifier.classify("유방암 진단", &CallGuard::default()).await;
        assert_eq!(d, RoutingDecision::none("routing failed: capability"));
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let stub = Arc::new(StubCapability::new().with_delay(Duration::from_millis(200)));
        let classifier = Classifier::new(stub);
        let guard = CallGuard::new(Duration::from_millis(10), CancellationToken::new());

        let d = classifier.classify("유방암 진단", &guard).await;
        assert_eq!(d, RoutingDecision::none("routing failed: timeout"));
    }
}
