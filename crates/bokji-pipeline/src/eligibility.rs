//! Profile-based eligibility filter for policy document candidates.
//!
//! A document is dropped only when its requirement text states a condition
//! the stored profile clearly fails. Unknown profile values and unparsable
//! requirement text always pass.

use std::sync::LazyLock;

use regex::Regex;

use crate::normalize::BasicBenefit;
use crate::profile::ProfileRecord;
use crate::retrieval::DocumentSnippet;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static INCOME_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"중위소득\s*(\d+)\s*%?\s*[~\-]\s*(\d+)\s*%?").unwrap());

static INCOME_BOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"중위소득\s*(\d+)\s*%?\s*(이하|이내|미만|이상|초과)").unwrap()
});

static DISABILITY_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"장애(\d)급(?:이상)?[~\-](\d)급(?:이하)?").unwrap());

static DISABILITY_BOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"장애(\d)급(이상|이하)").unwrap());

const BASIC_RECIPIENT_TERMS: &[&str] = &["기초생활보장수급자", "생계급여수급자", "의료급여수급자"];

/// Inclusive bounds parsed from requirement text
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    fn is_open(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn admits(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Median-income bounds in percent, e.g. `중위소득 50~120%` or `기준 중위소득의 80% 이하`
pub fn parse_income_bounds(text: &str) -> Option<Bounds> {
    let norm = text
        .replace("기준 중위소득", "중위소득")
        .replace("기준중위소득", "중위소득")
        .replace("중위소득의", "중위소득 ")
        .replace("중위소득기준", "중위소득 ");
    let norm = WHITESPACE.replace_all(&norm, " ");

    let mut bounds = Bounds::default();
    if let Some(c) = INCOME_RANGE.captures(&norm) {
        if let (Ok(a), Ok(b)) = (c[1].parse::<f64>(), c[2].parse::<f64>()) {
            bounds = Bounds {
                min: Some(a.min(b)),
                max: Some(a.max(b)),
            };
        }
    }
    for c in INCOME_BOUND.captures_iter(&norm) {
        let Ok(value) = c[1].parse::<f64>() else {
            continue;
        };
        match &c[2] {
            "이하" | "이내" | "미만" => {
                if bounds.max.is_none_or(|max| value < max) {
                    bounds.max = Some(value);
                }
            }
            _ => {
                if bounds.min.is_none_or(|min| value > min) {
                    bounds.min = Some(value);
                }
            }
        }
    }
    (!bounds.is_open()).then_some(bounds)
}

/// Disability grade bounds, e.g. `장애1급~3급` or `장애2급 이하`
pub fn parse_disability_bounds(text: &str) -> Option<Bounds> {
    let compact = WHITESPACE.replace_all(text, "");
    if let Some(c) = DISABILITY_RANGE.captures(&compact) {
        let a: f64 = c[1].parse().ok()?;
        let b: f64 = c[2].parse().ok()?;
        return Some(Bounds {
            min: Some(a.min(b)),
            max: Some(a.max(b)),
        });
    }
    let c = DISABILITY_BOUND.captures(&compact)?;
    let grade: f64 = c[1].parse().ok()?;
    Some(match &c[2] {
        "이상" => Bounds {
            min: Some(grade),
            max: None,
        },
        _ => Bounds {
            min: None,
            max: Some(grade),
        },
    })
}

/// Stored ratios up to 10 are read as multiples of the median (1.2 is 120%)
fn income_percent(ratio: f64) -> f64 {
    if ratio <= 10.0 { ratio * 100.0 } else { ratio }
}

fn requirement_text(snippet: &DocumentSnippet) -> String {
    format!("{} {}", snippet.requirements, snippet.title)
}

fn passes_income(profile: &ProfileRecord, text: &str) -> bool {
    let Some(ratio) = profile.median_income_ratio else {
        return true;
    };
    parse_income_bounds(text).is_none_or(|b| b.admits(income_percent(ratio)))
}

fn passes_basic_benefit(profile: &ProfileRecord, text: &str) -> bool {
    let compact = WHITESPACE.replace_all(text, "");
    let needs_recipient = BASIC_RECIPIENT_TERMS.iter().any(|t| compact.contains(t));
    let accepts_near_poor = compact.contains("차상위");
    // The profile cannot record near-poor status, so only recipient-only documents are checked
    if !needs_recipient || accepts_near_poor {
        return true;
    }
    !matches!(profile.basic_benefit_type, Some(BasicBenefit::None))
}

fn passes_disability(profile: &ProfileRecord, text: &str) -> bool {
    let Some(grade) = profile.disability_grade else {
        return true;
    };
    parse_disability_bounds(text).is_none_or(|b| b.admits(f64::from(grade)))
}

/// Whether the profile can plausibly qualify for the document
pub fn is_eligible(profile: &ProfileRecord, snippet: &DocumentSnippet) -> bool {
    let text = requirement_text(snippet);
    passes_income(profile, &text) && passes_basic_benefit(profile, &text) && passes_disability(profile, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(title: &str, requirements: &str) -> DocumentSnippet {
        DocumentSnippet {
            doc_id: title.into(),
            title: title.into(),
            requirements: requirements.into(),
            benefits: String::new(),
            region: None,
            url: None,
            score: 0.0,
        }
    }

    fn profile() -> ProfileRecord {
        ProfileRecord::new("u1")
    }

    #[test]
    fn test_parse_income_bounds() {
        assert_eq!(
            parse_income_bounds("기준 중위소득의 80% 이하 가구"),
            Some(Bounds { min: None, max: Some(80.0) })
        );
        assert_eq!(
            parse_income_bounds("중위소득 120%~50%"),
            Some(Bounds { min: Some(50.0), max: Some(120.0) })
        );
        assert_eq!(
            parse_income_bounds("기준중위소득 50% 이상"),
            Some(Bounds { min: Some(50.0), max: None })
        );
        assert_eq!(parse_income_bounds("암 환자 의료비 지원"), None);
    }

    #[test]
    fn test_parse_disability_bounds() {
        assert_eq!(
            parse_disability_bounds("장애 1급 ~ 3급 등록장애인"),
            Some(Bounds { min: Some(1.0), max: Some(3.0) })
        );
        assert_eq!(
            parse_disability_bounds("장애2급 이하"),
            Some(Bounds { min: None, max: Some(2.0) })
        );
        assert_eq!(parse_disability_bounds("장애인 보조기기"), None);
    }

    #[test]
    fn test_income_condition_drops_ineligible() {
        let doc = snippet("긴급 의료비", "중위소득 50% 이하 가구");
        let above = ProfileRecord {
            median_income_ratio: Some(80.0),
            ..profile()
        };
        let below = ProfileRecord {
            median_income_ratio: Some(45.0),
            ..profile()
        };
        assert!(!is_eligible(&above, &doc));
        assert!(is_eligible(&below, &doc));
        // Unknown income is never filtered
        assert!(is_eligible(&profile(), &doc));
    }

    #[test]
    fn test_income_multiple_is_percent() {
        let doc = snippet("재난적의료비", "기준중위소득 100% 이하");
        let ratio = |r| ProfileRecord {
            median_income_ratio: Some(r),
            ..profile()
        };
        assert!(is_eligible(&ratio(0.8), &doc));
        assert!(!is_eligible(&ratio(1.5), &doc));
        // Zero is a real ratio, not an absent one
        assert!(is_eligible(&ratio(0.0), &doc));
    }

    #[test]
    fn test_disability_range() {
        let doc = snippet("장애인 의료비", "장애1급~3급 등록 장애인");
        let grade = |g| ProfileRecord {
            disability_grade: Some(g),
            ..profile()
        };
        assert!(is_eligible(&grade(1), &doc));
        assert!(is_eligible(&grade(2), &doc));
        assert!(is_eligible(&profile(), &doc));
    }

    #[test]
    fn test_basic_benefit_requirement() {
        let recipients_only = snippet("본인부담 면제", "의료급여수급자 대상");
        let with_near_poor = snippet("본인부담 경감", "기초생활보장수급자 및 차상위계층");
        let none = ProfileRecord {
            basic_benefit_type: Some(BasicBenefit::None),
            ..profile()
        };
        let medical = ProfileRecord {
            basic_benefit_type: Some(BasicBenefit::Medical),
            ..profile()
        };

        assert!(!is_eligible(&none, &recipients_only));
        assert!(is_eligible(&medical, &recipients_only));
        assert!(is_eligible(&profile(), &recipients_only));
        assert!(is_eligible(&none, &with_near_poor));
    }
}
