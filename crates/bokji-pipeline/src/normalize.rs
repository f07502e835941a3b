//! Profile attribute vocabulary and free-text normalization.
//!
//! Every `normalize_*` function returns `Ok(None)` when the input means
//! "absent", `Ok(Some(_))` for a recognized value, and `Err` when the input
//! is present but cannot be mapped. Absent and rejected are kept apart so
//! the profile writer can report partial extractions.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound accepted for the income-to-median ratio, in percent
pub const MAX_INCOME_RATIO: f64 = 300.0;

/// A present value outside the vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {field}: {value:?}")]
pub struct Rejected {
    pub field: &'static str,
    pub value: String,
}

impl Rejected {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

pub type Normalized<T> = std::result::Result<Option<T>, Rejected>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsuranceType {
    Employed,
    Local,
    Dependent,
    #[serde(rename = "MEDICAL_AID_1")]
    MedicalAid1,
    #[serde(rename = "MEDICAL_AID_2")]
    MedicalAid2,
}

impl InsuranceType {
    pub fn label(&self) -> &'static str {
        match self {
            InsuranceType::Employed => "직장가입자",
            InsuranceType::Local => "지역가입자",
            InsuranceType::Dependent => "피부양자",
            InsuranceType::MedicalAid1 => "의료급여 1종",
            InsuranceType::MedicalAid2 => "의료급여 2종",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BasicBenefit {
    None,
    Livelihood,
    Medical,
    Housing,
    Education,
}

impl BasicBenefit {
    pub fn label(&self) -> &'static str {
        match self {
            BasicBenefit::None => "없음",
            BasicBenefit::Livelihood => "생계급여",
            BasicBenefit::Medical => "의료급여",
            BasicBenefit::Housing => "주거급여",
            BasicBenefit::Education => "교육급여",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LtciGrade {
    None,
    G1,
    G2,
    G3,
    G4,
    G5,
    Cognitive,
}

impl LtciGrade {
    pub fn label(&self) -> &'static str {
        match self {
            LtciGrade::None => "없음",
            LtciGrade::G1 => "1등급",
            LtciGrade::G2 => "2등급",
            LtciGrade::G3 => "3등급",
            LtciGrade::G4 => "4등급",
            LtciGrade::G5 => "5등급",
            LtciGrade::Cognitive => "인지지원등급",
        }
    }
}

/// Render an extracted JSON value as trimmed text. Null means absent.
pub fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Disability grade: 1 (severe) or 2 (not severe). Zero and "unregistered" are absent.
pub fn normalize_disability_grade(raw: Option<&str>) -> Normalized<u8> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    match s {
        "0" | "미등록" | "없음" | "무" | "unregistered" | "none" => Ok(None),
        "1" | "1급" | "심한" | "심한 장애" => Ok(Some(1)),
        "2" | "2급" | "심하지 않음" | "심하지 않은" | "심하지 않은 장애" => Ok(Some(2)),
        _ => Err(Rejected::new("disability_grade", s)),
    }
}

/// Income-to-median ratio in percent, rounded to two places. Zero is a value.
pub fn normalize_income_ratio(raw: Option<&str>) -> Normalized<f64> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '%').collect();
    let ratio: f64 = cleaned
        .trim()
        .parse()
        .map_err(|_| Rejected::new("median_income_ratio", s))?;
    if !ratio.is_finite() || !(0.0..=MAX_INCOME_RATIO).contains(&ratio) {
        return Err(Rejected::new("median_income_ratio", s));
    }
    Ok(Some((ratio * 100.0).round() / 100.0))
}

/// Birth date as `YYYY-MM-DD`, also accepting the compact `YYYYMMDD`
pub fn normalize_birth_date(raw: Option<&str>) -> Normalized<NaiveDate> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    let format = if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        "%Y%m%d"
    } else {
        "%Y-%m-%d"
    };
    NaiveDate::parse_from_str(s, format)
        .map(Some)
        .map_err(|_| Rejected::new("birth_date", s))
}

pub fn normalize_sex(raw: Option<&str>) -> Normalized<Sex> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    match s.to_lowercase().as_str() {
        "m" | "male" | "1" | "남" | "남성" | "남자" => Ok(Some(Sex::M)),
        "f" | "female" | "2" | "여" | "여성" | "여자" => Ok(Some(Sex::F)),
        _ => Err(Rejected::new("sex", s)),
    }
}

pub fn normalize_insurance_type(raw: Option<&str>) -> Normalized<InsuranceType> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    let upper = s.to_uppercase();
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let value = match upper.as_str() {
        "EMPLOYED" => InsuranceType::Employed,
        "LOCAL" => InsuranceType::Local,
        "DEPENDENT" => InsuranceType::Dependent,
        "MEDICAL_AID_1" => InsuranceType::MedicalAid1,
        "MEDICAL_AID_2" => InsuranceType::MedicalAid2,
        _ if compact.contains("의료급여") => {
            if compact.contains('2') {
                InsuranceType::MedicalAid2
            } else {
                InsuranceType::MedicalAid1
            }
        }
        _ if compact.contains("피부양") => InsuranceType::Dependent,
        _ if compact.contains("직장") => InsuranceType::Employed,
        _ if compact.contains("지역") => InsuranceType::Local,
        _ => return Err(Rejected::new("insurance_type", s)),
    };
    Ok(Some(value))
}

pub fn normalize_basic_benefit(raw: Option<&str>) -> Normalized<BasicBenefit> {
    let Some(s) = present(raw) else {
        return Ok(None);
    };
    let value = match s.to_uppercase().as_str() {
        "NONE" | "없음" | "비수급" => BasicBenefit::None,
        "LIVELIHOOD" => BasicBenefit::Livelihood,
        "MEDICAL" => BasicBenefit::Medical,
        "HOUSING" => BasicBenefit::Housing,
        "EDUCATION" => BasicBenefit::Education,
        _ if s.starts_with("생계") => BasicBenefit::Livelihood,
        _ if s.starts_with("의료") => BasicBenefit::Medical,
        _ if s.starts_with("주거") => BasicBenefit::Housing,
        _ if s.starts_with("교육") => BasicBenefit::Education,
        _ => return Err(Rejected::new("basic_benefit_type", s)),
    };
    Ok(Some(value))
}

/// Long-term-care grade. Blank input is treated as `NONE`, matching the stored default.
pub fn normalize_ltci_grade(raw: Option<&str>) -> Normalized<LtciGrade> {
    let Some(s) = raw.map(str::trim) else {
        return Ok(None);
    };
    let compact: String = s
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let value = match compact.as_str() {
        "" | "NONE" | "없음" | "미등록" => LtciGrade::None,
        "G1" | "1" | "1등급" => LtciGrade::G1,
        "G2" | "2" | "2등급" => LtciGrade::G2,
        "G3" | "3" | "3등급" => LtciGrade::G3,
        "G4" | "4" | "4등급" => LtciGrade::G4,
        "G5" | "5" | "5등급" => LtciGrade::G5,
        "COGNITIVE" | "인지지원" | "인지지원등급" => LtciGrade::Cognitive,
        _ => return Err(Rejected::new("ltci_grade", s)),
    };
    Ok(Some(value))
}

/// Pregnancy or within twelve months postpartum. Absent means `false`.
pub fn normalize_pregnancy(raw: Option<&str>) -> bool {
    let Some(s) = present(raw) else {
        return false;
    };
    matches!(
        s.to_lowercase().as_str(),
        "true" | "yes" | "y" | "1" | "임신" | "출산" | "임신중" | "임신 중" | "출산후" | "출산후12개월이내" | "산모" | "예"
    )
}

/// Residency district, kept as free text
pub fn normalize_residency(raw: Option<&str>) -> Option<String> {
    present(raw).map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disability_grade_absent_forms() {
        for input in [Some("0"), Some("미등록"), Some(""), None] {
            assert_eq!(normalize_disability_grade(input), Ok(None), "{input:?}");
        }
        assert_eq!(normalize_disability_grade(Some("1")), Ok(Some(1)));
        assert_eq!(normalize_disability_grade(Some("2")), Ok(Some(2)));
        assert!(normalize_disability_grade(Some("7")).is_err());
    }

    #[test]
    fn test_income_ratio_zero_is_present() {
        assert_eq!(normalize_income_ratio(Some("0")), Ok(Some(0.0)));
        assert_eq!(normalize_income_ratio(Some("")), Ok(None));
        assert_eq!(normalize_income_ratio(None), Ok(None));
    }

    #[test]
    fn test_income_ratio_cleanup_and_rounding() {
        assert_eq!(normalize_income_ratio(Some("45.678")), Ok(Some(45.68)));
        assert_eq!(normalize_income_ratio(Some("1,20%")), Ok(Some(120.0)));
        assert!(normalize_income_ratio(Some("-5")).is_err());
        assert!(normalize_income_ratio(Some("301")).is_err());
        assert!(normalize_income_ratio(Some("낮음")).is_err());
    }

    #[test]
    fn test_birth_date_forms() {
        let expected = NaiveDate::from_ymd_opt(1957, 3, 9);
        assert_eq!(normalize_birth_date(Some("1957-03-09")), Ok(expected));
        assert_eq!(normalize_birth_date(Some("19570309")), Ok(expected));
        assert!(normalize_birth_date(Some("1957-13-09")).is_err());
        assert!(normalize_birth_date(Some("57/03/09")).is_err());
    }

    #[test]
    fn test_sex_labels() {
        assert_eq!(normalize_sex(Some("남")), Ok(Some(Sex::M)));
        assert_eq!(normalize_sex(Some("Female")), Ok(Some(Sex::F)));
        assert_eq!(normalize_sex(Some("2")), Ok(Some(Sex::F)));
        assert_eq!(normalize_sex(None), Ok(None));
    }

    #[test]
    fn test_insurance_labels() {
        assert_eq!(
            normalize_insurance_type(Some("의료급여 2종")),
            Ok(Some(InsuranceType::MedicalAid2))
        );
        assert_eq!(
            normalize_insurance_type(Some("의료급여1종")),
            Ok(Some(InsuranceType::MedicalAid1))
        );
        assert_eq!(
            normalize_insurance_type(Some("직장가입자")),
            Ok(Some(InsuranceType::Employed))
        );
        assert_eq!(
            normalize_insurance_type(Some("MEDICAL_AID_2")),
            Ok(Some(InsuranceType::MedicalAid2))
        );
        assert!(normalize_insurance_type(Some("민간보험")).is_err());
    }

    #[test]
    fn test_basic_benefit_and_ltci() {
        assert_eq!(normalize_basic_benefit(Some("주거급여")), Ok(Some(BasicBenefit::Housing)));
        assert_eq!(normalize_basic_benefit(Some("없음")), Ok(Some(BasicBenefit::None)));
        assert_eq!(normalize_ltci_grade(Some("")), Ok(Some(LtciGrade::None)));
        assert_eq!(normalize_ltci_grade(None), Ok(None));
        assert_eq!(normalize_ltci_grade(Some("3등급")), Ok(Some(LtciGrade::G3)));
        assert_eq!(normalize_ltci_grade(Some("인지지원 등급")), Ok(Some(LtciGrade::Cognitive)));
    }

    #[test]
    fn test_pregnancy_defaults_false() {
        assert!(!normalize_pregnancy(None));
        assert!(!normalize_pregnancy(Some("")));
        assert!(normalize_pregnancy(Some("출산")));
        assert!(normalize_pregnancy(Some("true")));
        assert!(!normalize_pregnancy(Some("false")));
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(Some(&Value::Null)), None);
        assert_eq!(value_text(None), None);
        assert_eq!(value_text(Some(&serde_json::json!(0))), Some("0".into()));
        assert_eq!(value_text(Some(&serde_json::json!(" 서울 "))), Some("서울".into()));
    }
}
