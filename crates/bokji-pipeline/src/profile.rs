//! Fixed nine-attribute user profile: storage, COALESCE upsert and the
//! profile writer that feeds it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::capability::Extractor;
use crate::dispatch::{WriteOutcome, Writer};
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::normalize::{
    self, BasicBenefit, InsuranceType, LtciGrade, Normalized, Rejected, Sex, value_text,
};
use crate::state::RoutingDecision;

/// Stored profile row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub residency: Option<String>,
    pub insurance_type: Option<InsuranceType>,
    pub median_income_ratio: Option<f64>,
    pub basic_benefit_type: Option<BasicBenefit>,
    pub disability_grade: Option<u8>,
    pub ltci_grade: Option<LtciGrade>,
    #[serde(default)]
    pub pregnant_or_postpartum: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Normalized values extracted from one utterance. `None` never overwrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub residency: Option<String>,
    pub insurance_type: Option<InsuranceType>,
    pub median_income_ratio: Option<f64>,
    pub basic_benefit_type: Option<BasicBenefit>,
    pub disability_grade: Option<u8>,
    pub ltci_grade: Option<LtciGrade>,
    pub pregnant_or_postpartum: Option<bool>,
}

fn keep<T>(slot: Normalized<T>, rejected: &mut Vec<Rejected>) -> Option<T> {
    match slot {
        Ok(v) => v,
        Err(r) => {
            rejected.push(r);
            None
        }
    }
}

impl ProfilePatch {
    /// Normalize an extraction object. Unmappable values are returned separately.
    pub fn from_extraction(raw: &Value) -> (Self, Vec<Rejected>) {
        let mut rejected = Vec::new();
        let text = |key: &str| value_text(raw.get(key));

        let pregnancy = text("pregnant_or_postpartum");
        let patch = Self {
            birth_date: keep(
                normalize::normalize_birth_date(text("birth_date").as_deref()),
                &mut rejected,
            ),
            sex: keep(normalize::normalize_sex(text("sex").as_deref()), &mut rejected),
            residency: normalize::normalize_residency(text("residency").as_deref()),
            insurance_type: keep(
                normalize::normalize_insurance_type(text("insurance_type").as_deref()),
                &mut rejected,
            ),
            median_income_ratio: keep(
                normalize::normalize_income_ratio(text("median_income_ratio").as_deref()),
                &mut rejected,
            ),
            basic_benefit_type: keep(
                normalize::normalize_basic_benefit(text("basic_benefit_type").as_deref()),
                &mut rejected,
            ),
            disability_grade: keep(
                normalize::normalize_disability_grade(text("disability_grade").as_deref()),
                &mut rejected,
            ),
            ltci_grade: keep(
                normalize::normalize_ltci_grade(text("ltci_grade").as_deref()),
                &mut rejected,
            ),
            pregnant_or_postpartum: pregnancy
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| normalize::normalize_pregnancy(Some(s))),
        };
        (patch, rejected)
    }

    /// Names of the fields this patch would write
    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.birth_date.is_some() {
            fields.push("birth_date");
        }
        if self.sex.is_some() {
            fields.push("sex");
        }
        if self.residency.is_some() {
            fields.push("residency");
        }
        if self.insurance_type.is_some() {
            fields.push("insurance_type");
        }
        if self.median_income_ratio.is_some() {
            fields.push("median_income_ratio");
        }
        if self.basic_benefit_type.is_some() {
            fields.push("basic_benefit_type");
        }
        if self.disability_grade.is_some() {
            fields.push("disability_grade");
        }
        if self.ltci_grade.is_some() {
            fields.push("ltci_grade");
        }
        if self.pregnant_or_postpartum.is_some() {
            fields.push("pregnant_or_postpartum");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }
}

impl ProfileRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// COALESCE merge: present patch values win, absent ones keep the stored value
    pub fn merge(&mut self, patch: &ProfilePatch) {
        fn coalesce<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if let Some(v) = incoming {
                *slot = Some(v.clone());
            }
        }
        coalesce(&mut self.birth_date, &patch.birth_date);
        coalesce(&mut self.sex, &patch.sex);
        coalesce(&mut self.residency, &patch.residency);
        coalesce(&mut self.insurance_type, &patch.insurance_type);
        coalesce(&mut self.median_income_ratio, &patch.median_income_ratio);
        coalesce(&mut self.basic_benefit_type, &patch.basic_benefit_type);
        coalesce(&mut self.disability_grade, &patch.disability_grade);
        coalesce(&mut self.ltci_grade, &patch.ltci_grade);
        if let Some(p) = patch.pregnant_or_postpartum {
            self.pregnant_or_postpartum = p;
        }
        self.updated_at = Some(Utc::now());
    }

    /// Age in completed years on `today`
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        let birth = self.birth_date?;
        let mut age = today.year() - birth.year();
        if (today.month(), today.day()) < (birth.month(), birth.day()) {
            age -= 1;
        }
        u32::try_from(age).ok()
    }

    /// One-line description used in prompts
    pub fn summary_line(&self, age: Option<u32>) -> String {
        let mut parts = Vec::new();
        if let Some(age) = age {
            parts.push(format!("연령 {age}세"));
        }
        if let Some(ins) = self.insurance_type {
            parts.push(format!("건보자격 {}", ins.label()));
        }
        if let Some(ratio) = self.median_income_ratio {
            parts.push(format!("중위소득 {ratio:.1}%"));
        }
        if let Some(benefit) = self.basic_benefit_type {
            if benefit != BasicBenefit::None {
                parts.push(format!("기초생활보장 {}", benefit.label()));
            }
        }
        match self.disability_grade {
            Some(1) => parts.push("장애등급 심한 장애".to_string()),
            Some(2) => parts.push("장애등급 심하지 않은 장애".to_string()),
            _ => {}
        }
        if let Some(ltci) = self.ltci_grade {
            if ltci != LtciGrade::None {
                parts.push(format!("장기요양 {}", ltci.label()));
            }
        }
        if self.pregnant_or_postpartum {
            parts.push("임신/출산 12개월 이내".to_string());
        }
        parts.join(", ")
    }
}

/// Profile as presented to generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileContext {
    pub profile: ProfileRecord,
    pub age: Option<u32>,
    pub summary: String,
}

impl ProfileContext {
    pub fn from_record(profile: ProfileRecord, today: NaiveDate) -> Self {
        let age = profile.age_on(today);
        let summary = profile.summary_line(age);
        Self {
            profile,
            age,
            summary,
        }
    }
}

/// Profile persistence keyed by user id
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<ProfileRecord>>;

    /// Insert or COALESCE-merge, returning the stored row
    async fn upsert(&self, user_id: &str, patch: &ProfilePatch) -> Result<ProfileRecord>;
}

/// In-process profile store
#[derive(Default)]
pub struct MemoryProfileStore {
    rows: Mutex<HashMap<String, ProfileRecord>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ProfileRecord) {
        self.rows.lock().insert(record.user_id.clone(), record);
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, user_id: &str) -> Result<Option<ProfileRecord>> {
        Ok(self.rows.lock().get(user_id).cloned())
    }

    async fn upsert(&self, user_id: &str, patch: &ProfilePatch) -> Result<ProfileRecord> {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(user_id.to_string())
            .or_insert_with(|| ProfileRecord::new(user_id));
        row.merge(patch);
        Ok(row.clone())
    }
}

/// Extracts the nine attributes from an utterance and upserts them
pub struct ProfileWriter {
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn ProfileStore>,
}

impl ProfileWriter {
    pub fn new(extractor: Arc<dyn Extractor>, store: Arc<dyn ProfileStore>) -> Self {
        Self { extractor, store }
    }

    async fn try_write(&self, user_id: &str, text: &str, guard: &CallGuard) -> Result<WriteOutcome> {
        let raw = guard
            .call("extract_profile", self.extractor.extract_profile(text))
            .await?;
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| Error::Parse(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::Schema("profile extraction is not an object".into()));
        }

        let (patch, rejected) = ProfilePatch::from_extraction(&value);
        for r in &rejected {
            warn!(user_id, field = r.field, value = %r.value, "profile value rejected");
        }
        if patch.is_empty() {
            return Ok(if rejected.is_empty() {
                WriteOutcome::Skipped
            } else {
                WriteOutcome::Partial {
                    applied: Vec::new(),
                    rejected: rejected.iter().map(ToString::to_string).collect(),
                }
            });
        }

        self.store.upsert(user_id, &patch).await?;
        let applied: Vec<String> = patch.applied_fields().into_iter().map(String::from).collect();
        info!(user_id, fields = ?applied, "profile upserted");

        Ok(if rejected.is_empty() {
            WriteOutcome::Committed { applied }
        } else {
            WriteOutcome::Partial {
                applied,
                rejected: rejected.iter().map(ToString::to_string).collect(),
            }
        })
    }
}

#[async_trait]
impl Writer for ProfileWriter {
    fn name(&self) -> &'static str {
        "profile"
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
                warn!(user_id, error = %e, "profile write failed");
                WriteOutcome::Failed {
                    reason: e.kind().to_string(),
                }
            }
        }
    }
}
