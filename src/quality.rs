// 📊 Data Quality Engine - weighted scoring over configured rules
//
// Shares rule evaluation with the Validator, so the issue list here is
// identical to the validation report for the same record. The score is
// 1.0 minus the weighted sum of violated rules, floored at 0.0.
// Deterministic and side-effect free; only the latest result is meaningful.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QualityRule;
use crate::error::Result;
use crate::model::Provider;
use crate::validation::{QualityIssue, Validator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityResult {
    pub record_id: String,
    pub is_valid: bool,
    pub issues: Vec<QualityIssue>,
    /// 1.0 - Σ(violated rule weights), floored at 0.0.
    pub quality_score: f64,
    pub checked_at: DateTime<Utc>,
}

impl DataQualityResult {
    pub fn summary(&self) -> String {
        format!(
            "record {}: quality {:.2}, {} issue(s), valid: {}",
            self.record_id,
            self.quality_score,
            self.issues.len(),
            self.is_valid
        )
    }
}

#[derive(Clone)]
pub struct DataQualityEngine {
    validator: Validator,
}

impl DataQualityEngine {
    pub fn new(rules: &[QualityRule]) -> Result<Self> {
        Ok(DataQualityEngine {
            validator: Validator::new(rules)?,
        })
    }

    pub fn assess(&self, record: &Provider) -> DataQualityResult {
        let issues = self.validator.evaluate(record);
        let penalty: f64 = issues.iter().map(|i| i.weight).sum();
        let is_valid = !issues
            .iter()
            .any(|i| i.severity == crate::config::Severity::Error);

        DataQualityResult {
            record_id: record.record_id.clone(),
            is_valid,
            issues,
            quality_score: (1.0 - penalty).max(0.0),
            checked_at: Utc::now(),
        }
    }

    pub fn assess_batch(&self, records: &[Provider]) -> Vec<DataQualityResult> {
        records.iter().map(|r| self.assess(r)).collect()
    }
}
