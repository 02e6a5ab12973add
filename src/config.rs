// ⚙️ Configuration - rules, weights, and thresholds as data
//
// Everything the engines branch on lives here, loaded once at startup and
// validated before the first record is processed. Malformed configuration is
// a fatal Configuration error, never a per-record fallback.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{MdmError, Result};
use crate::model::Provider;

// ============================================================================
// DATA QUALITY RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Structural violation. A record with any error-severity issue is not
    /// upserted.
    Error,
    /// Questionable or incomplete data. Lowers the quality score only.
    Warning,
}

/// Provider fields addressable by quality rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Npi,
    FirstName,
    LastName,
    Email,
    Phone,
    LicenseNumber,
}

impl RecordField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Npi => "npi",
            RecordField::FirstName => "first_name",
            RecordField::LastName => "last_name",
            RecordField::Email => "email",
            RecordField::Phone => "phone",
            RecordField::LicenseNumber => "license_number",
        }
    }

    /// Extract the field value; empty strings count as absent.
    pub fn value_of(&self, p: &Provider) -> Option<String> {
        let value = match self {
            RecordField::Npi => p.npi.clone(),
            RecordField::FirstName => Some(p.first_name.clone()),
            RecordField::LastName => Some(p.last_name.clone()),
            RecordField::Email => p.email.clone(),
            RecordField::Phone => p.phone.clone(),
            RecordField::LicenseNumber => p.license_number.clone(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulePredicate {
    /// Field must be present and non-empty.
    Required,
    /// Field must match the regex when present. Absent values pass; pair
    /// with a Required rule to also demand presence.
    Pattern { pattern: String },
    /// Field must not exceed `max` characters when present.
    MaxLength { max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRule {
    pub id: String,
    pub field: RecordField,
    pub predicate: RulePredicate,
    pub severity: Severity,
    /// Deducted from the quality score when the rule is violated.
    pub weight: f64,
}

// ============================================================================
// MATCHING WEIGHTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchWeights {
    pub exact_identifier: f64,
    pub fuzzy_name: f64,
    pub relationship_overlap: f64,
    pub license: f64,
    pub email: f64,
    pub phone: f64,
    /// Candidates scoring below this floor are discarded entirely.
    pub candidate_floor: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        MatchWeights {
            exact_identifier: 0.40,
            fuzzy_name: 0.25,
            relationship_overlap: 0.15,
            license: 0.10,
            email: 0.05,
            phone: 0.05,
            candidate_floor: 0.30,
        }
    }
}

// ============================================================================
// DECISION THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    pub merge_threshold: f64,
    pub review_threshold: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        DecisionThresholds {
            merge_threshold: 0.85,
            review_threshold: 0.50,
        }
    }
}

impl DecisionThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.review_threshold < 0.0 {
            return Err(MdmError::Configuration(format!(
                "review_threshold must be >= 0, got {}",
                self.review_threshold
            )));
        }
        if self.merge_threshold <= self.review_threshold {
            return Err(MdmError::Configuration(format!(
                "merge_threshold ({}) must be greater than review_threshold ({})",
                self.merge_threshold, self.review_threshold
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt, for transient store failures only.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 25,
        }
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    pub data_quality_rules: Vec<QualityRule>,
    pub matching_weights: MatchWeights,
    pub decision_thresholds: DecisionThresholds,
    pub retry: RetryPolicy,
    /// Upper bound on the candidate set retrieved from the store.
    pub candidate_limit: usize,
}

impl Default for MdmConfig {
    fn default() -> Self {
        MdmConfig {
            data_quality_rules: default_quality_rules(),
            matching_weights: MatchWeights::default(),
            decision_thresholds: DecisionThresholds::default(),
            retry: RetryPolicy::default(),
            candidate_limit: 50,
        }
    }
}

/// Baseline rule set for provider records: identifier format, contact field
/// formats, license number shape.
pub fn default_quality_rules() -> Vec<QualityRule> {
    vec![
        QualityRule {
            id: "npi_recommended".to_string(),
            field: RecordField::Npi,
            predicate: RulePredicate::Required,
            severity: Severity::Warning,
            weight: 0.10,
        },
        QualityRule {
            id: "npi_format".to_string(),
            field: RecordField::Npi,
            predicate: RulePredicate::Pattern {
                pattern: r"^\d{10}$".to_string(),
            },
            severity: Severity::Error,
            weight: 0.20,
        },
        QualityRule {
            id: "last_name_present".to_string(),
            field: RecordField::LastName,
            predicate: RulePredicate::Required,
            severity: Severity::Warning,
            weight: 0.10,
        },
        QualityRule {
            id: "email_format".to_string(),
            field: RecordField::Email,
            predicate: RulePredicate::Pattern {
                pattern: r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$".to_string(),
            },
            severity: Severity::Warning,
            weight: 0.10,
        },
        QualityRule {
            id: "phone_format".to_string(),
            field: RecordField::Phone,
            predicate: RulePredicate::Pattern {
                pattern: r"^\+?1?\d{10,15}$".to_string(),
            },
            severity: Severity::Warning,
            weight: 0.10,
        },
        QualityRule {
            id: "license_format".to_string(),
            field: RecordField::LicenseNumber,
            predicate: RulePredicate::Pattern {
                pattern: r"^[A-Z0-9]{5,20}$".to_string(),
            },
            severity: Severity::Warning,
            weight: 0.10,
        },
    ]
}

impl MdmConfig {
    /// Load and validate configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            MdmError::Configuration(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: MdmConfig = serde_json::from_str(content)
            .map_err(|e| MdmError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed configuration before any record is processed.
    pub fn validate(&self) -> Result<()> {
        self.decision_thresholds.validate()?;

        let w = &self.matching_weights;
        let weights = [
            ("exact_identifier", w.exact_identifier),
            ("fuzzy_name", w.fuzzy_name),
            ("relationship_overlap", w.relationship_overlap),
            ("license", w.license),
            ("email", w.email),
            ("phone", w.phone),
            ("candidate_floor", w.candidate_floor),
        ];
        for (name, value) in weights {
            if value < 0.0 || !value.is_finite() {
                return Err(MdmError::Configuration(format!(
                    "matching weight {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if self.candidate_limit == 0 {
            return Err(MdmError::Configuration(
                "candidate_limit must be at least 1".to_string(),
            ));
        }

        for rule in &self.data_quality_rules {
            if rule.weight < 0.0 || rule.weight > 1.0 {
                return Err(MdmError::Configuration(format!(
                    "rule {}: weight must be in [0, 1], got {}",
                    rule.id, rule.weight
                )));
            }
            if let RulePredicate::Pattern { pattern } = &rule.predicate {
                Regex::new(pattern).map_err(|e| {
                    MdmError::Configuration(format!(
                        "rule {}: invalid pattern {:?}: {}",
                        rule.id, pattern, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
