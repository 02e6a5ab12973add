// ✅ Record Validator - structural validation over configured rules
//
// Fails closed: every violation becomes an issue, never a panic or an
// early exit, so one malformed record cannot halt a batch. A record with at
// least one error-severity issue is rejected by the orchestrator; warnings
// only lower the quality score.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{QualityRule, RulePredicate, Severity};
use crate::error::{MdmError, Result};
use crate::model::Provider;

// ============================================================================
// ISSUES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub rule_id: String,
    pub field: String,
    pub severity: Severity,
    pub message: String,
    /// Quality-score deduction carried by this issue.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub record_id: String,
    /// Ordered: built-in identity check first, then configured rule order.
    pub issues: Vec<QualityIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

#[derive(Clone)]
struct CompiledRule {
    rule: QualityRule,
    regex: Option<Regex>,
}

/// Pure function over a record and the configured rule set. Patterns are
/// compiled once at startup; a bad pattern is a Configuration error before
/// any record is processed.
#[derive(Clone)]
pub struct Validator {
    rules: Vec<CompiledRule>,
}

impl Validator {
    pub fn new(rules: &[QualityRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = match &rule.predicate {
                RulePredicate::Pattern { pattern } => Some(Regex::new(pattern).map_err(|e| {
                    MdmError::Configuration(format!(
                        "rule {}: invalid pattern {:?}: {}",
                        rule.id, pattern, e
                    ))
                })?),
                _ => None,
            };
            compiled.push(CompiledRule {
                rule: rule.clone(),
                regex,
            });
        }
        Ok(Validator { rules: compiled })
    }

    pub fn validate(&self, record: &Provider) -> ValidationReport {
        ValidationReport {
            record_id: record.record_id.clone(),
            issues: self.evaluate(record),
        }
    }

    /// For callers that want rejection as an error value instead of a
    /// report, e.g. ingest paths that bail on the first bad record.
    pub fn ensure_valid(&self, record: &Provider) -> Result<ValidationReport> {
        let report = self.validate(record);
        if report.is_valid() {
            Ok(report)
        } else {
            Err(MdmError::Validation {
                record_id: report.record_id.clone(),
                issue_count: report.issues.len(),
            })
        }
    }

    /// Evaluate all rules against a record. Shared with the data quality
    /// engine so both report identical issues for the same record.
    pub(crate) fn evaluate(&self, record: &Provider) -> Vec<QualityIssue> {
        let mut issues = Vec::new();

        // Invariant: a record missing both identifier and name cannot be
        // matched against anything and must be rejected.
        if !record.has_npi() && !record.has_name() {
            issues.push(QualityIssue {
                rule_id: "record_identity".to_string(),
                field: "npi".to_string(),
                severity: Severity::Error,
                message: "record has neither identifier nor name".to_string(),
                weight: 1.0,
            });
        }

        for compiled in &self.rules {
            let rule = &compiled.rule;
            let value = rule.field.value_of(record);

            let violation = match &rule.predicate {
                RulePredicate::Required => {
                    value.is_none().then(|| format!("{} is required", rule.field.as_str()))
                }
                RulePredicate::Pattern { .. } => value.as_deref().and_then(|v| {
                    let regex = compiled.regex.as_ref().expect("pattern compiled at startup");
                    (!regex.is_match(v))
                        .then(|| format!("{} fails pattern check", rule.field.as_str()))
                }),
                RulePredicate::MaxLength { max } => value.as_deref().and_then(|v| {
                    (v.chars().count() > *max)
                        .then(|| format!("{} exceeds {} characters", rule.field.as_str(), max))
                }),
            };

            if let Some(message) = violation {
                issues.push(QualityIssue {
                    rule_id: rule.id.clone(),
                    field: rule.field.as_str().to_string(),
                    severity: rule.severity,
                    message,
                    weight: rule.weight,
                });
            }
        }

        issues
    }
}
