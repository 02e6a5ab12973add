// ⚖️ Decision Policy - score → auto-merge / review / reject
//
// Two configured thresholds partition the score line. The merge boundary is
// inclusive: a score exactly at merge_threshold auto-merges.

use serde::{Deserialize, Serialize};

use crate::config::DecisionThresholds;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchDecision {
    AutoMerge,
    Review,
    Reject,
}

impl MatchDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchDecision::AutoMerge => "AUTO_MERGE",
            MatchDecision::Review => "REVIEW",
            MatchDecision::Reject => "REJECT",
        }
    }
}

pub struct DecisionPolicy {
    thresholds: DecisionThresholds,
}

impl DecisionPolicy {
    /// Construction validates the thresholds; a violating configuration is a
    /// fatal startup error, not a runtime fallback.
    pub fn new(thresholds: DecisionThresholds) -> Result<Self> {
        thresholds.validate()?;
        Ok(DecisionPolicy { thresholds })
    }

    /// Total function: every score lands in exactly one outcome.
    pub fn decide(&self, score: f64) -> MatchDecision {
        if score >= self.thresholds.merge_threshold {
            MatchDecision::AutoMerge
        } else if score >= self.thresholds.review_threshold {
            MatchDecision::Review
        } else {
            MatchDecision::Reject
        }
    }

    pub fn review_threshold(&self) -> f64 {
        self.thresholds.review_threshold
    }

    pub fn merge_threshold(&self) -> f64 {
        self.thresholds.merge_threshold
    }
}
