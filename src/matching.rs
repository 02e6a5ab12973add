// 🎯 Matching Engine - weighted candidate scoring
//
// Retrieves a bounded candidate set through cheap blocking filters, then
// scores each pair as Σ(weight × component score) over the configured
// component scorers. Candidates below the floor are discarded entirely.
// Output is deterministic: ranked by score descending, ties broken by
// candidate id ascending.

use serde::{Deserialize, Serialize};

use crate::config::MatchWeights;
use crate::error::Result;
use crate::model::{NaturalKey, Provider};
use crate::similarity::{digits_only, exact_match, fuzzy_similarity, jaccard};
use crate::store::{CandidateFilter, GraphStore};

// ============================================================================
// MATCH RESULT
// ============================================================================

/// One component scorer's output for a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchComponent {
    pub scorer: String,
    pub score: f64,
    pub weight: f64,
}

impl MatchComponent {
    pub fn contribution(&self) -> f64 {
        self.score * self.weight
    }
}

/// Ephemeral comparison result for one record/candidate pair. Only persisted
/// (as a pending review edge) when it crosses the review threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub record_id: String,
    pub candidate_id: String,
    pub components: Vec<MatchComponent>,
    /// Weighted aggregate: Σ(weight × component score).
    pub score: f64,
    /// Attributes that matched outright, for the audit trail.
    pub matched_attributes: Vec<String>,
}

// ============================================================================
// MATCHING ENGINE
// ============================================================================

pub struct MatchingEngine {
    weights: MatchWeights,
    candidate_limit: usize,
}

impl MatchingEngine {
    pub fn new(weights: MatchWeights, candidate_limit: usize) -> Self {
        MatchingEngine {
            weights,
            candidate_limit,
        }
    }

    /// Find plausible duplicates of `record` in the store.
    ///
    /// Identical record + identical store state + identical config yields an
    /// identical ranked list.
    pub fn find_candidates(
        &self,
        record: &Provider,
        store: &dyn GraphStore,
    ) -> Result<Vec<MatchResult>> {
        let filter = CandidateFilter::for_provider(record);
        let candidates = store.find_candidates(&filter, self.candidate_limit)?;

        let mut results: Vec<MatchResult> = candidates
            .iter()
            .map(|candidate| self.score_pair(record, candidate))
            .filter(|r| r.score >= self.weights.candidate_floor)
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });

        tracing::debug!(
            record_id = %record.record_id,
            retrieved = candidates.len(),
            kept = results.len(),
            "scored candidate set"
        );

        Ok(results)
    }

    /// Weighted aggregate score for one pair.
    pub fn score_pair(&self, record: &Provider, candidate: &Provider) -> MatchResult {
        let w = &self.weights;
        let mut components = Vec::new();
        let mut matched = Vec::new();

        let identifier_score = match (record.natural_key(), candidate.natural_key()) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        };
        if identifier_score == 1.0 {
            matched.push("npi".to_string());
        }
        components.push(MatchComponent {
            scorer: "exact_identifier".to_string(),
            score: identifier_score,
            weight: w.exact_identifier,
        });

        let name_score = fuzzy_similarity(&record.display_name(), &candidate.display_name());
        if name_score > 0.9 {
            matched.push("name".to_string());
        }
        components.push(MatchComponent {
            scorer: "fuzzy_name".to_string(),
            score: name_score,
            weight: w.fuzzy_name,
        });

        let overlap = jaccard(&record.relationships, &candidate.relationships);
        components.push(MatchComponent {
            scorer: "relationship_overlap".to_string(),
            score: overlap,
            weight: w.relationship_overlap,
        });

        let license_score = match (record.license_number.as_deref(), candidate.license_number.as_deref())
        {
            (Some(a), Some(b)) if exact_match(a, b) => 1.0,
            _ => 0.0,
        };
        if license_score == 1.0 {
            matched.push("license_number".to_string());
        }
        components.push(MatchComponent {
            scorer: "license".to_string(),
            score: license_score,
            weight: w.license,
        });

        let email_score = match (record.email.as_deref(), candidate.email.as_deref()) {
            (Some(a), Some(b))
                if !a.trim().is_empty() && a.trim().to_lowercase() == b.trim().to_lowercase() =>
            {
                1.0
            }
            _ => 0.0,
        };
        if email_score == 1.0 {
            matched.push("email".to_string());
        }
        components.push(MatchComponent {
            scorer: "email".to_string(),
            score: email_score,
            weight: w.email,
        });

        let phone_score = match (record.phone.as_deref(), candidate.phone.as_deref()) {
            (Some(a), Some(b)) => {
                let (a, b) = (digits_only(a), digits_only(b));
                if !a.is_empty() && a == b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        if phone_score == 1.0 {
            matched.push("phone".to_string());
        }
        components.push(MatchComponent {
            scorer: "phone".to_string(),
            score: phone_score,
            weight: w.phone,
        });

        let score = components.iter().map(|c| c.contribution()).sum();

        MatchResult {
            record_id: record.record_id.clone(),
            candidate_id: candidate.record_id.clone(),
            components,
            score,
            matched_attributes: matched,
        }
    }
}
