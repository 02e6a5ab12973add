// 🪙 Merge Engine - golden-record consolidation with lineage
//
// Consolidates a source record into a target, resolving field conflicts by
// data-quality score (recency breaks ties), unioning relationships, and
// appending exactly one immutable history entry per effective merge. Merges
// are logical: the source record is retired behind a lineage pointer, never
// deleted, so every merge decision stays reconstructable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QualityRule;
use crate::error::{MdmError, Result};
use crate::model::Provider;
use crate::quality::DataQualityEngine;
use crate::store::{GraphStore, MergeWrite};

// ============================================================================
// MERGE HISTORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// Winner's record had the higher quality score.
    HigherQuality,
    /// Quality scores tied; winner was updated more recently.
    MoreRecent,
}

/// How one field-level conflict was resolved. Recorded only when both
/// records carried a value and the values differed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub source_value: Option<String>,
    pub target_value: Option<String>,
    pub winner: ConflictWinner,
    pub reason: ResolutionReason,
}

/// Append-only audit entry. Created only by the merge engine, immutable once
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeHistory {
    pub merge_id: String,
    pub source_id: String,
    pub target_id: String,
    /// Match score that triggered the merge.
    pub score: f64,
    pub merged_at: DateTime<Utc>,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeHistory {
    fn new(source_id: &str, target_id: &str, score: f64, conflicts: Vec<FieldConflict>) -> Self {
        MergeHistory {
            merge_id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            score,
            merged_at: Utc::now(),
            conflicts,
        }
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine {
    quality: DataQualityEngine,
}

impl MergeEngine {
    pub fn new(rules: &[QualityRule]) -> Result<Self> {
        Ok(MergeEngine {
            quality: DataQualityEngine::new(rules)?,
        })
    }

    /// Consolidate `source_id` into `target_id`, returning the golden record.
    ///
    /// Idempotent at the target state: a self-merge and a repeat of an
    /// already-applied merge both succeed without appending history, so
    /// retrying after a partial failure converges.
    pub fn merge(
        &self,
        source_id: &str,
        target_id: &str,
        score: f64,
        store: &dyn GraphStore,
    ) -> Result<Provider> {
        if source_id == target_id {
            return store
                .get_provider(source_id)?
                .ok_or_else(|| MdmError::NotFound(source_id.to_string()));
        }

        let source = store
            .get_provider(source_id)?
            .ok_or_else(|| MdmError::NotFound(source_id.to_string()))?;
        let target = store
            .get_provider(target_id)?
            .ok_or_else(|| MdmError::NotFound(target_id.to_string()))?;

        // Already applied: converge without duplicating history.
        if source.master_record_id.as_deref() == Some(target_id) {
            return Ok(target);
        }

        let source_quality = self.quality.assess(&source).quality_score;
        let target_quality = self.quality.assess(&target).quality_score;
        let source_wins = source_quality > target_quality
            || (source_quality == target_quality && source.updated_at > target.updated_at);
        let reason = if source_quality == target_quality {
            ResolutionReason::MoreRecent
        } else {
            ResolutionReason::HigherQuality
        };

        let mut resolver = FieldResolver {
            source_wins,
            reason,
            conflicts: Vec::new(),
        };

        let mut golden = target.clone();
        golden.npi = resolver.resolve("npi", source.npi.clone(), target.npi.clone());
        golden.first_name = resolver
            .resolve("first_name", opt(&source.first_name), opt(&target.first_name))
            .unwrap_or_default();
        golden.last_name = resolver
            .resolve("last_name", opt(&source.last_name), opt(&target.last_name))
            .unwrap_or_default();
        golden.middle_name =
            resolver.resolve("middle_name", source.middle_name.clone(), target.middle_name.clone());
        golden.email = resolver.resolve("email", source.email.clone(), target.email.clone());
        golden.phone = resolver.resolve("phone", source.phone.clone(), target.phone.clone());
        golden.license_number = resolver.resolve(
            "license_number",
            source.license_number.clone(),
            target.license_number.clone(),
        );

        // No relationship is ever dropped.
        golden
            .relationships
            .extend(source.relationships.iter().cloned());
        golden.is_golden_record = true;
        golden.confidence_score = Some(score);
        golden.touch();

        let mut retired = source.clone();
        retired.master_record_id = Some(target.record_id.clone());
        retired.touch();

        let history = MergeHistory::new(source_id, target_id, score, resolver.conflicts);
        let conflict_count = history.conflicts.len();
        let write = MergeWrite {
            golden: golden.clone(),
            source: retired,
            history,
        };

        store.apply_merge(&write).map_err(|e| match e {
            // transient failures bubble up for the orchestrator's retry loop
            MdmError::TransientStore { .. } => e,
            other => MdmError::MergeConflict {
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
                stage: "apply_merge".to_string(),
                reason: other.to_string(),
            },
        })?;

        tracing::info!(
            source_id,
            target_id,
            score,
            conflicts = conflict_count,
            "merged record into golden record"
        );

        Ok(golden)
    }
}

struct FieldResolver {
    source_wins: bool,
    reason: ResolutionReason,
    conflicts: Vec<FieldConflict>,
}

impl FieldResolver {
    /// Field-level policy: a value present on only one side is taken; when
    /// both sides carry different values the configured winner takes the
    /// field and the conflict is recorded.
    fn resolve(
        &mut self,
        field: &str,
        source: Option<String>,
        target: Option<String>,
    ) -> Option<String> {
        match (&source, &target) {
            (None, None) => None,
            (Some(_), None) => source,
            (None, Some(_)) => target,
            (Some(s), Some(t)) if s == t => target,
            (Some(_), Some(_)) => {
                self.conflicts.push(FieldConflict {
                    field: field.to_string(),
                    source_value: source.clone(),
                    target_value: target.clone(),
                    winner: if self.source_wins {
                        ConflictWinner::Source
                    } else {
                        ConflictWinner::Target
                    },
                    reason: self.reason,
                });
                if self.source_wins {
                    source
                } else {
                    target
                }
            }
        }
    }
}

fn opt(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_quality_rules, RecordField, RulePredicate, Severity};
    use crate::model::{Relationship, RelationshipKind};
    use crate::store::{CandidateFilter, MemoryStore, PendingReview};

    /// Quality depends only on npi presence: with-npi records score 1.0,
    /// without-npi 0.9. Keeps quality ordering under test control.
    fn npi_only_rules() -> Vec<QualityRule> {
        vec![QualityRule {
            id: "npi_recommended".to_string(),
            field: RecordField::Npi,
            predicate: RulePredicate::Required,
            severity: Severity::Warning,
            weight: 0.1,
        }]
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(&npi_only_rules()).unwrap()
    }

    fn provider(npi: Option<&str>, first: &str, last: &str) -> Provider {
        let mut p = Provider::new(first, last);
        p.npi = npi.map(|n| n.to_string());
        p
    }

    #[test]
    fn test_higher_quality_record_wins_conflicts() {
        let store = MemoryStore::new();
        // source has npi → quality 1.0; target lacks it → 0.9
        let source = provider(Some("1234567890"), "John", "Smith");
        let target = provider(None, "Jon", "Smith");
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        let golden = engine()
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();

        assert_eq!(golden.first_name, "John");
        assert!(golden.is_golden_record);
        assert_eq!(golden.confidence_score, Some(0.9));

        let history = store.merge_history().unwrap();
        assert_eq!(history.len(), 1);
        let conflict = &history[0].conflicts[0];
        assert_eq!(conflict.field, "first_name");
        assert_eq!(conflict.winner, ConflictWinner::Source);
        assert_eq!(conflict.reason, ResolutionReason::HigherQuality);
    }

    #[test]
    fn test_quality_tie_falls_back_to_recency() {
        let store = MemoryStore::new();
        let mut older = provider(Some("1111111111"), "Jon", "Smith");
        older.updated_at = Utc::now() - chrono::Duration::hours(1);
        let newer = provider(Some("2222222222"), "John", "Smith");
        store.insert_provider(&older).unwrap();
        store.insert_provider(&newer).unwrap();

        // equal quality, newer source wins
        let golden = engine()
            .merge(&newer.record_id, &older.record_id, 0.9, &store)
            .unwrap();
        assert_eq!(golden.first_name, "John");

        let history = store.merge_history().unwrap();
        assert!(history[0]
            .conflicts
            .iter()
            .all(|c| c.reason == ResolutionReason::MoreRecent));
    }

    #[test]
    fn test_one_sided_values_fill_without_conflict() {
        let store = MemoryStore::new();
        let mut source = provider(None, "Jon", "Smith");
        source.email = Some("jon@clinic.example".to_string());
        let mut target = provider(Some("1234567890"), "Jon", "Smith");
        target.phone = Some("+15551234567".to_string());
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        let golden = engine()
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();

        assert_eq!(golden.email.as_deref(), Some("jon@clinic.example"));
        assert_eq!(golden.phone.as_deref(), Some("+15551234567"));
        assert!(store.merge_history().unwrap()[0].conflicts.is_empty());
    }

    #[test]
    fn test_relationships_union_without_loss() {
        let store = MemoryStore::new();
        let mut source = provider(None, "Jon", "Smith");
        source.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
        source.link(Relationship::new(RelationshipKind::HasSpecialty, "cardio"));
        let mut target = provider(Some("1234567890"), "Jon", "Smith");
        target.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
        target.link(Relationship::new(RelationshipKind::AffiliatedWith, "org1"));
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        let golden = engine()
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();
        assert_eq!(golden.relationships.len(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = MemoryStore::new();
        let source = provider(None, "Jon", "Smith");
        let target = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        let e = engine();
        let first = e
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();
        let second = e
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();

        assert_eq!(first.relationships, second.relationships);
        // exactly one history entry despite the repeat
        assert_eq!(store.merge_history().unwrap().len(), 1);
    }

    #[test]
    fn test_self_merge_is_a_noop() {
        let store = MemoryStore::new();
        let p = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&p).unwrap();

        let golden = engine().merge(&p.record_id, &p.record_id, 1.0, &store).unwrap();
        assert_eq!(golden.record_id, p.record_id);
        assert!(store.merge_history().unwrap().is_empty());
    }

    #[test]
    fn test_source_record_survives_with_lineage() {
        let store = MemoryStore::new();
        let source = provider(None, "Jon", "Smith");
        let target = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        engine()
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap();

        let retired = store.get_provider(&source.record_id).unwrap().unwrap();
        assert_eq!(
            retired.master_record_id.as_deref(),
            Some(target.record_id.as_str())
        );
        // retired records never come back as candidates
        let filter = CandidateFilter::for_provider(&provider(None, "Jon", "Smith"));
        let candidates = store.find_candidates(&filter, 10).unwrap();
        assert!(candidates.iter().all(|c| c.record_id != source.record_id));
    }

    #[test]
    fn test_missing_record_is_an_error() {
        let store = MemoryStore::new();
        let p = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&p).unwrap();

        assert!(matches!(
            engine().merge(&p.record_id, "missing", 0.9, &store),
            Err(MdmError::NotFound(_))
        ));
    }

    #[test]
    fn test_consolidation_is_order_independent() {
        // A (rich, with npi), B (sparse subset of A), C (own contact data).
        // Consolidating via B or directly must converge to the same golden
        // attribute and relationship sets when quality is held constant.
        let build = || {
            let store = MemoryStore::new();
            let mut a = provider(Some("1234567890"), "John", "Smith");
            a.email = Some("john@clinic.example".to_string());
            a.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
            let b = provider(None, "John", "Smith");
            let mut c = provider(None, "Jon", "Smith");
            c.phone = Some("+15551234567".to_string());
            c.link(Relationship::new(RelationshipKind::AffiliatedWith, "org1"));
            store.insert_provider(&a).unwrap();
            store.insert_provider(&b).unwrap();
            store.insert_provider(&c).unwrap();
            (store, a, b, c)
        };
        let e = engine();

        // path 1: A → B, then B → C
        let (store1, a1, b1, c1) = build();
        e.merge(&a1.record_id, &b1.record_id, 0.9, &store1).unwrap();
        e.merge(&b1.record_id, &c1.record_id, 0.9, &store1).unwrap();
        let golden1 = store1.get_provider(&c1.record_id).unwrap().unwrap();

        // path 2: A → C directly, then B → C
        let (store2, a2, b2, c2) = build();
        e.merge(&a2.record_id, &c2.record_id, 0.9, &store2).unwrap();
        e.merge(&b2.record_id, &c2.record_id, 0.9, &store2).unwrap();
        let golden2 = store2.get_provider(&c2.record_id).unwrap().unwrap();

        assert_eq!(golden1.npi, golden2.npi);
        assert_eq!(golden1.first_name, golden2.first_name);
        assert_eq!(golden1.email, golden2.email);
        assert_eq!(golden1.phone, golden2.phone);
        assert_eq!(golden1.relationships, golden2.relationships);
    }

    #[test]
    fn test_permanent_store_failure_surfaces_as_merge_conflict() {
        struct FailingApply(MemoryStore);

        impl GraphStore for FailingApply {
            fn insert_provider(&self, p: &Provider) -> crate::error::Result<()> {
                self.0.insert_provider(p)
            }
            fn upsert_provider(&self, p: &Provider) -> crate::error::Result<Provider> {
                self.0.upsert_provider(p)
            }
            fn get_provider(&self, id: &str) -> crate::error::Result<Option<Provider>> {
                self.0.get_provider(id)
            }
            fn find_by_npi(&self, npi: &str) -> crate::error::Result<Option<Provider>> {
                self.0.find_by_npi(npi)
            }
            fn upsert_satellite(&self, s: &crate::model::Satellite) -> crate::error::Result<()> {
                self.0.upsert_satellite(s)
            }
            fn get_satellite(
                &self,
                key: &str,
            ) -> crate::error::Result<Option<crate::model::Satellite>> {
                self.0.get_satellite(key)
            }
            fn link(&self, id: &str, rel: &Relationship) -> crate::error::Result<()> {
                self.0.link(id, rel)
            }
            fn find_candidates(
                &self,
                filter: &CandidateFilter,
                limit: usize,
            ) -> crate::error::Result<Vec<Provider>> {
                self.0.find_candidates(filter, limit)
            }
            fn search_providers(
                &self,
                query: &str,
                limit: usize,
            ) -> crate::error::Result<Vec<Provider>> {
                self.0.search_providers(query, limit)
            }
            fn apply_merge(&self, _write: &MergeWrite) -> crate::error::Result<()> {
                Err(MdmError::Storage {
                    operation: "apply_merge".to_string(),
                    reason: "disk full".to_string(),
                })
            }
            fn mark_pending_review(&self, r: &PendingReview) -> crate::error::Result<()> {
                self.0.mark_pending_review(r)
            }
            fn pending_reviews(&self) -> crate::error::Result<Vec<PendingReview>> {
                self.0.pending_reviews()
            }
            fn merge_history(&self) -> crate::error::Result<Vec<MergeHistory>> {
                self.0.merge_history()
            }
        }

        let store = FailingApply(MemoryStore::new());
        let source = provider(None, "Jon", "Smith");
        let target = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&source).unwrap();
        store.insert_provider(&target).unwrap();

        let err = engine()
            .merge(&source.record_id, &target.record_id, 0.9, &store)
            .unwrap_err();
        match err {
            MdmError::MergeConflict {
                source_id,
                target_id,
                stage,
                ..
            } => {
                assert_eq!(source_id, source.record_id);
                assert_eq!(target_id, target.record_id);
                assert_eq!(stage, "apply_merge");
            }
            other => panic!("expected MergeConflict, got {:?}", other),
        }
        // nothing was applied
        assert!(store.merge_history().unwrap().is_empty());
        let untouched = store.get_provider(&source.record_id).unwrap().unwrap();
        assert!(untouched.master_record_id.is_none());
    }

    #[test]
    fn test_default_rules_scenario_prefers_higher_quality_name() {
        // the classic pair: N1/"Jon Smith" with a malformed identifier vs an
        // identifier-less but otherwise cleaner "John Smith"
        let store = MemoryStore::new();
        let mut weak = Provider::new("Jon", "Smith");
        weak.npi = Some("N1".to_string()); // fails the 10-digit format rule
        let strong = Provider::new("John", "Smith");
        store.insert_provider(&weak).unwrap();
        store.insert_provider(&strong).unwrap();

        let e = MergeEngine::new(&default_quality_rules()).unwrap();
        let golden = e
            .merge(&strong.record_id, &weak.record_id, 0.9, &store)
            .unwrap();
        assert_eq!(golden.first_name, "John");
    }
}
