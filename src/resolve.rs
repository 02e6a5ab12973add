// 🧭 Resolution Orchestrator - the full ingest pipeline
//
// Drives one record through validate → upsert-by-natural-key → match →
// decide → merge/review/create, then scales that pipeline across a worker
// pool. Correctness under concurrency comes from striped per-identifier
// locks: two records sharing a lock key (NPI, else normalized name) are
// resolved strictly one after the other, so they can never both create a
// fresh entity, and a merge holds the stripes of BOTH identities involved,
// so two workers consolidating into one golden record serialize instead of
// overwriting each other's writes. Transient store failures are retried
// with exponential backoff; cancellation is honored between records, never
// mid-merge.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{MdmConfig, RetryPolicy};
use crate::decision::{DecisionPolicy, MatchDecision};
use crate::error::{MdmError, Result};
use crate::matching::MatchingEngine;
use crate::merge::MergeEngine;
use crate::model::{NaturalKey, Provider, Relationship, Satellite};
use crate::quality::DataQualityEngine;
use crate::store::{GraphStore, PendingReview};
use crate::validation::QualityIssue;

const LOCK_STRIPES: usize = 64;

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Failed validation with error-severity issues; nothing was stored.
    Rejected { issues: Vec<QualityIssue> },
    /// Consolidated into an existing record carrying the same natural key.
    Updated { record_id: String },
    /// No plausible duplicate; stands as a new entity.
    Created { record_id: String },
    /// Auto-merged into a golden record.
    Merged { golden_id: String, score: f64 },
    /// Ambiguous match: every candidate at or above the review threshold is
    /// persisted for adjudication; the record stays active as its own entity
    /// in the meantime.
    Review {
        candidate_ids: Vec<String>,
        top_score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionOutcome {
    pub record_id: String,
    pub quality_score: f64,
    #[serde(flatten)]
    pub action: ResolutionAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub record_id: String,
    pub error: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub merged: usize,
    pub flagged_for_review: usize,
    pub rejected: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub outcomes: Vec<ResolutionOutcome>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    fn absorb(&mut self, result: WorkerResult) {
        match result {
            WorkerResult::Done(outcome) => {
                self.processed += 1;
                match &outcome.action {
                    ResolutionAction::Rejected { .. } => self.rejected += 1,
                    ResolutionAction::Updated { .. } => self.updated += 1,
                    ResolutionAction::Created { .. } => self.created += 1,
                    ResolutionAction::Merged { .. } => self.merged += 1,
                    ResolutionAction::Review { .. } => self.flagged_for_review += 1,
                }
                self.outcomes.push(outcome);
            }
            WorkerResult::Failed(record_id, error) => {
                self.failed += 1;
                self.failures.push(BatchFailure { record_id, error });
            }
            WorkerResult::Cancelled => self.cancelled += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "processed {} ({} created, {} updated, {} merged, {} review, {} rejected), {} failed, {} cancelled",
            self.processed,
            self.created,
            self.updated,
            self.merged,
            self.flagged_for_review,
            self.rejected,
            self.failed,
            self.cancelled
        )
    }
}

enum WorkerResult {
    Done(ResolutionOutcome),
    Failed(String, String),
    Cancelled,
}

/// What the match/decide phase wants done with a record. A merge cannot be
/// executed under the source's stripe alone, so it comes back as a plan the
/// caller runs after also taking the target's stripe.
enum Planned {
    Done(ResolutionOutcome),
    Merge {
        source_id: String,
        target_id: String,
        target_stripe: usize,
        score: f64,
    },
}

// ============================================================================
// KEYED LOCKS
// ============================================================================

/// Fixed-stripe lock table keyed by hash. Two equal keys always land on the
/// same stripe, so operations on the same identity serialize; distinct keys
/// rarely contend.
struct KeyedLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyedLocks {
    fn new(stripes: usize) -> Self {
        KeyedLocks {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    fn lock_stripe(&self, idx: usize) -> MutexGuard<'_, ()> {
        self.stripes[idx].lock().unwrap()
    }

    /// Both stripes, always taken in index order, so two workers locking the
    /// same pair from opposite ends cannot deadlock.
    fn lock_pair(&self, a: usize, b: usize) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let first = self.lock_stripe(lo);
        let second = (hi != lo).then(|| self.lock_stripe(hi));
        (first, second)
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry transient store failures with doubling backoff. Anything
/// non-transient fails immediately.
fn with_retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt: u32 = 0;
    let mut backoff = Duration::from_millis(policy.initial_backoff_ms);
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "transient store failure, retrying"
                );
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            other => return other,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct ResolutionOrchestrator {
    store: Arc<dyn GraphStore>,
    quality: DataQualityEngine,
    matching: MatchingEngine,
    decision: DecisionPolicy,
    merge: MergeEngine,
    retry: RetryPolicy,
    locks: KeyedLocks,
}

impl ResolutionOrchestrator {
    /// Construction validates the whole configuration up front; a bad config
    /// never makes it to record processing.
    pub fn new(config: MdmConfig, store: Arc<dyn GraphStore>) -> Result<Self> {
        config.validate()?;
        Ok(ResolutionOrchestrator {
            quality: DataQualityEngine::new(&config.data_quality_rules)?,
            matching: MatchingEngine::new(config.matching_weights.clone(), config.candidate_limit),
            decision: DecisionPolicy::new(config.decision_thresholds.clone())?,
            merge: MergeEngine::new(&config.data_quality_rules)?,
            retry: config.retry.clone(),
            locks: KeyedLocks::new(LOCK_STRIPES),
            store,
        })
    }

    /// Resolve one incoming record end to end.
    ///
    /// Store work runs under identity locks: the record's own stripe covers
    /// upsert/match/decide, and an auto-merge additionally takes the
    /// candidate's stripe before writing, so concurrent merges into one
    /// golden record serialize and the later one reads the earlier one's
    /// unioned state. If the candidate changes while the lock set is being
    /// widened, the record is re-planned against fresh store state.
    pub fn resolve(&self, incoming: Provider) -> Result<ResolutionOutcome> {
        let assessment = self.quality.assess(&incoming);
        if !assessment.is_valid {
            tracing::warn!(
                record_id = %incoming.record_id,
                issues = assessment.issues.len(),
                "record rejected by validation"
            );
            return Ok(ResolutionOutcome {
                record_id: incoming.record_id,
                quality_score: assessment.quality_score,
                action: ResolutionAction::Rejected {
                    issues: assessment.issues,
                },
            });
        }
        let quality_score = assessment.quality_score;

        let store = self.store.as_ref();
        let source_stripe = self.locks.stripe_of(&incoming.lock_key());
        let mut stored: Option<Provider> = None;

        loop {
            let planned = {
                let _guard = self.locks.lock_stripe(source_stripe);
                let current = match stored.take() {
                    None => {
                        // Natural-key upsert short-circuits matching: a shared
                        // NPI is a deterministic identity claim, not a
                        // similarity guess.
                        let written =
                            with_retry(&self.retry, || store.upsert_provider(&incoming))?;
                        if written.record_id != incoming.record_id {
                            tracing::info!(
                                record_id = %incoming.record_id,
                                existing_id = %written.record_id,
                                "record upserted onto existing natural-key entity"
                            );
                            return Ok(ResolutionOutcome {
                                record_id: incoming.record_id,
                                quality_score,
                                action: ResolutionAction::Updated {
                                    record_id: written.record_id,
                                },
                            });
                        }
                        written
                    }
                    // Re-planning after a lost merge race: read whatever the
                    // store holds now instead of re-writing the raw record.
                    Some(prev) => with_retry(&self.retry, || store.get_provider(&prev.record_id))?
                        .ok_or_else(|| MdmError::NotFound(prev.record_id.clone()))?,
                };
                if let Some(master) = current.master_record_id.clone() {
                    return Ok(ResolutionOutcome {
                        record_id: current.record_id,
                        quality_score,
                        action: ResolutionAction::Updated { record_id: master },
                    });
                }
                let planned = self.plan(&current, quality_score)?;
                stored = Some(current);
                planned
            };

            let (source_id, target_id, target_stripe, score) = match planned {
                Planned::Done(outcome) => return Ok(outcome),
                Planned::Merge {
                    source_id,
                    target_id,
                    target_stripe,
                    score,
                } => (source_id, target_id, target_stripe, score),
            };

            // A merge touches two identities and must hold both stripes for
            // the whole read-resolve-write.
            let _guards = self.locks.lock_pair(source_stripe, target_stripe);
            let target = with_retry(&self.retry, || store.get_provider(&target_id))?;
            match target {
                Some(target) if !target.is_retired() => {
                    let golden = with_retry(&self.retry, || {
                        self.merge.merge(&source_id, &target_id, score, store)
                    })?;
                    return Ok(ResolutionOutcome {
                        record_id: source_id,
                        quality_score,
                        action: ResolutionAction::Merged {
                            golden_id: golden.record_id,
                            score,
                        },
                    });
                }
                // candidate merged away while the lock set was being widened
                _ => continue,
            }
        }
    }

    /// Match + decide for an active stored record. Runs under the record's
    /// own stripe; an auto-merge decision comes back as a plan so the caller
    /// can take the candidate's stripe too before executing it.
    fn plan(&self, stored: &Provider, quality_score: f64) -> Result<Planned> {
        let store = self.store.as_ref();
        let matches = with_retry(&self.retry, || self.matching.find_candidates(stored, store))?;

        let action = match matches.first() {
            Some(top) => match self.decision.decide(top.score) {
                MatchDecision::AutoMerge => {
                    match with_retry(&self.retry, || store.get_provider(&top.candidate_id))? {
                        Some(candidate) => {
                            return Ok(Planned::Merge {
                                source_id: stored.record_id.clone(),
                                target_id: candidate.record_id.clone(),
                                target_stripe: self.locks.stripe_of(&candidate.lock_key()),
                                score: top.score,
                            });
                        }
                        None => ResolutionAction::Created {
                            record_id: stored.record_id.clone(),
                        },
                    }
                }
                MatchDecision::Review => {
                    let flagged: Vec<_> = matches
                        .iter()
                        .filter(|m| m.score >= self.decision.review_threshold())
                        .collect();
                    for candidate in &flagged {
                        let review = PendingReview {
                            record_id: stored.record_id.clone(),
                            candidate_id: candidate.candidate_id.clone(),
                            score: candidate.score,
                            created_at: chrono::Utc::now(),
                        };
                        with_retry(&self.retry, || store.mark_pending_review(&review))?;
                    }
                    tracing::info!(
                        record_id = %stored.record_id,
                        candidates = flagged.len(),
                        top_score = top.score,
                        "match flagged for review"
                    );
                    ResolutionAction::Review {
                        candidate_ids: flagged
                            .iter()
                            .map(|m| m.candidate_id.clone())
                            .collect(),
                        top_score: top.score,
                    }
                }
                MatchDecision::Reject => ResolutionAction::Created {
                    record_id: stored.record_id.clone(),
                },
            },
            None => ResolutionAction::Created {
                record_id: stored.record_id.clone(),
            },
        };

        Ok(Planned::Done(ResolutionOutcome {
            record_id: stored.record_id.clone(),
            quality_score,
            action,
        }))
    }

    /// Upsert a satellite entity and attach the provider to it.
    pub fn register_satellite(&self, record_id: &str, satellite: &Satellite) -> Result<()> {
        let key = satellite
            .natural_key()
            .unwrap_or_default();
        let store = self.store.as_ref();
        with_retry(&self.retry, || store.upsert_satellite(satellite))?;
        let rel = Relationship::new(satellite.relationship_kind(), &key);
        with_retry(&self.retry, || store.link(record_id, &rel))
    }

    /// Resolve a batch across `workers` threads.
    pub fn resolve_batch(&self, records: Vec<Provider>, workers: usize) -> BatchReport {
        self.resolve_batch_with_cancel(records, workers, &AtomicBool::new(false))
    }

    /// Batch resolution with cooperative cancellation: the flag is checked
    /// before each record, so no merge is abandoned halfway.
    pub fn resolve_batch_with_cancel(
        &self,
        records: Vec<Provider>,
        workers: usize,
        cancel: &AtomicBool,
    ) -> BatchReport {
        let workers = workers.max(1);
        let total = records.len();
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<Provider>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<WorkerResult>();
        for record in records {
            work_tx.send(record).unwrap();
        }
        drop(work_tx);

        let report = std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(record) = work_rx.recv() {
                        if cancel.load(Ordering::SeqCst) {
                            let _ = result_tx.send(WorkerResult::Cancelled);
                            continue;
                        }
                        let record_id = record.record_id.clone();
                        let result = match self.resolve(record) {
                            Ok(outcome) => WorkerResult::Done(outcome),
                            Err(e) => WorkerResult::Failed(record_id, e.to_string()),
                        };
                        let _ = result_tx.send(result);
                    }
                });
            }
            drop(result_tx);

            let mut report = BatchReport::default();
            for result in result_rx {
                report.absorb(result);
            }
            report
        });

        tracing::info!(total, summary = %report.summary(), "batch resolution finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchWeights;
    use crate::store::MemoryStore;

    fn orchestrator(config: MdmConfig, store: Arc<MemoryStore>) -> ResolutionOrchestrator {
        ResolutionOrchestrator::new(config, store).unwrap()
    }

    /// Weights that let contact + name similarity clear the default 0.85
    /// merge threshold without an identifier.
    fn contact_heavy_config() -> MdmConfig {
        MdmConfig {
            matching_weights: MatchWeights {
                exact_identifier: 0.0,
                fuzzy_name: 0.6,
                relationship_overlap: 0.0,
                license: 0.0,
                email: 0.2,
                phone: 0.2,
                candidate_floor: 0.3,
            },
            ..MdmConfig::default()
        }
    }

    fn provider(npi: Option<&str>, first: &str, last: &str) -> Provider {
        let mut p = Provider::new(first, last);
        p.npi = npi.map(|n| n.to_string());
        p
    }

    fn with_contact(mut p: Provider) -> Provider {
        p.email = Some("smith@clinic.example".to_string());
        p.phone = Some("+15551234567".to_string());
        p
    }

    #[test]
    fn test_first_record_is_created() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let outcome = o.resolve(provider(Some("1234567890"), "Jon", "Smith")).unwrap();
        assert!(matches!(outcome.action, ResolutionAction::Created { .. }));
        assert_eq!(outcome.quality_score, 1.0);
    }

    #[test]
    fn test_fuzzy_duplicate_auto_merges() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(contact_heavy_config(), store.clone());

        let first = o
            .resolve(with_contact(provider(None, "Jon", "Smith")))
            .unwrap();
        let second = o
            .resolve(with_contact(provider(None, "John", "Smith")))
            .unwrap();

        let (golden_id, score) = match &second.action {
            ResolutionAction::Merged { golden_id, score } => (golden_id.clone(), *score),
            other => panic!("expected Merged, got {:?}", other),
        };
        assert_eq!(Some(golden_id.as_str()), first_record_id(&first));
        assert!(score >= 0.85);

        // golden record flagged, source retired with lineage
        let golden = store.get_provider(&golden_id).unwrap().unwrap();
        assert!(golden.is_golden_record);
        let retired = store.get_provider(&second.record_id).unwrap().unwrap();
        assert_eq!(retired.master_record_id.as_deref(), Some(golden_id.as_str()));
        assert_eq!(store.merge_history().unwrap().len(), 1);
    }

    fn first_record_id(outcome: &ResolutionOutcome) -> Option<&str> {
        match &outcome.action {
            ResolutionAction::Created { record_id } => Some(record_id.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_ambiguous_match_goes_to_review() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(contact_heavy_config(), store.clone());

        // shared contact data but a clearly different name: lands mid-band
        let mut existing = with_contact(provider(None, "Jon", "Smith"));
        existing.record_id = "existing".to_string();
        store.insert_provider(&existing).unwrap();

        let outcome = o
            .resolve(with_contact(provider(None, "Maria", "Smithers")))
            .unwrap();
        match &outcome.action {
            ResolutionAction::Review {
                candidate_ids,
                top_score,
            } => {
                assert!(*top_score >= 0.50 && *top_score < 0.85);
                assert_eq!(candidate_ids, &vec!["existing".to_string()]);
            }
            other => panic!("expected Review, got {:?}", other),
        }

        // both records stay active, the pair is persisted for adjudication
        let reviews = store.pending_reviews().unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].candidate_id, "existing");
        assert!(store
            .get_provider(&outcome.record_id)
            .unwrap()
            .unwrap()
            .master_record_id
            .is_none());
    }

    #[test]
    fn test_every_reviewable_candidate_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(contact_heavy_config(), store.clone());

        // two plausible candidates in the review band
        let mut first = with_contact(provider(None, "Jon", "Smith"));
        first.record_id = "cand-a".to_string();
        let mut second = with_contact(provider(None, "Jan", "Smith"));
        second.record_id = "cand-b".to_string();
        store.insert_provider(&first).unwrap();
        store.insert_provider(&second).unwrap();

        let outcome = o
            .resolve(with_contact(provider(None, "Maria", "Smithers")))
            .unwrap();
        match &outcome.action {
            ResolutionAction::Review { candidate_ids, .. } => {
                assert_eq!(candidate_ids.len(), 2);
            }
            other => panic!("expected Review, got {:?}", other),
        }
        assert_eq!(store.pending_reviews().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_record_is_rejected_and_not_stored() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let bad = provider(Some("12AB"), "Jon", "Smith"); // npi_format is Error
        let record_id = bad.record_id.clone();
        let outcome = o.resolve(bad).unwrap();

        match outcome.action {
            ResolutionAction::Rejected { issues } => {
                assert!(issues.iter().any(|i| i.rule_id == "npi_format"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert!(store.get_provider(&record_id).unwrap().is_none());
    }

    #[test]
    fn test_missing_npi_is_only_a_warning() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let outcome = o.resolve(provider(None, "Jon", "Smith")).unwrap();
        assert!(matches!(outcome.action, ResolutionAction::Created { .. }));
        assert!(outcome.quality_score < 1.0);
    }

    #[test]
    fn test_same_npi_upserts_onto_existing() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let first = o.resolve(provider(Some("1234567890"), "Jon", "Smith")).unwrap();
        let second = o
            .resolve(provider(Some("1234567890"), "Jonathan", "Smith"))
            .unwrap();

        let existing_id = match &second.action {
            ResolutionAction::Updated { record_id } => record_id.clone(),
            other => panic!("expected Updated, got {:?}", other),
        };
        assert_eq!(Some(existing_id.as_str()), first_record_id(&first));

        let stored = store.get_provider(&existing_id).unwrap().unwrap();
        assert_eq!(stored.first_name, "Jonathan");
        // no merge happened, only an in-place upsert
        assert!(store.merge_history().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_same_identifier_yields_single_entity() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let records: Vec<Provider> = (0..8)
            .map(|i| provider(Some("1234567890"), &format!("Jon{}", i), "Smith"))
            .collect();
        let report = o.resolve_batch(records, 4);

        assert_eq!(report.processed, 8);
        assert_eq!(report.failed, 0);
        // the lock serializes the identifier: one create, the rest upsert
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 7);
        assert!(store.find_by_npi("1234567890").unwrap().is_some());
    }

    #[test]
    fn test_concurrent_merges_into_shared_candidate_keep_all_relationships() {
        use crate::model::RelationshipKind;

        let store = Arc::new(MemoryStore::new());
        let config = MdmConfig {
            matching_weights: MatchWeights {
                exact_identifier: 0.0,
                fuzzy_name: 1.0,
                relationship_overlap: 0.0,
                license: 0.0,
                email: 0.0,
                phone: 0.0,
                candidate_floor: 0.3,
            },
            ..MdmConfig::default()
        };
        let o = orchestrator(config, store.clone());

        // one stored candidate both sources score highest against
        let mut target = provider(Some("1234567890"), "Jon", "Smith");
        target.record_id = "target".to_string();
        target.link(Relationship::new(RelationshipKind::PracticesAt, "loc-x"));
        store.insert_provider(&target).unwrap();

        // the sources carry different lock keys, so only the candidate's
        // stripe serializes their merges
        let mut one = provider(None, "John", "Smith");
        one.link(Relationship::new(RelationshipKind::AffiliatedWith, "org-y"));
        let mut two = provider(None, "Jona", "Smith");
        two.link(Relationship::new(RelationshipKind::HasCredential, "cred-z"));
        let source_ids = [one.record_id.clone(), two.record_id.clone()];

        let report = o.resolve_batch(vec![one, two], 2);
        assert_eq!(report.merged, 2);
        assert_eq!(report.failed, 0);

        // both merges landed on the same golden record and neither merge
        // overwrote the other's relationship union
        let golden = store.get_provider("target").unwrap().unwrap();
        assert!(golden.is_golden_record);
        for key in ["loc-x", "org-y", "cred-z"] {
            assert!(
                golden.relationships.iter().any(|r| r.target_key == key),
                "golden record lost relationship {}",
                key
            );
        }
        for source_id in &source_ids {
            let retired = store.get_provider(source_id).unwrap().unwrap();
            assert_eq!(retired.master_record_id.as_deref(), Some("target"));
        }
        assert_eq!(store.merge_history().unwrap().len(), 2);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        store.fail_next_ops(2);
        let outcome = o.resolve(provider(Some("1234567890"), "Jon", "Smith")).unwrap();
        assert!(matches!(outcome.action, ResolutionAction::Created { .. }));
    }

    #[test]
    fn test_retries_exhaust_into_failure() {
        let store = Arc::new(MemoryStore::new());
        let mut config = MdmConfig::default();
        config.retry.max_retries = 1;
        config.retry.initial_backoff_ms = 1;
        let o = orchestrator(config, store.clone());

        store.fail_next_ops(10);
        let err = o
            .resolve(provider(Some("1234567890"), "Jon", "Smith"))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_cancellation_skips_remaining_records() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let records: Vec<Provider> = (0..5)
            .map(|i| provider(None, &format!("Jon{}", i), "Smith"))
            .collect();
        let cancel = AtomicBool::new(true);
        let report = o.resolve_batch_with_cancel(records, 2, &cancel);

        assert_eq!(report.cancelled, 5);
        assert_eq!(report.processed, 0);
        assert!(store.pending_reviews().unwrap().is_empty());
        assert!(store.merge_history().unwrap().is_empty());
    }

    #[test]
    fn test_batch_report_counts() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let report = o.resolve_batch(
            vec![
                provider(Some("1234567890"), "Jon", "Smith"),
                provider(Some("1234567890"), "Jonathan", "Smith"),
                provider(Some("12AB"), "Bad", "Npi"),
                provider(None, "Maria", "Garcia"),
            ],
            2,
        );

        assert_eq!(report.processed, 4);
        assert_eq!(report.created + report.updated, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed, 0);
        assert!(report.summary().contains("processed 4"));
    }

    #[test]
    fn test_register_satellite_links_provider() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(MdmConfig::default(), store.clone());

        let outcome = o.resolve(provider(Some("1234567890"), "Jon", "Smith")).unwrap();
        let record_id = match &outcome.action {
            ResolutionAction::Created { record_id } => record_id.clone(),
            other => panic!("expected Created, got {:?}", other),
        };

        let sat = Satellite::Specialty(crate::model::Specialty {
            specialty_code: "cardio".to_string(),
            specialty_name: "Cardiology".to_string(),
            taxonomy_code: None,
            board_certified: true,
        });
        o.register_satellite(&record_id, &sat).unwrap();

        let stored = store.get_provider(&record_id).unwrap().unwrap();
        assert!(stored
            .relationships
            .iter()
            .any(|r| r.target_key == "cardio"));
        assert!(store.get_satellite("cardio").unwrap().is_some());
    }
}
