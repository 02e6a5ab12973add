// 🗄️ Graph Store contract + in-memory adapter
//
// The core reads and writes entities through five primitives: natural-key
// upsert, relationship union, bounded candidate lookup, atomic merge write,
// and append-only history. Any store satisfying this trait is substitutable;
// `MemoryStore` backs tests and small batches, `db::SqliteStore` is the
// durable adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::error::{MdmError, Result};
use crate::merge::MergeHistory;
use crate::model::{NaturalKey, Provider, Relationship, Satellite};
use crate::similarity::normalize_name;

// ============================================================================
// CANDIDATE FILTER
// ============================================================================

/// Cheap blocking filters for candidate retrieval. A candidate qualifies by
/// matching ANY populated filter; retired (already-merged) records and the
/// record being resolved never qualify. This is deliberately coarse - the
/// matching engine does the real scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFilter {
    pub npi: Option<String>,
    /// Prefix of the normalized "last first" name.
    pub name_prefix: Option<String>,
    /// Satellite natural keys the record is related to.
    pub relationship_keys: BTreeSet<String>,
    pub exclude_record_id: Option<String>,
}

impl CandidateFilter {
    /// Blocking keys for a provider: identifier, normalized last-name prefix,
    /// and shared satellite relationships.
    pub fn for_provider(record: &Provider) -> Self {
        let name_norm = record.name_norm();
        let name_prefix = if name_norm.is_empty() {
            None
        } else {
            Some(name_norm.chars().take(4).collect())
        };

        CandidateFilter {
            npi: record.natural_key(),
            name_prefix,
            relationship_keys: record
                .relationships
                .iter()
                .map(|r| r.target_key.clone())
                .collect(),
            exclude_record_id: Some(record.record_id.clone()),
        }
    }

    pub fn matches(&self, candidate: &Provider) -> bool {
        if candidate.is_retired() {
            return false;
        }
        if self.exclude_record_id.as_deref() == Some(candidate.record_id.as_str()) {
            return false;
        }

        if let (Some(npi), Some(candidate_npi)) = (&self.npi, candidate.natural_key()) {
            if *npi == candidate_npi {
                return true;
            }
        }

        if let Some(prefix) = &self.name_prefix {
            if !prefix.is_empty() && candidate.name_norm().starts_with(prefix.as_str()) {
                return true;
            }
        }

        candidate
            .relationships
            .iter()
            .any(|r| self.relationship_keys.contains(&r.target_key))
    }
}

// ============================================================================
// MERGE WRITE & PENDING REVIEW
// ============================================================================

/// The full end state of a merge, applied as one atomic transaction:
/// golden attributes, source lineage redirect, and the history append either
/// all land or none do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeWrite {
    pub golden: Provider,
    pub source: Provider,
    pub history: MergeHistory,
}

/// A match that crossed the review threshold, persisted as a pending
/// relationship awaiting adjudication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub record_id: String,
    pub candidate_id: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// GRAPH STORE TRAIT
// ============================================================================

pub trait GraphStore: Send + Sync {
    /// Insert a record under its surrogate id, keeping any existing record
    /// with the same natural key. Used when a source record must be
    /// preserved alongside the entity it merges into.
    fn insert_provider(&self, provider: &Provider) -> Result<()>;

    /// Upsert by natural key: updates the active record with the same NPI if
    /// one exists (attributes overwritten, relationships unioned), otherwise
    /// inserts. Returns the stored record.
    fn upsert_provider(&self, provider: &Provider) -> Result<Provider>;

    fn get_provider(&self, record_id: &str) -> Result<Option<Provider>>;

    /// Active (not merged-away) record carrying this NPI, if any.
    fn find_by_npi(&self, npi: &str) -> Result<Option<Provider>>;

    fn upsert_satellite(&self, satellite: &Satellite) -> Result<()>;

    fn get_satellite(&self, natural_key: &str) -> Result<Option<Satellite>>;

    /// Relationship create/union: attaching an existing edge is a no-op.
    fn link(&self, record_id: &str, rel: &Relationship) -> Result<()>;

    /// Bounded candidate lookup. Never a full-scan result: at most `limit`
    /// records, ordered by record id ascending.
    fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Provider>>;

    /// Ad-hoc lookup for operators: active records whose normalized name or
    /// lowercased email contains the query as a substring. Bounded like
    /// candidate lookup; a blank query matches nothing.
    fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<Provider>>;

    /// Atomic multi-write for a merge. Partial application is a correctness
    /// violation.
    fn apply_merge(&self, write: &MergeWrite) -> Result<()>;

    /// Persist a match awaiting adjudication. Re-marking the same pair
    /// replaces the previous entry.
    fn mark_pending_review(&self, review: &PendingReview) -> Result<()>;

    fn pending_reviews(&self) -> Result<Vec<PendingReview>>;

    /// Append-only audit stream. There is no mutation API for history.
    fn merge_history(&self) -> Result<Vec<MergeHistory>>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct MemoryState {
    providers: BTreeMap<String, Provider>,
    satellites: BTreeMap<String, Satellite>,
    pending_reviews: Vec<PendingReview>,
    history: Vec<MergeHistory>,
}

/// In-memory store guarded by a single RwLock, so every multi-entity write
/// is naturally atomic. Supports injected transient failures for exercising
/// the orchestrator's retry path.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    transient_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: the next `n` store operations fail with a transient
    /// error before touching state.
    pub fn fail_next_ops(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn check_fault(&self, operation: &str) -> Result<()> {
        let fault = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if fault {
            return Err(MdmError::TransientStore {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl GraphStore for MemoryStore {
    fn insert_provider(&self, provider: &Provider) -> Result<()> {
        self.check_fault("insert_provider")?;
        let mut state = self.state.write().unwrap();
        state
            .providers
            .insert(provider.record_id.clone(), provider.clone());
        Ok(())
    }

    fn upsert_provider(&self, provider: &Provider) -> Result<Provider> {
        self.check_fault("upsert_provider")?;
        let mut state = self.state.write().unwrap();

        let existing_id = provider.natural_key().and_then(|key| {
            state
                .providers
                .values()
                .find(|p| !p.is_retired() && p.natural_key().as_deref() == Some(key.as_str()))
                .map(|p| p.record_id.clone())
        });

        let stored = match existing_id {
            Some(id) => {
                let existing = state.providers.get_mut(&id).expect("indexed record exists");
                merge_upsert(existing, provider);
                existing.clone()
            }
            None => {
                state
                    .providers
                    .insert(provider.record_id.clone(), provider.clone());
                provider.clone()
            }
        };
        Ok(stored)
    }

    fn get_provider(&self, record_id: &str) -> Result<Option<Provider>> {
        self.check_fault("get_provider")?;
        let state = self.state.read().unwrap();
        Ok(state.providers.get(record_id).cloned())
    }

    fn find_by_npi(&self, npi: &str) -> Result<Option<Provider>> {
        self.check_fault("find_by_npi")?;
        let key = normalize_name(npi);
        let state = self.state.read().unwrap();
        Ok(state
            .providers
            .values()
            .find(|p| !p.is_retired() && p.natural_key().as_deref() == Some(key.as_str()))
            .cloned())
    }

    fn upsert_satellite(&self, satellite: &Satellite) -> Result<()> {
        self.check_fault("upsert_satellite")?;
        let key = satellite
            .natural_key()
            .ok_or_else(|| MdmError::NotFound("satellite without natural key".to_string()))?;
        let mut state = self.state.write().unwrap();
        state.satellites.insert(key, satellite.clone());
        Ok(())
    }

    fn get_satellite(&self, natural_key: &str) -> Result<Option<Satellite>> {
        self.check_fault("get_satellite")?;
        let state = self.state.read().unwrap();
        Ok(state.satellites.get(natural_key).cloned())
    }

    fn link(&self, record_id: &str, rel: &Relationship) -> Result<()> {
        self.check_fault("link")?;
        let mut state = self.state.write().unwrap();
        let provider = state
            .providers
            .get_mut(record_id)
            .ok_or_else(|| MdmError::NotFound(record_id.to_string()))?;
        provider.link(rel.clone());
        provider.touch();
        Ok(())
    }

    fn find_candidates(&self, filter: &CandidateFilter, limit: usize) -> Result<Vec<Provider>> {
        self.check_fault("find_candidates")?;
        let state = self.state.read().unwrap();
        // BTreeMap iteration keeps the result ordered by record id.
        Ok(state
            .providers
            .values()
            .filter(|p| filter.matches(p))
            .take(limit)
            .cloned()
            .collect())
    }

    fn search_providers(&self, query: &str, limit: usize) -> Result<Vec<Provider>> {
        self.check_fault("search_providers")?;
        let name_needle = normalize_name(query);
        let email_needle = query.trim().to_lowercase();
        if name_needle.is_empty() && email_needle.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read().unwrap();
        Ok(state
            .providers
            .values()
            .filter(|p| !p.is_retired())
            .filter(|p| {
                (!name_needle.is_empty() && p.name_norm().contains(&name_needle))
                    || (!email_needle.is_empty()
                        && p.email
                            .as_deref()
                            .is_some_and(|e| e.to_lowercase().contains(&email_needle)))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn apply_merge(&self, write: &MergeWrite) -> Result<()> {
        self.check_fault("apply_merge")?;
        // Single write lock: golden attributes, lineage redirect, and the
        // history append land together or not at all.
        let mut state = self.state.write().unwrap();
        state
            .providers
            .insert(write.golden.record_id.clone(), write.golden.clone());
        state
            .providers
            .insert(write.source.record_id.clone(), write.source.clone());
        state.history.push(write.history.clone());
        Ok(())
    }

    fn mark_pending_review(&self, review: &PendingReview) -> Result<()> {
        self.check_fault("mark_pending_review")?;
        let mut state = self.state.write().unwrap();
        state.pending_reviews.retain(|r| {
            !(r.record_id == review.record_id && r.candidate_id == review.candidate_id)
        });
        state.pending_reviews.push(review.clone());
        Ok(())
    }

    fn pending_reviews(&self) -> Result<Vec<PendingReview>> {
        self.check_fault("pending_reviews")?;
        let state = self.state.read().unwrap();
        Ok(state.pending_reviews.clone())
    }

    fn merge_history(&self) -> Result<Vec<MergeHistory>> {
        self.check_fault("merge_history")?;
        let state = self.state.read().unwrap();
        Ok(state.history.clone())
    }
}

/// Natural-key upsert semantics: incoming attributes overwrite, identity and
/// MDM fields of the stored record survive, relationships union. Shared with
/// the SQLite adapter so both stores agree on what an upsert means.
pub(crate) fn merge_upsert(existing: &mut Provider, incoming: &Provider) {
    existing.first_name = incoming.first_name.clone();
    existing.last_name = incoming.last_name.clone();
    existing.middle_name = incoming.middle_name.clone();
    existing.email = incoming.email.clone();
    existing.phone = incoming.phone.clone();
    existing.license_number = incoming.license_number.clone();
    existing.source_system = incoming.source_system.clone();
    existing
        .relationships
        .extend(incoming.relationships.iter().cloned());
    existing.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Relationship, RelationshipKind};

    fn provider(npi: Option<&str>, first: &str, last: &str) -> Provider {
        let mut p = Provider::new(first, last);
        p.npi = npi.map(|n| n.to_string());
        p
    }

    #[test]
    fn test_upsert_by_npi_updates_in_place() {
        let store = MemoryStore::new();
        let first = provider(Some("1234567890"), "Jon", "Smith");
        let stored = store.upsert_provider(&first).unwrap();

        let mut second = provider(Some("1234567890"), "Jonathan", "Smith");
        second.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
        let updated = store.upsert_provider(&second).unwrap();

        // same identity, refreshed attributes, unioned relationships
        assert_eq!(updated.record_id, stored.record_id);
        assert_eq!(updated.first_name, "Jonathan");
        assert_eq!(updated.relationships.len(), 1);

        let by_npi = store.find_by_npi("1234567890").unwrap().unwrap();
        assert_eq!(by_npi.record_id, stored.record_id);
    }

    #[test]
    fn test_upsert_without_npi_inserts_new() {
        let store = MemoryStore::new();
        store.upsert_provider(&provider(None, "Jon", "Smith")).unwrap();
        store.upsert_provider(&provider(None, "Jon", "Smith")).unwrap();

        let filter = CandidateFilter {
            name_prefix: Some("smit".to_string()),
            ..Default::default()
        };
        assert_eq!(store.find_candidates(&filter, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_candidates_by_each_blocking_key() {
        let store = MemoryStore::new();

        let mut a = provider(Some("1111111111"), "Jon", "Smith");
        a.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
        store.insert_provider(&a).unwrap();

        let incoming = {
            let mut p = provider(Some("1111111111"), "Different", "Name");
            p.record_id = "zzz".to_string();
            p
        };
        // shared npi
        let filter = CandidateFilter::for_provider(&incoming);
        assert_eq!(store.find_candidates(&filter, 10).unwrap().len(), 1);

        // shared name prefix
        let by_name = CandidateFilter::for_provider(&provider(None, "John", "Smithson"));
        assert_eq!(store.find_candidates(&by_name, 10).unwrap().len(), 1);

        // shared satellite relationship
        let mut related = provider(None, "Maria", "Garcia");
        related.link(Relationship::new(RelationshipKind::PracticesAt, "loc1"));
        let by_rel = CandidateFilter::for_provider(&related);
        assert_eq!(store.find_candidates(&by_rel, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_candidates_exclude_self_and_retired() {
        let store = MemoryStore::new();
        let a = provider(Some("1111111111"), "Jon", "Smith");
        let mut b = provider(None, "Jon", "Smith");
        b.master_record_id = Some(a.record_id.clone());
        store.insert_provider(&a).unwrap();
        store.insert_provider(&b).unwrap();

        let filter = CandidateFilter::for_provider(&a);
        // b is retired, a is the record itself
        assert!(store.find_candidates(&filter, 10).unwrap().is_empty());
    }

    #[test]
    fn test_candidate_lookup_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..20 {
            store
                .insert_provider(&provider(None, &format!("Jon{}", i), "Smith"))
                .unwrap();
        }
        let filter = CandidateFilter {
            name_prefix: Some("smit".to_string()),
            ..Default::default()
        };
        assert_eq!(store.find_candidates(&filter, 5).unwrap().len(), 5);
    }

    #[test]
    fn test_search_by_name_and_email() {
        let store = MemoryStore::new();
        let mut a = provider(Some("1234567890"), "Jon", "Smith");
        a.email = Some("Jon.Smith@clinic.example".to_string());
        let b = provider(None, "Maria", "Garcia");
        let mut retired = provider(None, "Jonas", "Smithers");
        retired.master_record_id = Some(a.record_id.clone());
        store.insert_provider(&a).unwrap();
        store.insert_provider(&b).unwrap();
        store.insert_provider(&retired).unwrap();

        // case-insensitive name substring; retired records never surface
        let by_name = store.search_providers("SMITH", 10).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].record_id, a.record_id);

        let by_email = store.search_providers("jon.smith@clinic", 10).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].record_id, a.record_id);

        assert!(store.search_providers("   ", 10).unwrap().is_empty());
        assert!(store.search_providers("nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn test_link_unions() {
        let store = MemoryStore::new();
        let p = provider(Some("1234567890"), "Jon", "Smith");
        store.insert_provider(&p).unwrap();

        let rel = Relationship::new(RelationshipKind::HasSpecialty, "cardio");
        store.link(&p.record_id, &rel).unwrap();
        store.link(&p.record_id, &rel).unwrap();

        let stored = store.get_provider(&p.record_id).unwrap().unwrap();
        assert_eq!(stored.relationships.len(), 1);
    }

    #[test]
    fn test_link_missing_record() {
        let store = MemoryStore::new();
        let rel = Relationship::new(RelationshipKind::HasSpecialty, "cardio");
        assert!(matches!(
            store.link("missing", &rel),
            Err(MdmError::NotFound(_))
        ));
    }

    #[test]
    fn test_pending_review_replaces_same_pair() {
        let store = MemoryStore::new();
        let review = PendingReview {
            record_id: "a".to_string(),
            candidate_id: "b".to_string(),
            score: 0.6,
            created_at: Utc::now(),
        };
        store.mark_pending_review(&review).unwrap();
        store
            .mark_pending_review(&PendingReview {
                score: 0.7,
                ..review.clone()
            })
            .unwrap();

        let reviews = store.pending_reviews().unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].score, 0.7);
    }

    #[test]
    fn test_injected_transient_failures_then_recover() {
        let store = MemoryStore::new();
        store.fail_next_ops(2);

        assert!(store.get_provider("x").unwrap_err().is_transient());
        assert!(store.get_provider("x").unwrap_err().is_transient());
        assert!(store.get_provider("x").is_ok());
    }

    #[test]
    fn test_satellite_upsert_roundtrip() {
        let store = MemoryStore::new();
        let sat = Satellite::Specialty(crate::model::Specialty {
            specialty_code: "cardio".to_string(),
            specialty_name: "Cardiology".to_string(),
            taxonomy_code: None,
            board_certified: true,
        });
        store.upsert_satellite(&sat).unwrap();
        assert_eq!(store.get_satellite("cardio").unwrap(), Some(sat));
    }
}
