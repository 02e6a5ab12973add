// 🧬 Record Model - Provider and satellite entities
//
// Identity/value separation: `record_id` is a stable surrogate identity that
// never changes, `npi` is the natural key used for upsert matching. Source
// records are never deleted; a merged record keeps a lineage pointer
// (`master_record_id`) to the golden record it was consolidated into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::similarity::normalize_name;

// ============================================================================
// CAPABILITY TRAIT
// ============================================================================

/// Implemented by every entity that can be upserted by natural key.
pub trait NaturalKey {
    /// Domain identifier used for upsert matching. A Provider may lack one
    /// (records arrive from heterogeneous sources); satellites always carry
    /// theirs.
    fn natural_key(&self) -> Option<String>;
}

// ============================================================================
// RELATIONSHIPS
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    PracticesAt,
    HasSpecialty,
    HasCredential,
    AffiliatedWith,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::PracticesAt => "PRACTICES_AT",
            RelationshipKind::HasSpecialty => "HAS_SPECIALTY",
            RelationshipKind::HasCredential => "HAS_CREDENTIAL",
            RelationshipKind::AffiliatedWith => "AFFILIATED_WITH",
        }
    }
}

/// Typed edge from a Provider to a satellite entity, addressed by the
/// satellite's natural key. Kept in a `BTreeSet`: many-to-many,
/// order-irrelevant, deterministic iteration.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub target_key: String,
}

impl Relationship {
    pub fn new(kind: RelationshipKind, target_key: &str) -> Self {
        Relationship {
            kind,
            target_key: target_key.to_string(),
        }
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Stable surrogate identity (UUID). Never changes.
    #[serde(default = "default_uuid")]
    pub record_id: String,

    /// National-Provider-Identifier-equivalent natural key. Optional but
    /// strongly preferred; a record missing both NPI and name is invalid.
    #[serde(default)]
    pub npi: Option<String>,

    pub first_name: String,
    pub last_name: String,

    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub license_number: Option<String>,
    #[serde(default)]
    pub source_system: Option<String>,

    // ========================================================================
    // MDM FIELDS
    // ========================================================================
    #[serde(default)]
    pub is_golden_record: bool,

    /// Lineage: record_id of the golden record this one was merged into.
    /// `Some(_)` means the record is retired from matching but never deleted.
    #[serde(default)]
    pub master_record_id: Option<String>,

    /// Aggregate match score that triggered the last consolidation.
    #[serde(default)]
    pub confidence_score: Option<f64>,

    // ========================================================================
    // AUDIT FIELDS
    // ========================================================================
    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub relationships: BTreeSet<Relationship>,
}

fn default_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

impl Provider {
    pub fn new(first_name: &str, last_name: &str) -> Self {
        let now = Utc::now();
        Provider {
            record_id: default_uuid(),
            npi: None,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            middle_name: None,
            email: None,
            phone: None,
            license_number: None,
            source_system: None,
            is_golden_record: false,
            master_record_id: None,
            confidence_score: None,
            created_at: now,
            updated_at: now,
            relationships: BTreeSet::new(),
        }
    }

    /// Full display name ("first middle last"), empty parts skipped.
    pub fn display_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.first_name.trim().is_empty() {
            parts.push(self.first_name.trim());
        }
        if let Some(middle) = &self.middle_name {
            if !middle.trim().is_empty() {
                parts.push(middle.trim());
            }
        }
        if !self.last_name.trim().is_empty() {
            parts.push(self.last_name.trim());
        }
        parts.join(" ")
    }

    /// Normalized "last first" form, used for prefix blocking in candidate
    /// retrieval and as the sort key of the name index.
    pub fn name_norm(&self) -> String {
        normalize_name(&format!("{} {}", self.last_name, self.first_name))
    }

    pub fn has_name(&self) -> bool {
        !self.display_name().is_empty()
    }

    pub fn has_npi(&self) -> bool {
        self.npi.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    /// Key that serializes all operations touching this entity. NPI when
    /// present, otherwise the normalized name.
    pub fn lock_key(&self) -> String {
        match self.npi.as_deref() {
            Some(npi) if !npi.trim().is_empty() => normalize_name(npi),
            _ => self.name_norm(),
        }
    }

    /// Has this record been merged into a golden record?
    pub fn is_retired(&self) -> bool {
        self.master_record_id.is_some()
    }

    /// Add a relationship (set semantics, duplicates are a no-op).
    pub fn link(&mut self, rel: Relationship) {
        self.relationships.insert(rel);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl NaturalKey for Provider {
    fn natural_key(&self) -> Option<String> {
        self.npi
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .map(normalize_name)
    }
}

// ============================================================================
// SATELLITE ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub location_type: Option<String>,
}

fn default_country() -> String {
    "USA".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specialty {
    pub specialty_code: String,
    pub specialty_name: String,
    #[serde(default)]
    pub taxonomy_code: Option<String>,
    #[serde(default)]
    pub board_certified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub credential_id: String,
    pub license_number: String,
    pub license_type: String,
    pub license_state: String,
    #[serde(default = "default_credential_status")]
    pub status: String,
}

fn default_credential_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affiliation {
    pub affiliation_id: String,
    pub organization_name: String,
    pub organization_type: String,
    pub relationship_type: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Tagged union over the satellite entity types. Keeps entity-specific
/// fields explicit while sharing the upsert-by-natural-key behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Satellite {
    Location(Location),
    Specialty(Specialty),
    Credential(Credential),
    Affiliation(Affiliation),
}

impl Satellite {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Satellite::Location(_) => "Location",
            Satellite::Specialty(_) => "Specialty",
            Satellite::Credential(_) => "Credential",
            Satellite::Affiliation(_) => "Affiliation",
        }
    }

    /// Relationship kind a Provider uses to point at this satellite.
    pub fn relationship_kind(&self) -> RelationshipKind {
        match self {
            Satellite::Location(_) => RelationshipKind::PracticesAt,
            Satellite::Specialty(_) => RelationshipKind::HasSpecialty,
            Satellite::Credential(_) => RelationshipKind::HasCredential,
            Satellite::Affiliation(_) => RelationshipKind::AffiliatedWith,
        }
    }
}

impl NaturalKey for Satellite {
    fn natural_key(&self) -> Option<String> {
        let key = match self {
            Satellite::Location(l) => &l.location_id,
            Satellite::Specialty(s) => &s.specialty_code,
            Satellite::Credential(c) => &c.credential_id,
            Satellite::Affiliation(a) => &a.affiliation_id,
        };
        Some(key.clone())
    }
}
