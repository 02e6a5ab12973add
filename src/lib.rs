// Provider MDM - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;         // SQLite GraphStore adapter
pub mod decision;   // score → auto-merge / review / reject
pub mod error;
pub mod matching;   // weighted candidate scoring
pub mod merge;      // golden-record consolidation + lineage
pub mod model;      // Provider + satellite entities
pub mod quality;    // weighted data quality scoring
pub mod resolve;    // full pipeline + worker pool
pub mod similarity; // name/identifier normalization primitives
pub mod store;      // GraphStore trait + in-memory adapter
pub mod validation; // structural validation rules

// Re-export commonly used types
pub use config::{
    DecisionThresholds, MatchWeights, MdmConfig, QualityRule, RecordField, RetryPolicy,
    RulePredicate, Severity,
};
pub use db::SqliteStore;
pub use decision::{DecisionPolicy, MatchDecision};
pub use error::{MdmError, Result};
pub use matching::{MatchComponent, MatchResult, MatchingEngine};
pub use merge::{ConflictWinner, FieldConflict, MergeEngine, MergeHistory, ResolutionReason};
pub use model::{
    Affiliation, Credential, Location, NaturalKey, Provider, Relationship, RelationshipKind,
    Satellite, Specialty,
};
pub use quality::{DataQualityEngine, DataQualityResult};
pub use resolve::{
    BatchReport, ResolutionAction, ResolutionOrchestrator, ResolutionOutcome,
};
pub use store::{CandidateFilter, GraphStore, MemoryStore, MergeWrite, PendingReview};
pub use validation::{QualityIssue, ValidationReport, Validator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
