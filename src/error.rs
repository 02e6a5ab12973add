// Error taxonomy for the MDM core
//
// Validation and quality findings travel as structured issue lists, never as
// errors. The variants here cover everything else: store failures (transient
// vs permanent), bad configuration, and merges that could not reach a
// consistent end state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MdmError {
    /// A record failed structural validation and was not upserted.
    /// The caller already holds the issue list; this variant exists for
    /// callers that need validation failure as an error value.
    #[error("validation failed for record {record_id}: {issue_count} issue(s)")]
    Validation { record_id: String, issue_count: usize },

    /// The graph store was temporarily unavailable. Retryable.
    #[error("transient store failure during {operation}: {reason}")]
    TransientStore { operation: String, reason: String },

    /// A permanent store failure. Not retryable.
    #[error("store failure during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Malformed configuration. Fatal at startup, before any record is
    /// processed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A merge transaction could not reach a consistent end state. Carries
    /// both identifiers and the point of failure so the audit trail stays
    /// diagnosable.
    #[error("merge of {source_id} into {target_id} failed at {stage}: {reason}")]
    MergeConflict {
        source_id: String,
        target_id: String,
        stage: String,
        reason: String,
    },

    #[error("record not found: {0}")]
    NotFound(String),
}

impl MdmError {
    /// Whether the orchestrator should retry the operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, MdmError::TransientStore { .. })
    }
}

pub type Result<T> = std::result::Result<T, MdmError>;
