//! Error taxonomy shared across the engine.
//!
//! The core raises *kinds*, not HTTP status codes; whatever boundary sits in
//! front of this crate (not implemented here, see the crate-level docs) maps
//! these onto wire-level responses.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity absent, or soft-deleted and `include_deleted` was not set.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Entity present but soft-deleted; distinct from [`CoreError::NotFound`]
    /// for callers that specifically need to distinguish "never existed"
    /// from "existed, then was removed".
    #[error("{kind} {id} has been deleted")]
    Deleted { kind: &'static str, id: String },

    /// Uniqueness violation: dedupe key collision, duplicate provenance
    /// link, or an attempt to start a second running dream session.
    #[error("duplicate {kind}: {detail}")]
    Duplicate { kind: &'static str, detail: String },

    /// Business-rule violation: out-of-range score, merge group too small,
    /// split target too small, invalid enum value, and so on.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reserved for a future authentication boundary. This crate never
    /// raises it itself — no credential validation is implemented here.
    #[error("unauthorized")]
    Unauthorized,

    /// A downstream LLM/embedding/database failure the caller should treat
    /// as retryable. Fire-and-forget callers (scheduler hooks, background
    /// tasks) log and abandon the run rather than propagating this further.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::store::StoreError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] crate::collaborators::CollaboratorError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
