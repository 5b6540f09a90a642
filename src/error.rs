//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`Result`]; failures are isolated per
//! operation and never corrupt sibling document state. Transport failures are
//! surfaced through [`crate::store::SyncState::OutOfSync`] rather than
//! failing local edits.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("branch not found: {0}")]
    BranchNotFound(Uuid),
    #[error("conflict not found: {0}")]
    ConflictNotFound(Uuid),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("limit exceeded: {limit} {what}, got {actual}")]
    LimitExceeded {
        what: &'static str,
        limit: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, CollabError>;
