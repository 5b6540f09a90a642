//! mograph-collab: conflict-free replication engine for collaborative
//! motion-graphics documents.
//!
//! Multiple users concurrently edit a shared composition graph and converge
//! without data loss, even across unreliable, out-of-order, partially
//! connected peers. The crate provides:
//!
//! - **Operation model** - immutable, versioned mutations with a bit-exact
//!   JSON wire format
//! - **CRDT document store** - stamped content tree with LWW registers,
//!   tombstones, and key-wise deep merge
//! - **OT rebaser** - rewrites incoming operations against concurrent ones
//!   before they reach the store
//! - **Branch/merge manager** - fast-forward, three-way, and manual merge of
//!   named document forks
//! - **Conflict tracker** - records ambiguous races (delete vs. update,
//!   divergent merges) for explicit resolution
//! - **Session & presence** - per-document attachments, permissions, cursors
//! - **Collaboration orchestrator** - composes everything with pluggable
//!   transport collaborators
//!
//! # Quick Start
//!
//! ```rust
//! use mograph_collab::{DocumentState, Operation, OperationKind};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! let mut doc = DocumentState::new("comp-1", "alice", json!({}), 0).unwrap();
//! let op = Operation {
//!     id: Uuid::new_v4(),
//!     kind: OperationKind::Insert,
//!     path: vec!["layers".into(), "l1".into()],
//!     value: Some(json!({"x": 1})),
//!     old_value: None,
//!     timestamp: 10,
//!     user_id: "alice".into(),
//!     version: 0,
//!     dependencies: vec![],
//! };
//! doc.apply_operation(&op).unwrap();
//! assert_eq!(doc.version(), 1);
//! ```

// Operation model and wire format
pub mod op;

// Crate-wide error taxonomy
pub mod error;

// CRDT document store
pub mod store;

// Operational-transform rebase layer
pub mod rebase;

// Conflict records and resolution
pub mod conflict;

// Branch and merge management
pub mod branch;

// Sessions, permissions, and presence
pub mod session;

// Top-level collaboration façade and transport seams
pub mod orchestrator;

pub use branch::{Branch, BranchId, BranchManager, MergeReport, MergeStrategy};
pub use conflict::{
    Conflict, ConflictId, ConflictKind, ConflictResolution, ConflictTracker, ResolutionOutcome,
    ResolutionStrategy,
};
pub use error::{CollabError, Result};
pub use op::{Operation, OperationId, OperationKind, paths_overlap};
pub use orchestrator::{
    Clock, CollabEngine, DocumentRepository, DurableSync, EngineConfig, PeerChannel, SystemClock,
    validate_operation,
};
pub use session::{
    Cursor, Permission, Presence, Role, Session, SessionId, SessionManager, permissions_for,
    presence_color,
};
pub use store::{ApplyOutcome, DocumentState, Stamp, SyncState};
