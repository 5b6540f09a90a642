//! Operational-transform rebase layer.
//!
//! Rewrites an incoming operation against operations applied concurrently
//! (same causal frontier) before it reaches the CRDT store. The store's LWW
//! and tombstone rules already make raw re-application convergent, so no
//! index-shift math happens here; the rebaser's job is to keep causal-order
//! metadata correct and to provide the seam where positional transform rules
//! for list operations can slot in later without changing the call contract.

use crate::error::{CollabError, Result};
use crate::op::{Operation, OperationId, OperationKind, paths_overlap};
use std::collections::BTreeSet;

/// Transforms `op` against a set of concurrent operations.
///
/// Operations on paths disjoint from every concurrent path pass through
/// unchanged. Overlapping concurrent operations are folded into the result's
/// `dependencies`, except for delete/update pairs: those stay concurrent so
/// the store can still detect the race and raise a conflict. The concurrent
/// set is reduced through ordered collections, so the result is identical
/// regardless of iteration order.
pub fn transform(op: &Operation, concurrent: &[Operation]) -> Result<Operation> {
    if op.path.is_empty() {
        return Err(CollabError::Transform(
            "cannot transform an operation with an empty path".to_string(),
        ));
    }

    let mut dependencies: BTreeSet<OperationId> = op.dependencies.iter().copied().collect();
    for other in concurrent {
        if other.id == op.id || dependencies.contains(&other.id) {
            continue;
        }
        if !paths_overlap(&op.path, &other.path) {
            continue;
        }
        if ambiguous_pair(op.kind, other.kind) {
            continue;
        }
        dependencies.insert(other.id);
    }

    let mut transformed = op.clone();
    transformed.dependencies = dependencies.into_iter().collect();
    Ok(transformed)
}

/// A delete racing an update must remain visibly concurrent; folding either
/// side into the other's dependencies would hide the race from the conflict
/// tracker.
fn ambiguous_pair(a: OperationKind, b: OperationKind) -> bool {
    matches!(
        (a, b),
        (OperationKind::Delete, OperationKind::Update)
            | (OperationKind::Update, OperationKind::Delete)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn op(kind: OperationKind, path: &[&str], user: &str) -> Operation {
        Operation {
            id: Uuid::new_v4(),
            kind,
            path: path.iter().map(|s| s.to_string()).collect(),
            value: Some(json!(1)),
            old_value: None,
            timestamp: 1,
            user_id: user.to_string(),
            version: 0,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_disjoint_paths_pass_through() {
        let local = op(OperationKind::Update, &["layers", "l1"], "alice");
        let remote = op(OperationKind::Update, &["layers", "l2"], "bob");
        let transformed = transform(&remote, &[local]).unwrap();
        assert_eq!(transformed, remote);
    }

    #[test]
    fn test_overlap_extends_dependencies() {
        let local = op(OperationKind::Update, &["layers", "l1"], "alice");
        let remote = op(OperationKind::Update, &["layers", "l1", "x"], "bob");
        let transformed = transform(&remote, &[local.clone()]).unwrap();
        assert!(transformed.dependencies.contains(&local.id));
    }

    #[test]
    fn test_result_is_order_independent() {
        let a = op(OperationKind::Update, &["layers"], "alice");
        let b = op(OperationKind::Insert, &["layers", "l1"], "bob");
        let remote = op(OperationKind::Update, &["layers", "l1"], "carol");

        let forward = transform(&remote, &[a.clone(), b.clone()]).unwrap();
        let reverse = transform(&remote, &[b, a]).unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_delete_update_pair_stays_concurrent() {
        let delete = op(OperationKind::Delete, &["layers", "l1"], "alice");
        let update = op(OperationKind::Update, &["layers", "l1"], "bob");
        let transformed = transform(&update, &[delete.clone()]).unwrap();
        assert!(!transformed.dependencies.contains(&delete.id));
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let mut bad = op(OperationKind::Update, &[], "alice");
        bad.path = vec![];
        assert!(matches!(
            transform(&bad, &[]),
            Err(CollabError::Transform(_))
        ));
    }
}
