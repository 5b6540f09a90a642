use mograph_collab::{
    BranchManager, CollabError, ConflictKind, DocumentState, MergeStrategy, Operation,
    OperationKind,
};
use serde_json::{Value, json};
use uuid::Uuid;

fn op(
    kind: OperationKind,
    path: &[&str],
    value: Option<Value>,
    timestamp: i64,
    user: &str,
) -> Operation {
    Operation {
        id: Uuid::new_v4(),
        kind,
        path: path.iter().map(|s| s.to_string()).collect(),
        value,
        old_value: None,
        timestamp,
        user_id: user.to_string(),
        version: 0,
        dependencies: vec![],
    }
}

fn doc() -> DocumentState {
    DocumentState::new("comp", "owner", json!({}), 0).unwrap()
}

fn path(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_fast_forward_applies_branch_ops_in_order() {
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "color-pass", 0, "alice")
        .unwrap();

    manager
        .record_op(
            branch,
            op(OperationKind::Insert, &["fx"], Some(json!({"blur": 2})), 10, "alice"),
        )
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["fx", "blur"], Some(json!(4)), 20, "alice"),
        )
        .unwrap();

    let report = manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 30)
        .unwrap();
    assert_eq!(report.applied.len(), 2);
    assert!(report.conflicts.is_empty());
    assert_eq!(document.version(), 2);
    assert_eq!(document.value_at(&path(&["fx", "blur"])), Some(json!(4)));
    assert!(!manager.get(branch).unwrap().is_active);
}

#[test]
fn test_fast_forward_fails_once_mainline_advances() {
    // Once the document moves past the fork point, fast-forward is no longer
    // a valid reconciliation.
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "feature", 0, "alice")
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["opacity"], Some(json!(0.5)), 10, "alice"),
        )
        .unwrap();

    document
        .apply_operation(&op(
            OperationKind::Update,
            &["scale"],
            Some(json!(2)),
            15,
            "bob",
        ))
        .unwrap();

    let err = manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 30)
        .unwrap_err();
    assert!(matches!(err, CollabError::Merge(_)));
    // A failed merge leaves the branch active and the document untouched.
    assert!(manager.get(branch).unwrap().is_active);
    assert_eq!(document.version(), 1);
    assert_eq!(document.value_at(&path(&["opacity"])), None);
}

#[test]
fn test_merge_isolates_a_failing_branch_op() {
    // A branch op that cannot apply (move of a missing source) is reported
    // and skipped; the rest of the branch still merges and the branch closes.
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "feature", 0, "alice")
        .unwrap();
    let bad = op(
        OperationKind::Move,
        &["layers", "ghost"],
        Some(json!(["groups", "g1"])),
        10,
        "alice",
    );
    let bad_id = bad.id;
    manager.record_op(branch, bad).unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["opacity"], Some(json!(0.5)), 20, "alice"),
        )
        .unwrap();

    let report = manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 30)
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad_id);
    assert!(matches!(report.failed[0].1, CollabError::Apply(_)));
    assert_eq!(report.applied.len(), 1);
    assert_eq!(document.version(), 1);
    assert_eq!(document.value_at(&path(&["opacity"])), Some(json!(0.5)));
    assert!(!manager.get(branch).unwrap().is_active);
}

#[test]
fn test_three_way_applies_disjoint_and_flags_contested_paths() {
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "feature", 0, "alice")
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["opacity"], Some(json!(0.5)), 10, "alice"),
        )
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["scale"], Some(json!(3)), 12, "alice"),
        )
        .unwrap();

    // Mainline touches "opacity" too; "scale" stays branch-only.
    document
        .apply_operation(&op(
            OperationKind::Update,
            &["opacity"],
            Some(json!(0.9)),
            15,
            "bob",
        ))
        .unwrap();

    let report = manager
        .merge(&mut document, branch, MergeStrategy::ThreeWay, 30)
        .unwrap();

    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::ConcurrentEdit);
    // Branch op first, then the contested mainline ops.
    assert_eq!(report.conflicts[0].operations[0].user_id, "alice");
    assert_eq!(report.conflicts[0].path(), path(&["opacity"]));

    // The disjoint branch edit landed; the contested path kept mainline.
    assert_eq!(document.value_at(&path(&["scale"])), Some(json!(3)));
    assert_eq!(document.value_at(&path(&["opacity"])), Some(json!(0.9)));
    assert!(!manager.get(branch).unwrap().is_active);
}

#[test]
fn test_manual_merge_defers_every_branch_op() {
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "feature", 0, "alice")
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Update, &["opacity"], Some(json!(0.5)), 10, "alice"),
        )
        .unwrap();
    manager
        .record_op(
            branch,
            op(OperationKind::Delete, &["fx"], None, 12, "alice"),
        )
        .unwrap();

    let report = manager
        .merge(&mut document, branch, MergeStrategy::Manual, 30)
        .unwrap();

    assert!(report.applied.is_empty());
    assert_eq!(report.conflicts.len(), 2);
    assert!(
        report
            .conflicts
            .iter()
            .all(|conflict| conflict.kind == ConflictKind::ManualMerge)
    );
    // Nothing reaches the document until each conflict is resolved.
    assert_eq!(document.version(), 0);
    assert!(!manager.get(branch).unwrap().is_active);
}

#[test]
fn test_merge_rejects_branch_from_another_document() {
    let mut document = doc();
    let other = DocumentState::new("other", "owner", json!({}), 0).unwrap();
    let mut manager = BranchManager::new();
    let branch = manager.create_branch(&other, "feature", 0, "alice").unwrap();

    let err = manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 30)
        .unwrap_err();
    assert!(matches!(err, CollabError::Merge(_)));
}

#[test]
fn test_second_merge_of_same_branch_is_rejected() {
    let mut document = doc();
    let mut manager = BranchManager::new();
    let branch = manager
        .create_branch(&document, "feature", 0, "alice")
        .unwrap();
    manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 30)
        .unwrap();

    let err = manager
        .merge(&mut document, branch, MergeStrategy::FastForward, 40)
        .unwrap_err();
    assert!(matches!(err, CollabError::Merge(_)));
}
