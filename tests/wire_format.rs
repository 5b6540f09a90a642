use mograph_collab::{Operation, OperationKind};
use serde_json::json;
use uuid::Uuid;

#[test]
fn test_operation_serializes_with_exact_wire_keys() {
    let id = Uuid::from_u128(0x11);
    let dep = Uuid::from_u128(0x22);
    let op = Operation {
        id,
        kind: OperationKind::Update,
        path: vec!["layers".to_string(), "l1".to_string(), "opacity".to_string()],
        value: Some(json!(0.5)),
        old_value: Some(json!(1.0)),
        timestamp: 1_700_000_000_000,
        user_id: "alice".to_string(),
        version: 7,
        dependencies: vec![dep],
    };

    let wire = serde_json::to_value(&op).unwrap();
    assert_eq!(
        wire,
        json!({
            "id": id,
            "type": "Update",
            "path": ["layers", "l1", "opacity"],
            "value": 0.5,
            "oldValue": 1.0,
            "timestamp": 1_700_000_000_000i64,
            "userId": "alice",
            "version": 7,
            "dependencies": [dep],
        })
    );
}

#[test]
fn test_operation_round_trips() {
    let op = Operation {
        id: Uuid::new_v4(),
        kind: OperationKind::Move,
        path: vec!["layers".to_string(), "l1".to_string()],
        value: Some(json!(["groups", "g1"])),
        old_value: None,
        timestamp: 42,
        user_id: "bob".to_string(),
        version: 0,
        dependencies: vec![Uuid::new_v4(), Uuid::new_v4()],
    };

    let wire = serde_json::to_string(&op).unwrap();
    let back: Operation = serde_json::from_str(&wire).unwrap();
    assert_eq!(back, op);
}

#[test]
fn test_kind_tags_are_stable() {
    for (kind, tag) in [
        (OperationKind::Insert, "\"Insert\""),
        (OperationKind::Delete, "\"Delete\""),
        (OperationKind::Update, "\"Update\""),
        (OperationKind::Move, "\"Move\""),
    ] {
        assert_eq!(serde_json::to_string(&kind).unwrap(), tag);
    }
}

#[test]
fn test_foreign_operation_parses() {
    // Produced by a non-Rust peer; field order and missing optionals must not
    // matter.
    let wire = json!({
        "dependencies": [],
        "userId": "carol",
        "timestamp": 9,
        "path": ["opacity"],
        "type": "Delete",
        "version": 3,
        "id": Uuid::from_u128(0x33),
        "value": null,
        "oldValue": null,
    });

    let op: Operation = serde_json::from_value(wire).unwrap();
    assert_eq!(op.kind, OperationKind::Delete);
    assert_eq!(op.user_id, "carol");
    assert!(op.value.is_none());
    assert!(op.old_value.is_none());
}
