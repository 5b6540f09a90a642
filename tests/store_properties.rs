use mograph_collab::{DocumentState, Operation, OperationKind};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Insert),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

// Same-path, sibling, and prefix-nested cases: `["layers"]` is a strict
// prefix of the layer paths, so subtree deletes race nested writes here.
fn path_strategy() -> impl Strategy<Value = Vec<String>> {
    prop_oneof![
        Just(vec!["opacity".to_string()]),
        Just(vec!["fx".to_string()]),
        Just(vec!["layers".to_string()]),
        proptest::sample::select(vec!["l1", "l2", "l3"])
            .prop_map(|layer| vec!["layers".to_string(), layer.to_string()]),
        proptest::sample::select(vec!["l1", "l2"])
            .prop_map(|layer| vec!["layers".to_string(), layer.to_string(), "x".to_string()]),
    ]
}

fn op_strategy() -> impl Strategy<Value = Operation> {
    (
        any::<u128>(),
        kind_strategy(),
        path_strategy(),
        any::<u8>(),
        0..50i64,
        proptest::sample::select(vec!["alice", "bob", "carol"]),
    )
        .prop_map(|(raw_id, kind, path, raw_value, timestamp, user)| {
            let value = match kind {
                OperationKind::Delete => None,
                _ => Some(json!({ "v": raw_value })),
            };
            Operation {
                id: Uuid::from_u128(raw_id),
                kind,
                path,
                value,
                old_value: None,
                timestamp,
                user_id: user.to_string(),
                version: 0,
                dependencies: vec![],
            }
        })
}

fn fresh() -> DocumentState {
    DocumentState::new("comp", "owner", json!({}), 0).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Any delivery order of the same concurrent operation set converges.
    #[test]
    fn prop_permuted_delivery_converges(
        (ops, shuffled) in proptest::collection::vec(op_strategy(), 1..12)
            .prop_map(|mut ops| {
                // Distinct stamps per op, as a real millisecond clock plus
                // causal ordering would give; ties between ops of the same
                // author carry no winner.
                for (i, op) in ops.iter_mut().enumerate() {
                    op.timestamp = op.timestamp * 16 + i as i64;
                }
                ops
            })
            .prop_flat_map(|ops| {
                let shuffled = Just(ops.clone()).prop_shuffle();
                (Just(ops), shuffled)
            })
    ) {
        let mut forward = fresh();
        for op in &ops {
            forward.apply_operation(op).unwrap();
        }
        let mut permuted = fresh();
        for op in &shuffled {
            permuted.apply_operation(op).unwrap();
        }
        prop_assert_eq!(forward.get_state(), permuted.get_state());
        prop_assert_eq!(forward.value(), permuted.value());
    }

    /// Applying an already-applied operation never changes state or version.
    #[test]
    fn prop_apply_is_idempotent(ops in proptest::collection::vec(op_strategy(), 1..8)) {
        let mut replica = fresh();
        for op in &ops {
            replica.apply_operation(op).unwrap();
        }
        let state = replica.get_state();
        let version = replica.version();
        for op in &ops {
            let outcome = replica.apply_operation(op).unwrap();
            prop_assert!(!outcome.applied);
        }
        prop_assert_eq!(replica.get_state(), state);
        prop_assert_eq!(replica.version(), version);
    }

    /// Two updates to the same scalar path resolve to the same winner on
    /// every replica, with the (timestamp, userId) order total.
    #[test]
    fn prop_lww_update_convergence(
        (t1, t2) in (0..100i64, 0..100i64),
        (u1, u2) in (
            proptest::sample::select(vec!["alice", "bob"]),
            proptest::sample::select(vec!["bob", "carol"]),
        ),
    ) {
        prop_assume!((t1, u1) != (t2, u2));
        let a = Operation {
            id: Uuid::from_u128(1),
            kind: OperationKind::Update,
            path: vec!["opacity".to_string()],
            value: Some(json!(0.25)),
            old_value: None,
            timestamp: t1,
            user_id: u1.to_string(),
            version: 0,
            dependencies: vec![],
        };
        let b = Operation {
            id: Uuid::from_u128(2),
            kind: OperationKind::Update,
            path: vec!["opacity".to_string()],
            value: Some(json!(0.75)),
            old_value: None,
            timestamp: t2,
            user_id: u2.to_string(),
            version: 0,
            dependencies: vec![],
        };

        let mut forward = fresh();
        forward.apply_operation(&a).unwrap();
        forward.apply_operation(&b).unwrap();

        let mut reverse = fresh();
        reverse.apply_operation(&b).unwrap();
        reverse.apply_operation(&a).unwrap();

        prop_assert_eq!(forward.get_state(), reverse.get_state());

        let expected = if (t1, u1) > (t2, u2) { json!(0.25) } else { json!(0.75) };
        prop_assert_eq!(
            forward.value_at(&["opacity".to_string()]),
            Some(expected)
        );
    }
}
