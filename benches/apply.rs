use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mograph_collab::{DocumentState, Operation, OperationKind};
use serde_json::json;
use uuid::Uuid;

fn make_op(i: u64, kind: OperationKind, path: Vec<String>) -> Operation {
    Operation {
        id: Uuid::from_u128(i as u128 + 1),
        kind,
        path,
        value: match kind {
            OperationKind::Delete => None,
            _ => Some(json!({"x": i})),
        },
        old_value: None,
        timestamp: i as i64,
        user_id: format!("user-{}", i % 4),
        version: 0,
        dependencies: vec![],
    }
}

/// Populate a document with N sibling layers
fn seeded_document(size: u64) -> DocumentState {
    let mut doc = DocumentState::new("bench", "owner", json!({}), 0).unwrap();
    for i in 0..size {
        let op = make_op(
            i,
            OperationKind::Insert,
            vec!["layers".to_string(), format!("l{i}")],
        );
        doc.apply_operation(&op).unwrap();
    }
    doc
}

fn bench_apply_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_insert");

    for size in [10u64, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut doc = seeded_document(size);
            let mut i = size;
            b.iter(|| {
                let op = make_op(
                    i,
                    OperationKind::Insert,
                    vec!["layers".to_string(), format!("l{i}")],
                );
                i += 1;
                doc.apply_operation(&op).unwrap();
                black_box(&doc);
            });
        });
    }

    group.finish();
}

fn bench_apply_update_hot_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_update_hot_path");

    for size in [10u64, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut doc = seeded_document(size);
            let mut i = size;
            b.iter(|| {
                let op = make_op(
                    i,
                    OperationKind::Update,
                    vec!["layers".to_string(), "l0".to_string(), "x".to_string()],
                );
                i += 1;
                doc.apply_operation(&op).unwrap();
                black_box(&doc);
            });
        });
    }

    group.finish();
}

fn bench_get_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_state");

    for size in [10u64, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let doc = seeded_document(size);
            b.iter(|| black_box(doc.get_state()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_apply_insert,
    bench_apply_update_hot_path,
    bench_get_state
);
criterion_main!(benches);
