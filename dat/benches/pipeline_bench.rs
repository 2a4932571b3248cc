//! Benchmarks for stage id derivation and table extraction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dat::context::ExtractionContext;
use dat::core::StageType;
use dat::extract::extract_table;
use dat::ids::{compute_id, DEFAULT_ID_LENGTH};
use dat::profile::TableDef;
use serde_json::{json, Value};

/// A headers/data document with `rows` rows of four columns.
fn grid_document(rows: usize) -> Value {
    let data: Vec<Value> = (0..rows)
        .map(|i| json!([i, format!("LOT{}", i % 7), i as f64 * 0.25, i % 2 == 0]))
        .collect();
    json!({"grid": {"headers": ["site", "lot", "value", "pass"], "data": data}})
}

fn bench_compute_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_id");

    for files in [10, 1_000].iter() {
        let inputs = json!({
            "profile_id": "3f1c9a0b2d4e",
            "profile_version": 3,
            "files": (0..*files).map(|i| format!("data/lot_{i:04}.json")).collect::<Vec<_>>(),
        });
        group.bench_with_input(BenchmarkId::new("files", files), &inputs, |b, inputs| {
            b.iter(|| compute_id(StageType::Selection, black_box(inputs), DEFAULT_ID_LENGTH));
        });
    }

    group.finish();
}

fn bench_headers_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("headers_data");
    let table: TableDef = serde_json::from_value(json!({
        "id": "sites",
        "extraction": {
            "strategy": "headers_data",
            "path": "$.grid.data",
            "headers_path": "$.grid.headers"
        }
    }))
    .unwrap();
    let context = ExtractionContext {
        file: "data/grid.json".to_string(),
        ..ExtractionContext::default()
    };

    for rows in [100, 10_000].iter() {
        let document = grid_document(*rows);
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &document, |b, document| {
            b.iter(|| extract_table(&table, black_box(document), &context).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compute_id, bench_headers_data);
criterion_main!(benches);
