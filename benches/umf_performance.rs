//! Performance benchmarks for UMF encoding and route parsing.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meshframe::umf::{parse_route, UmfMessage};
use meshframe::util::string_hash;
use serde_json::json;

fn bench_umf_short_json_encode(c: &mut Criterion) {
    let msg = UmfMessage::new(
        "orders-service:[post]/orders",
        "gateway",
        json!({ "order_id": 42, "items": ["a", "b", "c"] }),
    );

    c.bench_function("umf_to_short_json", |b| {
        b.iter(|| black_box(msg.to_short_json()))
    });
}

fn bench_umf_round_trip(c: &mut Criterion) {
    let msg = UmfMessage::new(
        "orders-service:[post]/orders",
        "gateway",
        json!({ "order_id": 42 }),
    );
    let short = msg.to_short_json();

    c.bench_function("umf_from_json_short_form", |b| {
        b.iter(|| black_box(UmfMessage::from_json(&short).unwrap()))
    });
}

fn bench_parse_route(c: &mut Criterion) {
    c.bench_function("parse_route_pinned_instance", |b| {
        b.iter(|| black_box(parse_route("worker-3@orders-service:[get]/orders/:id")))
    });
}

fn bench_string_hash(c: &mut Criterion) {
    c.bench_function("string_hash_channel_name", |b| {
        b.iter(|| black_box(string_hash("hydra:service:orders-service:channel")))
    });
}

criterion_group!(
    benches,
    bench_umf_short_json_encode,
    bench_umf_round_trip,
    bench_parse_route,
    bench_string_hash
);
criterion_main!(benches);
