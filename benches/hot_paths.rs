//! Benchmarks for per-request and per-attempt hot paths.
//!
//! Every ingest hashes and wraps its body and verifies a signature; every
//! delivery attempt takes a rate-limit token. End-to-end ingestion is
//! measured through the router on in-memory storage.

use std::{hint::black_box, sync::Arc, time::Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hookline_api::crypto;
use hookline_core::{idempotency::request_hash, Clock, EventEnvelope, RealClock};
use hookline_delivery::TokenBucket;
use hookline_testing::{fixtures, TestEnv};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

fn payload(fields: usize) -> Value {
    let object: serde_json::Map<String, Value> =
        (0..fields).map(|i| (format!("field_{i}"), json!({"value": i, "tag": "x"}))).collect();
    json!({"type": "bench.event", "data": {"object": object}})
}

fn bench_request_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_hash");

    for fields in [1, 32, 512] {
        let body = payload(fields);
        group.throughput(Throughput::Bytes(body.to_string().len() as u64));
        group.bench_with_input(BenchmarkId::new("fields", fields), &body, |b, body| {
            b.iter(|| request_hash(black_box(body)));
        });
    }

    group.finish();
}

fn bench_envelope_wrap(c: &mut Criterion) {
    let bare = fixtures::order_created(7);
    let enveloped = fixtures::invoice_paid(4200);
    let now = RealClock::new().now_utc();

    c.bench_function("envelope/bare", |b| {
        b.iter(|| EventEnvelope::wrap(black_box(bare.clone()), now));
    });
    c.bench_function("envelope/enveloped", |b| {
        b.iter(|| EventEnvelope::wrap(black_box(enveloped.clone()), now));
    });
}

fn bench_signature_verify(c: &mut Criterion) {
    let secret = b"whsec_bench";
    let body = payload(64).to_string().into_bytes();
    let signature = crypto::decode_signature(&crypto::sign(secret, &body).unwrap()).unwrap();

    c.bench_function("signature/verify", |b| {
        b.iter(|| crypto::verify(secret, black_box(&body), black_box(&signature)));
    });
}

fn bench_token_bucket(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let bucket = TokenBucket::new(u32::MAX, u32::MAX, Arc::new(RealClock::new()));

    c.bench_function("token_bucket/acquire_uncontended", |b| {
        b.to_async(&rt).iter(|| bucket.acquire());
    });
}

fn bench_ingest_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("ingest/router_round_trip", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let env = TestEnv::new().unwrap();
                let body = fixtures::order_created(1);

                let start = Instant::now();
                for i in 0..iters {
                    let request =
                        env.signed_request(&format!("bench-{i}"), "https://example.com/h", &body);
                    black_box(env.send(request).await.unwrap());
                }
                start.elapsed()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_request_hash,
    bench_envelope_wrap,
    bench_signature_verify,
    bench_token_bucket,
    bench_ingest_round_trip
);
criterion_main!(benches);
