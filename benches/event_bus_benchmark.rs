//! Event bus and audit log benchmarks for hubcore
//!
//! This benchmark suite measures:
//! - Publish throughput for growing subscriber counts
//! - Cost of isolating failing subscribers
//! - Audit log appends at capacity

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hubcore::{AuditLog, EventBus, ListenerError};
use serde_json::json;

/// Benchmark publish with N succeeding subscribers
fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");

    for subscribers in [1usize, 10, 50, 200].iter() {
        let bus = EventBus::new(usize::MAX, false);
        for _ in 0..*subscribers {
            bus.subscribe("bench.event", |event| {
                black_box(&event.data);
                Ok(())
            })
            .unwrap();
        }

        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            subscribers,
            |b, _| {
                b.iter(|| bus.publish("bench.event", black_box(json!({ "n": 1 }))));
            },
        );
    }

    group.finish();
}

/// Benchmark publish where every other subscriber fails
fn bench_publish_with_failures(c: &mut Criterion) {
    let bus = EventBus::default();
    let audit = AuditLog::with_bus(1000, true, bus.clone());
    bus.attach_audit(&audit);

    for i in 0..20 {
        bus.subscribe("bench.failing", move |_| {
            if i % 2 == 0 {
                Err(ListenerError::new("rejected"))
            } else {
                Ok(())
            }
        })
        .unwrap();
    }

    c.bench_function("publish_half_failing", |b| {
        b.iter(|| bus.publish("bench.failing", black_box(json!(null))));
    });
}

/// Benchmark audit appends once the ring buffer is full
fn bench_audit_log_at_capacity(c: &mut Criterion) {
    let audit = AuditLog::new(1000);
    for i in 0..1000 {
        audit.log("CUSTOM", "warmup", json!({ "i": i }));
    }

    c.bench_function("audit_log_evicting", |b| {
        b.iter(|| audit.log("CUSTOM", black_box("entry"), json!({ "bench": true })));
    });
}

criterion_group!(
    benches,
    bench_publish_fanout,
    bench_publish_with_failures,
    bench_audit_log_at_capacity
);
criterion_main!(benches);
