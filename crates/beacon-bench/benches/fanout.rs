//! Fan-out benchmarks for Beacon.
//!
//! These benchmarks measure how broadcast cost grows with the number of
//! connections and subscriptions.

use beacon_bench::{Fanout, TOPIC};
use beacon_core::{Event, EventFilter, SubscriptionTable};
use beacon_protocol::EventType;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

/// Benchmark broadcast to a growing number of connections.
fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut fixture = Fanout::new(&rt, size, 1);
            let event = Event::new(TOPIC, EventType::Created, json!({"id": 1, "value": 0.5}));

            b.iter(|| {
                let outcome = fixture.manager.broadcast_event(black_box(&event));
                fixture.drain();
                outcome
            });
        });
    }

    group.finish();
}

/// Benchmark broadcast when every connection holds the maximum subscriptions.
fn bench_broadcast_full_tables(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast_full_tables");

    let mut fixture = Fanout::new(&rt, 100, 10);
    let event = Event::new(TOPIC, EventType::Updated, json!({"id": 1, "value": 0.5}));
    group.throughput(Throughput::Elements(1000));
    group.bench_function("100x10", |b| {
        b.iter(|| {
            let outcome = fixture.manager.broadcast_event(black_box(&event));
            fixture.drain();
            outcome
        });
    });

    group.finish();
}

/// Benchmark subscription matching inside one table.
fn bench_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching");

    let registry = beacon_core::PluginRegistry::new()
        .with(beacon_bench::TickPlugin)
        .unwrap();
    let mut table = SubscriptionTable::new(10);
    for i in 0..10 {
        let filter = if i % 2 == 0 {
            EventFilter::from_types(&[EventType::Created])
        } else {
            EventFilter::default()
        };
        let id = table.subscribe(&registry, TOPIC, filter).unwrap().id.clone();
        table.activate(&id);
    }

    group.bench_function("10_subscriptions", |b| {
        b.iter(|| {
            table
                .matching(black_box(TOPIC), black_box(EventType::Deleted))
                .count()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_broadcast,
    bench_broadcast_full_tables,
    bench_matching,
);
criterion_main!(benches);
