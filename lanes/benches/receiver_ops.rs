//! Benchmarks for transport operations using criterion.
//!
//! - Single send through the routing bus
//! - Poll across many partitions
//! - Full lifecycle (send → poll → ack)

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lanes::*;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn create_transport() -> (PartitionTransport, InMemoryQueueStore) {
    let store = InMemoryQueueStore::new();
    let transport = PartitionTransport::new(
        Arc::new(store.clone()),
        Arc::new(InMemoryLockService::new()),
        Arc::new(JsonSerializer),
        TransportConfig::default(),
    );
    (transport, store)
}

fn bench_send(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("send");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let (transport, _store) = create_transport();
        let bus = transport.bus();

        b.to_async(&rt).iter(|| async {
            bus.dispatch_message(RunPhaseMessage::new(1, 1, Phase::Execute).into())
                .await
                .expect("send should succeed");
        });
    });

    group.finish();
}

/// Poll cost grows with the number of partitions that have pending rows.
fn bench_poll_partitions(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("poll_partitions");
    group.sample_size(50);

    for partitions in [1i64, 10, 50, 200] {
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", partitions),
            &partitions,
            |b, &partitions| {
                b.to_async(&rt).iter_batched(
                    || {
                        let (transport, _store) = create_transport();
                        let setup = create_runtime();
                        setup.block_on(async {
                            let bus = transport.bus();
                            for environment_id in 0..partitions {
                                bus.dispatch_message(
                                    RunPhaseMessage::new(environment_id, environment_id, Phase::Prepare)
                                        .into(),
                                )
                                .await
                                .expect("seed should succeed");
                            }
                        });
                        transport
                    },
                    |transport| async move {
                        let claims = transport.poll().await.expect("poll should succeed");
                        assert_eq!(claims.len() as i64, partitions);
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("lifecycle");
    group.sample_size(100);

    group.bench_function("send_poll_ack", |b| {
        let (transport, _store) = create_transport();
        let bus = transport.bus();

        b.to_async(&rt).iter(|| async {
            bus.dispatch_message(RunPhaseMessage::new(1, 1, Phase::Report).into())
                .await
                .expect("send should succeed");
            let claims = transport.poll().await.expect("poll should succeed");
            for claim in claims {
                transport.ack(&claim.ticket).await.expect("ack should succeed");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_send, bench_poll_partitions, bench_lifecycle);
criterion_main!(benches);
