//! Throughput benchmarks for Courier.
//!
//! These benchmarks measure the hot paths behind a single `send_message`:
//! room fan-out, registry lookups, offline queueing and persistence.

use courier_bench::{drain, populated_room, sample_message};
use courier_core::{
    ConnectionId, ConnectionRegistry, Database, MessagePersistenceService, MessageTarget,
    MemoryStore, NewMessage, OfflineDeliveryQueue, PubSub,
};
use courier_protocol::{MessageKind, ServerEvent};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Benchmark publishing to rooms of various sizes.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for members in [1usize, 10, 100, 1000] {
        let (router, mut receivers) = populated_room("conversation:bench", members);
        let message = sample_message(256);

        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let delivered = router.publish(
                    "conversation:bench",
                    ServerEvent::NewMessage {
                        message: message.clone(),
                    },
                    None,
                );
                drain(&mut receivers);
                black_box(delivered)
            })
        });
    }

    group.finish();
}

/// Benchmark registry operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    let registry = ConnectionRegistry::new();
    for i in 0..10_000 {
        registry.register(&format!("user_{}", i), ConnectionId::new(format!("conn_{}", i)));
    }

    group.bench_function("lookup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(registry.lookup(&format!("user_{}", i)))
        })
    });

    group.bench_function("register_unregister", |b| {
        let connection = ConnectionId::new("conn_bench");
        b.iter(|| {
            registry.register("bench_user", connection.clone());
            black_box(registry.unregister("bench_user", &connection))
        })
    });

    group.finish();
}

/// Benchmark the offline queue on the memory store.
fn bench_queue(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let mut group = c.benchmark_group("offline_queue");
    let message = sample_message(256);

    group.bench_function("enqueue", |b| {
        let queue = OfflineDeliveryQueue::new(Arc::new(MemoryStore::new()));
        b.iter(|| runtime.block_on(queue.enqueue("alice", black_box(&message))))
    });

    group.bench_function("drain_100", |b| {
        let queue = OfflineDeliveryQueue::new(Arc::new(MemoryStore::new()));
        runtime.block_on(async {
            for _ in 0..100 {
                queue.enqueue("alice", &message).await;
            }
        });
        b.iter(|| black_box(runtime.block_on(queue.drain("alice"))))
    });

    group.finish();
}

/// Benchmark message persistence on an in-memory database.
fn bench_persistence(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let mut group = c.benchmark_group("persistence");

    let service = MessagePersistenceService::new(Arc::new(
        Database::open_in_memory().expect("database"),
    ));
    let new = NewMessage {
        sender_id: "bob".into(),
        target: MessageTarget::Direct("alice".into()),
        content: "hello".into(),
        kind: MessageKind::Text,
        attachments: vec![],
        reply_to_id: None,
    };

    group.bench_function("create_direct", |b| {
        b.iter(|| black_box(runtime.block_on(service.create_message(new.clone()))))
    });

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_registry, bench_queue, bench_persistence);
criterion_main!(benches);
