//! Performance benchmarks for commits, fan-out and snapshot builds.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use statestream::{
    Authorizer, ChangeSet, Context, Event, EventBusConfig, EventPayload, HandlerRegistry, Index,
    Operation, ReadTxn, Result, Schema, SnapshotAppender, Store, SubscribeRequest, Subject,
    Subscription, Topic, TopicHandler,
};
use std::time::Duration;

const SERVICES: Topic = Topic::from_static("service-health");
const TABLE: &str = "services";

#[derive(Debug)]
struct Health {
    name: String,
}

impl EventPayload for Health {
    fn subject(&self) -> Subject {
        Subject::key(self.name.clone())
    }

    fn has_read_permission(&self, _authz: &dyn Authorizer) -> bool {
        true
    }
}

fn derive(_tx: &ReadTxn, changes: &ChangeSet) -> Result<Vec<Event>> {
    Ok(changes
        .for_table(TABLE)
        .map(|m| {
            let op = if m.deleted() {
                Operation::Delete
            } else {
                Operation::Upsert
            };
            Event::new(SERVICES, op, Health { name: m.key.clone() })
        })
        .collect())
}

fn snapshot(tx: &ReadTxn, _subject: &Subject, appender: &mut SnapshotAppender) -> Result<Index> {
    let index = tx.table_index(TABLE)?;
    appender.append(tx.iter(TABLE)?.map(|(k, _)| {
        Event::new(SERVICES, Operation::Upsert, Health { name: k.to_string() }).with_index(index)
    }));
    Ok(index)
}

fn create_store(config: EventBusConfig) -> Store {
    let mut registry = HandlerRegistry::builder();
    registry
        .register_handler(SERVICES, TopicHandler::new(derive, snapshot).with_wildcard())
        .unwrap();
    Store::new(Schema::new().with_table(TABLE), registry.build(), config).unwrap()
}

fn open(store: &Store, subject: Subject) -> Subscription {
    let mut sub = store
        .subscribe(SubscribeRequest::new(SERVICES, subject), &Context::background())
        .unwrap();
    while !sub.next(&Context::background()).unwrap().is_end_of_snapshot() {}
    sub
}

/// Benchmark commit latency with nobody listening
fn bench_commit(c: &mut Criterion) {
    let store = create_store(EventBusConfig::default());
    let mut index = 0u64;

    c.bench_function("commit", |b| {
        b.iter(|| {
            index += 1;
            let mut tx = store.write(Index(index)).unwrap();
            tx.insert(TABLE, "web", json!({ "port": index })).unwrap();
            black_box(tx.commit().unwrap());
        });
    });
}

/// Benchmark commit plus delivery to a varying number of subscribers
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let store = create_store(EventBusConfig::default());
                let mut subs: Vec<Subscription> =
                    (0..count).map(|_| open(&store, Subject::key("web"))).collect();
                let mut index = 0u64;

                b.iter(|| {
                    index += 1;
                    let mut tx = store.write(Index(index)).unwrap();
                    tx.insert(TABLE, "web", json!({ "port": index })).unwrap();
                    tx.commit().unwrap();
                    for sub in subs.iter_mut() {
                        black_box(sub.next(&Context::background()).unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark snapshot builds with varying table sizes
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for rows in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("rows", rows), &rows, |b, &rows| {
            let store = create_store(EventBusConfig {
                snapshot_cache_ttl: Duration::ZERO,
                ..Default::default()
            });
            let mut tx = store.write(Index(1)).unwrap();
            for i in 0..rows {
                tx.insert(TABLE, &format!("svc-{}", i), json!({ "port": i }))
                    .unwrap();
            }
            tx.commit().unwrap();

            b.iter(|| {
                black_box(open(&store, Subject::Wildcard));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_commit, bench_fan_out, bench_snapshot);

criterion_main!(benches);
