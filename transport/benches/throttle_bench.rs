// Hot-path benchmarks for the datagram sender and receiver.
//
// Covers token bucket admission (pure and clock-backed), deferred wait-time
// queries, and the inbound dedup window under fresh and repeated ids.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::time::Instant;

use relaynet_transport::dedup::SeenCache;
use relaynet_transport::message::MessageId;
use relaynet_transport::ratelimit::{TokenBucket, TokenBucketState};

fn bench_bucket_state(c: &mut Criterion) {
    let start = Instant::now();
    let mut state = TokenBucketState::new(10.0, 1.0, start);
    let mut tick = 0u64;

    c.bench_function("throttle/consume_at", |b| {
        b.iter(|| {
            tick += 1;
            state.consume_at(1.0, start + Duration::from_millis(tick))
        });
    });
}

fn bench_bucket_shared(c: &mut Criterion) {
    let bucket = TokenBucket::new(1_000_000.0, 1_000_000.0);
    c.bench_function("throttle/consume", |b| {
        b.iter(|| bucket.consume(1.0));
    });

    let empty = TokenBucket::new(1.0, 0.001);
    empty.consume(1.0);
    c.bench_function("throttle/wait_time", |b| {
        b.iter(|| empty.wait_time(1.0));
    });
}

fn bench_seen_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup/insert_fresh");
    for capacity in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let cache = SeenCache::new(capacity, Duration::from_secs(600));
                b.iter(|| cache.insert(MessageId::new()));
            },
        );
    }
    group.finish();

    let cache = SeenCache::new(10_000, Duration::from_secs(600));
    let repeated = MessageId::new();
    cache.insert(repeated);
    c.bench_function("dedup/insert_duplicate", |b| {
        b.iter(|| cache.insert(repeated));
    });
}

criterion_group!(benches, bench_bucket_state, bench_bucket_shared, bench_seen_cache);
criterion_main!(benches);
