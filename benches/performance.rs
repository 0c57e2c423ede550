//! Performance benchmarks for feed decoding and the document cache.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use feedsync::{
    decode_line, CacheConfig, ChangeEvent, ChangeListener, ChangeReceiver, DocKey, LineFramer,
    MemoryCache, Result,
};
use serde_json::json;
use std::sync::Arc;

struct NullListener;

impl ChangeListener for NullListener {
    fn changed(&self, event: &ChangeEvent) -> Result<()> {
        black_box(event);
        Ok(())
    }
}

/// A feed of `count` events with a heartbeat every tenth line.
fn feed_bytes(count: u64) -> Vec<u8> {
    let mut feed = String::new();
    for seq in 1..=count {
        feed.push_str(&format!(
            "{{\"seq\":{},\"id\":\"doc-{}\",\"changes\":[{{\"rev\":\"1-{:032x}\"}}]}}\n",
            seq, seq, seq
        ));
        if seq % 10 == 0 {
            feed.push('\n');
        }
    }
    feed.into_bytes()
}

/// Benchmark decoding single records
fn bench_decode_line(c: &mut Criterion) {
    let event = r#"{"seq":3934,"id":"cc4fadc922f11ffb5e358d5da2760de2","changes":[{"rev":"1-1e379f46917bc2fc9b9562a58afde75a"}]}"#;
    let tombstone = r#"{"deleted": true, "changes": [{"rev": "2-5e8bd6dae4307ca6f8fcf8afa53e6bc4"}], "id": "27e74762ad0e64d4094f6feea800a826", "seq": 34}"#;

    c.bench_function("decode_event", |b| b.iter(|| decode_line(black_box(event))));
    c.bench_function("decode_tombstone", |b| {
        b.iter(|| decode_line(black_box(tombstone)))
    });
    c.bench_function("decode_heartbeat", |b| b.iter(|| decode_line(black_box(""))));
}

/// Benchmark framing plus dispatch with varying chunk sizes
fn bench_feed_throughput(c: &mut Criterion) {
    let bytes = feed_bytes(1000);
    let mut group = c.benchmark_group("feed_throughput");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    for chunk_size in [64, 1024, 8192] {
        group.bench_with_input(
            BenchmarkId::new("chunk_size", chunk_size),
            &chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut framer = LineFramer::new();
                    let mut receiver = ChangeReceiver::new();
                    receiver.subscribe(Arc::new(NullListener));
                    for chunk in bytes.chunks(size) {
                        for line in framer.push(chunk) {
                            receiver.line_received(&line).unwrap();
                        }
                    }
                    black_box(receiver.event_count())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark cache hits and misses at varying sizes
fn bench_cache_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lookup");

    for size in [100, 10_000] {
        let cache = MemoryCache::new();
        for i in 0..size {
            cache.fill(DocKey::new("bench", format!("doc-{}", i)), json!({"n": i}));
        }
        let present = DocKey::new("bench", format!("doc-{}", size / 2));
        let absent = DocKey::new("bench", "missing");

        group.bench_with_input(BenchmarkId::new("hit", size), &present, |b, key| {
            b.iter(|| cache.lookup(black_box(key)))
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &absent, |b, key| {
            b.iter(|| cache.lookup(black_box(key)))
        });
    }

    group.finish();
}

/// Benchmark fill/invalidate churn, with and without a capacity bound
fn bench_cache_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_churn");

    for capacity in [0usize, 256] {
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, &capacity| {
                let cache = MemoryCache::with_config(CacheConfig::new().with_capacity(capacity));
                let keys: Vec<DocKey> = (0..1000)
                    .map(|i| DocKey::new("bench", format!("doc-{}", i)))
                    .collect();

                b.iter(|| {
                    for key in &keys {
                        cache.fill(key.clone(), json!(1));
                    }
                    for key in keys.iter().step_by(2) {
                        cache.invalidate(key);
                    }
                    black_box(cache.len())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_decode_line,
    bench_feed_throughput,
    bench_cache_lookup,
    bench_cache_churn,
);
criterion_main!(benches);
