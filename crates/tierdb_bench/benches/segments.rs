//! Segment log and merge benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use std::sync::Arc;
use tempfile::TempDir;
use tierdb_bench::{key, memory_engine, random_data};
use tierdb_core::{category, Deletable, DurableLog, LogOptions, LogRecord, OpIndex, SegmentId};
use tierdb_storage::{FileStoreProvider, InMemoryStoreProvider, StoreProvider};

/// Benchmark log appends with and without fsync.
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");
    group.sample_size(30);

    let record = LogRecord::new(OpIndex::new(1), key(1), random_data(256));
    group.throughput(Throughput::Bytes(record.encoded_len() as u64));

    group.bench_function("memory", |b| {
        let provider: Arc<dyn StoreProvider> = Arc::new(InMemoryStoreProvider::new());
        let log = DurableLog::open(
            provider,
            SegmentId::new(1),
            category::SEGMENT_LOG,
            LogOptions::default(),
        )
        .unwrap();
        b.iter(|| log.append(black_box(&record)).unwrap());
    });

    for sync in [false, true] {
        let name = if sync { "file_sync" } else { "file" };
        group.bench_function(name, |b| {
            let dir = TempDir::new().unwrap();
            let provider: Arc<dyn StoreProvider> =
                Arc::new(FileStoreProvider::open(dir.path()).unwrap());
            let log = DurableLog::open(
                provider,
                SegmentId::new(1),
                category::SEGMENT_LOG,
                LogOptions::default().sync_on_write(sync),
            )
            .unwrap();
            b.iter(|| log.append(black_box(&record)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark merging read-only segments into the disk segment.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_read_only");
    group.sample_size(10);

    for count in [10_000u64, 50_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let payload = random_data(64);
            b.iter_batched(
                || {
                    let engine = memory_engine(count as usize / 4);
                    for i in 0..count {
                        engine
                            .upsert(key(i), Deletable::new(payload.clone()))
                            .unwrap();
                    }
                    engine.seal_mutable_segment().unwrap();
                    engine
                },
                |engine| black_box(engine.merge_read_only_segments().unwrap()),
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_log_append, bench_merge);
criterion_main!(benches);
