//! Engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tierdb_bench::{key, memory_engine, merged_engine, random_data, shuffled_keys};
use tierdb_core::Deletable;

/// Benchmark upserts into the mutable segment, sealing as it fills.
fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");

    for size in [64, 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let engine = memory_engine(100_000);
            let data = random_data(size);
            let mut i = 0u64;

            b.iter(|| {
                engine
                    .upsert(key(black_box(i)), Deletable::new(data.clone()))
                    .unwrap();
                i += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark point reads served by the mutable segment.
fn bench_get_mutable(c: &mut Criterion) {
    let engine = memory_engine(1_000_000);
    for i in 0..10_000 {
        engine.upsert(key(i), Deletable::new(vec![0; 64])).unwrap();
    }
    let keys = shuffled_keys(10_000);
    let mut next = 0;

    c.bench_function("get_mutable", |b| {
        b.iter(|| {
            let k = &keys[next % keys.len()];
            next += 1;
            black_box(engine.get(black_box(k)).unwrap());
        });
    });
}

/// Benchmark point reads served by the disk segment.
fn bench_get_disk(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_disk");

    for count in [10_000u64, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let engine = merged_engine(count, 64);
            let keys = shuffled_keys(count);
            let mut next = 0;

            b.iter(|| {
                let k = &keys[next % keys.len()];
                next += 1;
                black_box(engine.get(black_box(k)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark a full ordered scan across tiers.
fn bench_iterate(c: &mut Criterion) {
    let engine = merged_engine(50_000, 64);
    for i in (0..50_000).step_by(10) {
        engine.upsert(key(i), Deletable::new(vec![1; 64])).unwrap();
    }

    let mut group = c.benchmark_group("iterate");
    group.throughput(Throughput::Elements(50_000));
    group.bench_function("two_tiers", |b| {
        b.iter(|| black_box(engine.iter().unwrap().count()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_upsert,
    bench_get_mutable,
    bench_get_disk,
    bench_iterate
);
criterion_main!(benches);
