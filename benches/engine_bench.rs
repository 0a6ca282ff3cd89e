//! STRATA - Performance Benchmarks
//! Measures throughput of core engine operations using Criterion.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::device::MemoryDeviceManager;
use strata::{Config, EngineOptions, IteratorMode, OptionDeletionPolicy, Strata};

type Engine = Strata<String, Option<String>>;

fn open(dir: &std::path::Path, max_items: usize) -> Engine {
    let config = Config::new(dir)
        .with_mutable_segment_max_item_count(max_items)
        .with_sync_writes(false);
    let options = EngineOptions::new(config, Arc::new(OptionDeletionPolicy))
        .unwrap()
        .with_device_manager(Arc::new(MemoryDeviceManager::new()));
    Strata::open(options).unwrap()
}

fn fill(engine: &Engine, count: usize) {
    for i in 0..count {
        engine
            .upsert(format!("key_{:06}", i), Some(format!("value_{:06}", i)))
            .unwrap();
    }
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("writes");

    for size in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("upsert", size), size, |b, &size| {
            b.iter(|| {
                let dir = tempfile::tempdir().unwrap();
                let engine = open(dir.path(), 2_000);
                fill(&engine, size);
                black_box(engine.op_index());
            });
        });
    }

    group.bench_function("delete_1000", |b| {
        b.iter(|| {
            let dir = tempfile::tempdir().unwrap();
            let engine = open(dir.path(), 2_000);
            fill(&engine, 1_000);
            for i in 0..1_000 {
                engine.delete(format!("key_{:06}", i)).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("reads");
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 1_000);
    fill(&engine, 10_000);
    engine.move_segment_zero_forward().unwrap();
    engine.merge();
    fill(&engine, 500);

    group.bench_function("get_memory_hit", |b| {
        let key = "key_000250".to_string();
        b.iter(|| black_box(engine.try_get(black_box(&key)).unwrap()));
    });

    group.bench_function("get_disk_hit", |b| {
        let key = "key_005000".to_string();
        b.iter(|| black_box(engine.try_get(black_box(&key)).unwrap()));
    });

    group.bench_function("get_miss", |b| {
        let key = "nonexistent_key".to_string();
        b.iter(|| black_box(engine.try_get(black_box(&key)).unwrap()));
    });

    group.bench_function("scan_10000", |b| {
        b.iter(|| {
            let count = engine
                .create_iterator(IteratorMode::NoRefresh)
                .unwrap()
                .count();
            black_box(count);
        });
    });

    group.bench_function("count", |b| {
        b.iter(|| black_box(engine.count().unwrap()));
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    for segments in [4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::new("read_only_segments", segments),
            segments,
            |b, &segments| {
                b.iter(|| {
                    let dir = tempfile::tempdir().unwrap();
                    let engine = open(dir.path(), 1_000);
                    fill(&engine, segments * 1_000);
                    engine.move_segment_zero_forward().unwrap();
                    black_box(engine.merge());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_writes, bench_reads, bench_merge);
criterion_main!(benches);
