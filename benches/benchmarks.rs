
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;
use tvbuf::{ArrayPool, DoubleTvList, NvmDoubleTvList, PoolConfig, SeriesKey};

use std::sync::Arc;

const POINTS: usize = 50_000;

fn series() -> SeriesKey {
    SeriesKey::new("root.bench", "d0", "s0")
}

fn plain_pool() -> Arc<ArrayPool> {
    ArrayPool::new(PoolConfig::default()).expect("pool init")
}

fn bench_append(c: &mut Criterion) {
    let data = datasets::generate_points(datasets::DEFAULT_SEED, POINTS, datasets::Order::InOrder);
    let mut group = c.benchmark_group("append");

    // Warm pool: chunks come from the free lists after the first iteration.
    let pool = plain_pool();
    group.bench_function("append_50k_plain_warm_pool", |b| {
        b.iter(|| {
            let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
            for (t, v) in data.times.iter().zip(&data.values) {
                list.put(black_box(*t), black_box(*v)).unwrap();
            }
            list.release().unwrap();
        })
    });

    group.bench_function("append_50k_plain_cold_pool", |b| {
        b.iter_batched(
            plain_pool,
            |pool| {
                let mut list = DoubleTvList::new(pool, series()).unwrap();
                list.put_all(black_box(&data.times), black_box(&data.values))
                    .unwrap();
                list
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");
    let pool = plain_pool();

    for (name, order) in [
        ("shuffled", datasets::Order::Shuffled),
        (
            "mostly_in_order",
            datasets::Order::MostlyInOrder {
                late_fraction: 0.05,
                lateness: 200,
            },
        ),
    ] {
        let data = datasets::generate_points(datasets::DEFAULT_SEED, POINTS, order);
        group.bench_function(format!("sort_50k_{name}"), |b| {
            b.iter_batched(
                || {
                    let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
                    list.put_all(&data.times, &data.values).unwrap();
                    list
                },
                |mut list| {
                    list.sort().unwrap();
                    list
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_plain_vs_persistent(c: &mut Criterion) {
    let data = datasets::generate_points(datasets::DEFAULT_SEED, POINTS, datasets::Order::Shuffled);
    let dir = TempDir::new().expect("tempdir");
    let pmem = ArrayPool::new(PoolConfig {
        pmem_dir: Some(dir.path().to_path_buf()),
        ..PoolConfig::default()
    })
    .expect("pmem pool init");
    let plain = plain_pool();

    let mut group = c.benchmark_group("medium");
    group.sample_size(20);

    group.bench_function("append_sort_50k_plain", |b| {
        b.iter(|| {
            let mut list = DoubleTvList::new(Arc::clone(&plain), series()).unwrap();
            list.put_all(&data.times, &data.values).unwrap();
            list.sort().unwrap();
            list.release().unwrap();
        })
    });

    group.bench_function("append_sort_50k_persistent", |b| {
        b.iter(|| {
            let mut list = NvmDoubleTvList::new(Arc::clone(&pmem), series()).unwrap();
            list.put_all(&data.times, &data.values).unwrap();
            list.sort().unwrap();
            list.release().unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_append, bench_sort, bench_plain_vs_persistent);
criterion_main!(benches);
