//! Benchmarks for pool acquisition and release.

use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use appool::pool::{GetOptions, Pool, PoolConfig, StandardPool};

#[path = "../tests/common/mod.rs"]
mod common;

fn bench_pool(config: PoolConfig) -> Arc<StandardPool> {
    let (spawner, _handles) = common::stub_spawner();
    Arc::new(StandardPool::new(Box::new(spawner), config))
}

/// Steady-state acquisition: one warm worker, get then drop.
fn bench_get_release(c: &mut Criterion) {
    let pool = bench_pool(PoolConfig {
        // Keep the cleaner quiet during measurement.
        max_idle: Duration::from_secs(3600),
        ..PoolConfig::default()
    });
    let opts = GetOptions::new("/srv/bench");
    // Warm up the single worker.
    drop(pool.get(&opts).unwrap());

    c.bench_function("get_release_reuse", |b| {
        b.iter(|| {
            let session = pool.get(black_box(&opts)).unwrap();
            black_box(session.pid());
        });
    });
}

/// Acquisition across many app roots, exercising cross-app eviction.
fn bench_eviction_churn(c: &mut Criterion) {
    let pool = bench_pool(PoolConfig {
        max: 4,
        max_idle: Duration::from_secs(3600),
        ..PoolConfig::default()
    });
    let roots: Vec<GetOptions> = (0..8)
        .map(|i| GetOptions::new(format!("/srv/bench-{}", i)))
        .collect();
    let mut next = 0;

    c.bench_function("get_release_eviction_churn", |b| {
        b.iter(|| {
            let opts = &roots[next % roots.len()];
            next += 1;
            let session = pool.get(black_box(opts)).unwrap();
            black_box(session.pid());
        });
    });
}

criterion_group!(benches, bench_get_release, bench_eviction_churn);
criterion_main!(benches);
