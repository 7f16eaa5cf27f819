use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rheo_data::allocators::{commit_defragmentation, plan_defragmentation, PoolAllocator};
use rheo_core::transfer::api::locator::PoolId;

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("Pool Allocator");

    group.bench_function("Allocate/free churn (1k blocks)", |b| {
        b.iter(|| {
            let mut pool = PoolAllocator::new(PoolId(0), 1 << 20);
            let mut locators = Vec::with_capacity(1_000);
            for i in 0..1_000u64 {
                locators.push(pool.allocate(64 + (i % 7) * 16).unwrap());
            }
            // Free every other block, then refill the holes.
            for locator in locators.iter().step_by(2) {
                pool.free(locator).unwrap();
            }
            for _ in 0..500 {
                black_box(pool.allocate(64).unwrap());
            }
        });
    });

    group.bench_function("Plan + commit defragmentation (500 holes)", |b| {
        b.iter(|| {
            let mut pool = PoolAllocator::new(PoolId(0), 1 << 20);
            let mut locators = Vec::with_capacity(1_000);
            for _ in 0..1_000u64 {
                locators.push(pool.allocate(512).unwrap());
            }
            for locator in locators.iter().step_by(2) {
                pool.free(locator).unwrap();
            }

            let plan = plan_defragmentation(&pool, |_, _| false);
            let remaps = commit_defragmentation(&mut pool, &plan).unwrap();
            black_box(remaps.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pool);
criterion_main!(benches);
