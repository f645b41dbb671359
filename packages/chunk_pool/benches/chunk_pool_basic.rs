//! Basic benchmarks for the `chunk_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::{self, Layout};
use std::hint::black_box;
use std::iter;
use std::ptr::NonNull;
use std::time::Instant;

use chunk_pool::{FixedPool, GenericPool, PoolExt, PoolRegistry, Ptr, Strategy};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = u64;
const TEST_VALUE: TestItem = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_pool_basic");

    group.bench_function("fixed_alloc_free_one", |b| {
        let layout = Layout::new::<TestItem>();
        let mut pool = FixedPool::builder().layout(layout).build();

        b.iter(|| {
            let ptr = pool.allocate(layout);

            // SAFETY: The entry came from this pool and is returned exactly once.
            unsafe { pool.deallocate(black_box(ptr)) };
        });
    });

    group.bench_function("generic_alloc_free_one", |b| {
        let layout = Layout::new::<TestItem>();
        let mut pool = GenericPool::new();

        b.iter(|| {
            let ptr = pool.allocate(layout);

            // SAFETY: The entry came from this pool and is returned exactly once.
            unsafe { pool.deallocate(black_box(ptr)) };
        });
    });

    group.bench_function("heap_alloc_free_one", |b| {
        let layout = Layout::new::<TestItem>();

        b.iter(|| {
            // SAFETY: The layout has a non-zero size.
            let ptr = unsafe { alloc::alloc(layout) };

            // SAFETY: Allocated above with the same layout.
            unsafe { alloc::dealloc(black_box(ptr), layout) };
        });
    });

    group.bench_function("ptr_clone_drop", |b| {
        let registry = PoolRegistry::new();
        let mut handle = registry.create(&Strategy::DefaultFixedPool, TEST_VALUE);

        b.iter(|| {
            drop(black_box(Ptr::clone(&handle)));
        });

        registry.destroy(&Strategy::DefaultFixedPool, &mut handle);
        registry.deinit();
    });

    group.finish();

    let mut group = c.benchmark_group("chunk_pool_slow");

    group.bench_function("fixed_create_destroy_10k", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| FixedPool::builder().layout_of::<TestItem>().build())
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                let items = (0..10_000)
                    .map(|_| pool.create(black_box(TEST_VALUE)))
                    .collect::<Vec<NonNull<TestItem>>>();

                for item in items {
                    // SAFETY: Every item was created by this pool and is destroyed exactly once.
                    unsafe { pool.destroy(item) };
                }
            }

            start.elapsed()
        });
    });

    group.bench_function("fixed_block_16", |b| {
        let layout = Layout::new::<TestItem>();
        let mut pool = FixedPool::builder().layout(layout).build();

        b.iter(|| {
            let block = pool.allocate_block(layout, 16).unwrap();

            // SAFETY: The block came from this pool and is returned with its own count.
            unsafe { pool.deallocate_block(black_box(block), 16) };
        });
    });

    group.finish();
}
