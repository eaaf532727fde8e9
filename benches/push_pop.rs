//! Hot-path benchmarks.
//!
//! Measures the per-scope cost a worker thread pays for tracking and
//! the cost of a foreign snapshot.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flightrec::layout::size_for_stack_depth;
use flightrec::{
    ActivityData, ActivityRegistry, ActivitySnapshot, ActivityType, ScopedActivity, ThreadTracker,
};

fn bench_raw_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker");

    let size = size_for_stack_depth(32);
    let mut region = vec![0u64; size.div_ceil(8)];
    let tracker = unsafe { ThreadTracker::new(region.as_mut_ptr().cast(), size) };

    group.bench_function("push_pop", |b| {
        b.iter(|| {
            tracker.push_activity(
                black_box(0x1000),
                ActivityType::GENERIC,
                ActivityData::for_generic(black_box(42), 7),
            );
            tracker.pop_activity();
        })
    });

    group.bench_function("snapshot", |b| {
        tracker.push_activity(0x1000, ActivityType::GENERIC, ActivityData::for_generic(1, 1));
        let mut out = ActivitySnapshot::default();
        b.iter(|| {
            tracker.snapshot(black_box(&mut out)).expect("snapshot");
        });
        tracker.pop_activity();
    });

    group.finish();
}

fn bench_scoped_activity(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope");

    let registry = ActivityRegistry::with_local_memory(64 * 1024, 1, "bench", 32);
    // Warm the thread-local slot so the measurement is steady state.
    registry.with_tracker_or_create(|_| ());

    group.bench_function("generic_scope", |b| {
        b.iter(|| {
            let _scope = ScopedActivity::new(&registry, black_box(0x1000), 0, 42, 7);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_raw_push_pop, bench_scoped_activity);
criterion_main!(benches);
