//! Writer-vs-reader soak for the snapshot protocol.
//!
//! One thread hammers push/pop on a region while another takes
//! snapshots as fast as it can. Every successful snapshot must be a
//! stack the writer genuinely had at some moment: consistent records,
//! plausible depth, no fields mixed between two activities.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use flightrec::layout::size_for_stack_depth;
use flightrec::{
    ActivityData, ActivityPayload, ActivitySnapshot, ActivityType, SnapshotError, ThreadTracker,
};

const SLOTS: u32 = 4;

/// Raw region pointer that may cross threads; the snapshot protocol is
/// the synchronization.
struct RegionPtr(*mut u8);
unsafe impl Send for RegionPtr {}
unsafe impl Sync for RegionPtr {}

// ===========================================================================
// HELPERS
// ===========================================================================

/// A record is well-formed when every field derives from the same
/// pattern value.
fn assert_consistent(record: &flightrec::Activity) {
    let origin = record.origin_address;
    assert_eq!(
        record.payload(),
        ActivityPayload::Generic {
            id: origin as u32,
            info: origin as i32,
        },
        "record fields mix two activities"
    );
}

// ===========================================================================
// TESTS
// ===========================================================================

#[test]
fn snapshots_of_alternating_push_pop_never_tear() {
    let size = size_for_stack_depth(SLOTS);
    let mut region = vec![0u64; size.div_ceil(8)];
    let base = RegionPtr(region.as_mut_ptr().cast());
    let done = AtomicBool::new(false);
    let successes = AtomicUsize::new(0);

    thread::scope(|s| {
        let base = &base;
        let done = &done;
        let successes = &successes;

        s.spawn(move || {
            // SAFETY: the region outlives the scope and only this thread
            // writes it.
            let tracker = unsafe { ThreadTracker::new(base.0, size) };
            for round in 0..50_000u64 {
                // Two well-known patterns; a torn copy would show fields
                // from both.
                let pattern = if round % 2 == 0 { 0xAAAA } else { 0xBBBB };
                tracker.push_activity(
                    pattern,
                    ActivityType::GENERIC,
                    ActivityData::for_generic(pattern as u32, pattern as i32),
                );
                tracker.pop_activity();
            }
            done.store(true, Ordering::Release);
        });

        s.spawn(move || {
            // SAFETY: read-only view of the same region.
            let reader = unsafe { ThreadTracker::from_existing(base.0, size) };
            let mut out = ActivitySnapshot::default();
            while !done.load(Ordering::Acquire) {
                match reader.snapshot(&mut out) {
                    Ok(()) => {
                        successes.fetch_add(1, Ordering::Relaxed);
                        assert!(out.activity_stack_depth <= 1);
                        assert!(out.activity_stack.len() <= 1);
                        for record in &out.activity_stack {
                            let origin = record.origin_address;
                            assert!(
                                origin == 0xAAAA || origin == 0xBBBB,
                                "unknown origin {origin:#x}"
                            );
                            assert_consistent(record);
                        }
                    }
                    // The reader can start before the writer's region is
                    // born, and the writer may out-pace every retry.
                    Err(SnapshotError::InvalidRegion | SnapshotError::Inconsistent) => {}
                }
            }
        });
    });

    // The writer ends with an empty, quiescent stack; at minimum the
    // final snapshots must have succeeded.
    let mut out = ActivitySnapshot::default();
    let reader = unsafe { ThreadTracker::from_existing(region.as_mut_ptr().cast(), size) };
    reader.snapshot(&mut out).expect("quiescent snapshot");
    assert_eq!(out.activity_stack_depth, 0);
    assert!(successes.load(Ordering::Relaxed) > 0);
}

#[test]
fn snapshots_are_prefixes_of_the_writer_stack() {
    let size = size_for_stack_depth(SLOTS);
    let mut region = vec![0u64; size.div_ceil(8)];
    let base = RegionPtr(region.as_mut_ptr().cast());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let base = &base;
        let done = &done;

        s.spawn(move || {
            let tracker = unsafe { ThreadTracker::new(base.0, size) };
            for _round in 0..20_000 {
                // Record i always carries the value i, so any consistent
                // snapshot is a prefix of 0, 1, 2.
                for i in 0..3u64 {
                    tracker.push_activity(
                        i,
                        ActivityType::GENERIC,
                        ActivityData::for_generic(i as u32, i as i32),
                    );
                }
                for _ in 0..3 {
                    tracker.pop_activity();
                }
            }
            done.store(true, Ordering::Release);
        });

        s.spawn(move || {
            let reader = unsafe { ThreadTracker::from_existing(base.0, size) };
            let mut out = ActivitySnapshot::default();
            while !done.load(Ordering::Acquire) {
                if reader.snapshot(&mut out).is_ok() {
                    assert!(out.activity_stack_depth <= 3);
                    assert_eq!(out.activity_stack.len(), out.activity_stack_depth as usize);
                    for (index, record) in out.activity_stack.iter().enumerate() {
                        assert_eq!(record.origin_address, index as u64);
                        assert_consistent(record);
                    }
                }
            }
        });
    });
}

#[test]
fn many_sequential_snapshots_while_stack_is_static() {
    let size = size_for_stack_depth(SLOTS);
    let mut region = vec![0u64; size.div_ceil(8)];
    let tracker = unsafe { ThreadTracker::new(region.as_mut_ptr().cast(), size) };
    tracker.push_activity(7, ActivityType::GENERIC, ActivityData::for_generic(7, 7));

    // A static stack must snapshot on the first attempt, every time.
    let mut out = ActivitySnapshot::default();
    for _ in 0..1_000 {
        tracker.snapshot(&mut out).expect("static snapshot");
        assert_eq!(out.activity_stack_depth, 1);
        assert_consistent(&out.activity_stack[0]);
    }
    tracker.pop_activity();
}
