//! The per-thread activity stack.
//!
//! A [`ThreadTracker`] owns one region and records what its thread is
//! doing right now as a bounded LIFO of activity records. Exactly one
//! thread ever writes a region; any number of foreign observers, in
//! this process or another, may read it through [`ThreadTracker::snapshot`].
//!
//! # Publication protocol
//!
//! A push writes its record with plain stores while the slot is still
//! private, then publishes it with a release-store of the new depth.
//! A pop decrements the depth relaxed and then release-stores zero into
//! the tear flag, which is how an in-flight reader learns its copy may
//! be stale. The reader stores non-zero into the flag before copying and
//! re-checks it afterwards with seq-cst ordering on both sides, giving a
//! total order against the writer's pop. Region birth publishes every
//! header field through a release-store of the process id.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::ThreadId;

use serde::Serialize;

use crate::clock;
use crate::error::SnapshotError;
use crate::layout::{
    size_for_stack_depth, Activity, ActivityData, ActivityType, Header, HEADER_COOKIE,
    MIN_STACK_DEPTH, THREAD_NAME_LEN,
};

/// Snapshot attempts before giving up on a busy writer.
const MAX_SNAPSHOT_ATTEMPTS: usize = 10;

/// Returns a process-unique, non-zero reference for the calling thread.
pub(crate) fn current_thread_ref() -> i64 {
    static NEXT_THREAD_REF: AtomicI64 = AtomicI64::new(1);
    thread_local! {
        static THREAD_REF: Cell<i64> = const { Cell::new(0) };
    }
    THREAD_REF.with(|slot| {
        if slot.get() == 0 {
            slot.set(NEXT_THREAD_REF.fetch_add(1, Ordering::Relaxed));
        }
        slot.get()
    })
}

/// A consistent view of one thread's stack, as of some moment.
///
/// `activity_stack_depth` is the logical depth and may exceed the number
/// of records when the writer overflowed its region.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivitySnapshot {
    /// Process id of the writer at the time of the snapshot.
    pub process_id: i64,
    /// Thread reference of the writer.
    pub thread_id: i64,
    /// Writer thread name, trimmed at the first NUL.
    pub thread_name: String,
    /// The recorded stack, bottom first, with times in wall clock.
    pub activity_stack: Vec<Activity>,
    /// Logical depth, including lost overflow entries.
    pub activity_stack_depth: u32,
}

/// Tracks one thread's in-progress activities in a caller-provided
/// region.
///
/// The write API (`push_activity`, `change_activity`, `pop_activity`)
/// belongs to the owning thread; [`snapshot`](Self::snapshot) may be
/// called from anywhere. A tracker whose construction parameters were
/// invalid stays permanently inert: every operation is a no-op and
/// [`is_valid`](Self::is_valid) reports false.
pub struct ThreadTracker {
    header: Option<NonNull<Header>>,
    stack: NonNull<Activity>,
    stack_slots: u32,
    owner: Option<ThreadId>,
}

// SAFETY: shared access is the point of the type. The header fields that
// both sides touch are atomics; record slots are published to readers
// only through the release-store of the depth, and reader copies are
// revalidated through the tear flag.
unsafe impl Send for ThreadTracker {}
unsafe impl Sync for ThreadTracker {}

impl ThreadTracker {
    /// Creates the writer-side tracker for the calling thread.
    ///
    /// A zeroed region is born: identity, time references, capacity, and
    /// thread name are written, then the cookie, and finally the process
    /// id with release ordering so a reader that sees it may trust the
    /// rest. A non-zero cookie means the region already has a history
    /// and is adopted as-is.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes, 8-byte aligned, valid and
    /// unmoved for the tracker's lifetime, and no other thread may be
    /// writing the region.
    #[must_use]
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        let mut tracker = Self::with_region(base, size);
        tracker.owner = Some(std::thread::current().id());

        let Some(header) = tracker.header else {
            return tracker;
        };
        let header_ptr = header.as_ptr();

        // Provided memory is either fully initialized or all zeros.
        if ptr::addr_of!((*header_ptr).cookie).read_volatile() == 0 {
            debug_assert_eq!((*header_ptr).process_id(Ordering::Relaxed), 0);
            debug_assert_eq!(ptr::addr_of!((*header_ptr).thread_ref).read(), 0);
            debug_assert_eq!((*header_ptr).current_depth.load(Ordering::Relaxed), 0);

            ptr::addr_of_mut!((*header_ptr).thread_ref).write(current_thread_ref());
            ptr::addr_of_mut!((*header_ptr).start_time).write(clock::wall_now());
            ptr::addr_of_mut!((*header_ptr).start_ticks).write(clock::ticks_now());
            ptr::addr_of_mut!((*header_ptr).stack_slots).write(tracker.stack_slots);

            let mut name = [0u8; THREAD_NAME_LEN];
            let current = std::thread::current();
            let bytes = current.name().unwrap_or("").as_bytes();
            let len = bytes.len().min(THREAD_NAME_LEN - 1);
            name[..len].copy_from_slice(&bytes[..len]);
            ptr::addr_of_mut!((*header_ptr).thread_name).write(name);

            ptr::addr_of_mut!((*header_ptr).cookie).write_volatile(HEADER_COOKIE);

            // Done last so everything above is released by the time a
            // reader observes a non-zero process id.
            (*header_ptr).store_process_id(std::process::id() as i64, Ordering::Release);
            debug_assert!(tracker.is_valid());
        }
        tracker
    }

    /// Creates a read-side tracker over an existing region. Never
    /// initializes anything; a zeroed or half-born region simply fails
    /// validation and snapshotting.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes valid for reads, 8-byte
    /// aligned, and unmoved for the tracker's lifetime.
    #[must_use]
    pub unsafe fn from_existing(base: *mut u8, size: usize) -> Self {
        Self::with_region(base, size)
    }

    /// Validates the region geometry. Bad parameters produce an inert
    /// tracker rather than a crash, since region descriptions can come
    /// from external input.
    unsafe fn with_region(base: *mut u8, size: usize) -> Self {
        let header_size = std::mem::size_of::<Header>();
        let record_size = std::mem::size_of::<Activity>();
        let inert = Self {
            header: None,
            stack: NonNull::dangling(),
            stack_slots: 0,
            owner: None,
        };

        if base.is_null() || base.align_offset(8) != 0 {
            return inert;
        }
        if size < header_size + MIN_STACK_DEPTH as usize * record_size {
            return inert;
        }
        let slots = (size - header_size) / record_size;
        if slots > u32::MAX as usize {
            return inert;
        }

        Self {
            header: NonNull::new(base.cast::<Header>()),
            stack: NonNull::new_unchecked(base.add(header_size).cast::<Activity>()),
            stack_slots: slots as u32,
            owner: None,
        }
    }

    /// The number of activity slots in the region.
    #[must_use]
    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    /// Bytes required for a region holding `stack_depth` records.
    #[must_use]
    pub const fn size_for_stack_depth(stack_depth: u32) -> usize {
        size_for_stack_depth(stack_depth)
    }

    #[inline]
    fn on_owner_thread(&self) -> bool {
        self.owner
            .is_none_or(|owner| owner == std::thread::current().id())
    }

    /// Pushes a record for a newly entered activity.
    ///
    /// Wait-free: a relaxed depth load, a handful of plain stores, one
    /// release store. On overflow only the depth advances; the lost
    /// entries keep readers informed that the thread is still active.
    pub fn push_activity(&self, origin_address: u64, ty: ActivityType, data: ActivityData) {
        // Checking the calling thread may take a lock in some runtimes,
        // which would recurse when the activity being recorded is that
        // very acquisition, so lock pushes skip the check.
        debug_assert!(
            ty.same_category(ActivityType::LOCK_ACQUIRE) || self.on_owner_thread(),
            "push from a thread that does not own this tracker"
        );
        let Some(header) = self.header else { return };
        // SAFETY: region validated at construction; the atomic fields
        // are shared by design.
        let header = unsafe { header.as_ref() };

        // No memory guarded by the depth is read here, so relaxed is
        // enough.
        let depth = header.current_depth.load(Ordering::Relaxed);

        if depth >= self.stack_slots {
            // Lossy overflow: remember that something happened, touch no
            // record memory. Only this thread writes the depth, so a
            // plain relaxed store suffices.
            header.current_depth.store(depth + 1, Ordering::Relaxed);
            return;
        }

        // SAFETY: depth < stack_slots, so the slot is in bounds, and it
        // is invisible to readers until the release store below.
        unsafe {
            let slot = self.stack.as_ptr().add(depth as usize);
            (*slot).time_internal = clock::ticks_now();
            (*slot).origin_address = origin_address;
            (*slot).activity_type = ty.raw();
            (*slot).data = data;
            #[cfg(feature = "call-stack")]
            Self::capture_call_stack(slot);
        }

        // Releases the record writes to any reader that acquires the new
        // depth.
        header.current_depth.store(depth + 1, Ordering::Release);
    }

    #[cfg(feature = "call-stack")]
    unsafe fn capture_call_stack(slot: *mut Activity) {
        use crate::layout::CALL_STACK_DEPTH;
        let frames = ptr::addr_of_mut!((*slot).call_stack).cast::<u64>();
        let mut depth = 0usize;
        let mut skipped = false;
        backtrace::trace(|frame| {
            // The first frame is this function; callers want their own.
            if !skipped {
                skipped = true;
                return true;
            }
            if depth >= CALL_STACK_DEPTH {
                return false;
            }
            frames.add(depth).write(frame.ip() as usize as u64);
            depth += 1;
            true
        });
        if depth < CALL_STACK_DEPTH {
            frames.add(depth).write(0);
        }
    }

    /// Rewrites the topmost record in place without growing the stack.
    ///
    /// [`ActivityType::NULL`] leaves the type untouched and `None`
    /// leaves the payload untouched. The category of a record is
    /// immutable; only sub-action bits may change. No release is issued:
    /// the push that created the slot already published it, and a racing
    /// snapshot is caught by the tear flag.
    pub fn change_activity(&self, ty: ActivityType, data: Option<ActivityData>) {
        debug_assert!(self.on_owner_thread());
        debug_assert!(
            ty != ActivityType::NULL || data.is_some(),
            "change with nothing to change"
        );
        let Some(header) = self.header else { return };
        let header = unsafe { header.as_ref() };

        // Acquire the slot contents guarded by the depth.
        let depth = header.current_depth.load(Ordering::Acquire);
        debug_assert!(depth > 0, "change on an empty stack");
        if depth == 0 || depth > self.stack_slots {
            // Empty, or the top of the stack was lost to overflow.
            return;
        }

        // SAFETY: depth <= stack_slots, so the top slot exists, and only
        // the owning thread mutates it.
        unsafe {
            let slot = self.stack.as_ptr().add(depth as usize - 1);
            if ty != ActivityType::NULL {
                debug_assert!(
                    ActivityType::from_raw((*slot).activity_type).same_category(ty),
                    "change must not cross activity categories"
                );
                (*slot).activity_type = ty.raw();
            }
            if let Some(data) = data {
                (*slot).data = data;
            }
        }
    }

    /// Pops the most recent activity.
    ///
    /// The depth decrement itself guards nothing, so it is relaxed; the
    /// release-store of zero into the tear flag is what tells a reader
    /// mid-copy that its view changed under it.
    pub fn pop_activity(&self) {
        let Some(header) = self.header else { return };
        let header = unsafe { header.as_ref() };

        let depth = header.current_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(depth > 0, "pop on an empty stack");

        #[cfg(debug_assertions)]
        if depth > 0 && depth <= self.stack_slots {
            // Popping a lock acquisition may run on the lock path, where
            // the thread check itself is off limits.
            let ty = unsafe {
                ActivityType::from_raw((*self.stack.as_ptr().add(depth as usize - 1)).activity_type)
            };
            debug_assert!(
                ty.same_category(ActivityType::LOCK_ACQUIRE) || self.on_owner_thread(),
                "pop from a thread that does not own this tracker"
            );
        }

        header.stack_unchanged.store(0, Ordering::Release);
    }

    /// Full header validation: cookie, identity, time references,
    /// capacity, and a NUL-terminated thread name.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let Some(header) = self.header else {
            return false;
        };
        let header_ptr = header.as_ptr();
        // SAFETY: region validated at construction. Volatile reads keep
        // the checks honest against concurrent rebirth; any torn value
        // fails a predicate rather than invoking trouble.
        unsafe {
            let header_ref = header.as_ref();
            ptr::addr_of!((*header_ptr).cookie).read_volatile() == HEADER_COOKIE
                && header_ref.process_id(Ordering::Relaxed) != 0
                && ptr::addr_of!((*header_ptr).thread_ref).read_volatile() != 0
                && ptr::addr_of!((*header_ptr).start_time).read_volatile() != 0
                && ptr::addr_of!((*header_ptr).start_ticks).read_volatile() != 0
                && ptr::addr_of!((*header_ptr).stack_slots).read_volatile() == self.stack_slots
                && ptr::addr_of!((*header_ptr).thread_name).read_volatile()[THREAD_NAME_LEN - 1]
                    == 0
        }
    }

    /// Copies a consistent view of the stack into `out`.
    ///
    /// Callable from any thread or process. The buffer is reserved to
    /// full capacity up front so the timing-sensitive part allocates
    /// nothing. Each attempt copies the records and then proves nothing
    /// moved: the tear flag must still hold the value stored before the
    /// copy, and the writer identity must match the one read before it.
    /// At most one concurrent reader per region; two probes would clobber
    /// each other's flag.
    ///
    /// On success, record times have been translated to wall clock.
    pub fn snapshot(&self, out: &mut ActivitySnapshot) -> Result<(), SnapshotError> {
        if !self.is_valid() {
            return Err(SnapshotError::InvalidRegion);
        }
        let Some(header) = self.header else {
            return Err(SnapshotError::InvalidRegion);
        };
        let header_ptr = header.as_ptr();
        let header = unsafe { header.as_ref() };

        out.activity_stack.clear();
        out.activity_stack.reserve(self.stack_slots as usize);

        for _attempt in 0..MAX_SNAPSHOT_ATTEMPTS {
            // Acquire on the process id orders the header reads after
            // birth; the pair is re-read later to detect rebirth.
            let pid_before = header.process_id(Ordering::Acquire);
            let tid_before = unsafe { ptr::addr_of!((*header_ptr).thread_ref).read_volatile() };

            // Arm the tear flag. Seq-cst is expensive but this runs only
            // during analysis, never on the worker fast path.
            header.stack_unchanged.store(1, Ordering::SeqCst);

            // Fetching the depth acquires the stack contents.
            let depth = header.current_depth.load(Ordering::Acquire);
            let count = depth.min(self.stack_slots) as usize;
            out.activity_stack.clear();
            // SAFETY: count <= stack_slots <= the reserved capacity, and
            // Activity is plain data. The copy may race a concurrent
            // writer; the checks below reject any affected attempt.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.stack.as_ptr().cast_const(),
                    out.activity_stack.as_mut_ptr(),
                    count,
                );
                out.activity_stack.set_len(count);
            }

            // A pop during the copy zeroed the flag.
            if header.stack_unchanged.load(Ordering::SeqCst) == 0 {
                continue;
            }

            out.activity_stack_depth = depth;

            let name = unsafe { ptr::addr_of!((*header_ptr).thread_name).read_volatile() };
            let end = name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(THREAD_NAME_LEN - 1);
            out.thread_name = String::from_utf8_lossy(&name[..end]).into_owned();
            out.thread_id = unsafe { ptr::addr_of!((*header_ptr).thread_ref).read_volatile() };
            // Loaded last so identity changes during the reads above are
            // caught here.
            out.process_id = header.process_id(Ordering::SeqCst);

            // Identity changed: the tracker died and the region was
            // reborn under a new writer.
            if out.process_id != pid_before || out.thread_id != tid_before {
                continue;
            }

            // The thread may have ended mid-copy and had its region
            // zeroed; only a still-valid header makes the copy
            // trustworthy.
            if !self.is_valid() {
                return Err(SnapshotError::InvalidRegion);
            }

            let start_time = unsafe { ptr::addr_of!((*header_ptr).start_time).read_volatile() };
            let start_ticks = unsafe { ptr::addr_of!((*header_ptr).start_ticks).read_volatile() };
            for activity in &mut out.activity_stack {
                activity.time_internal =
                    clock::ticks_to_wall(start_time, start_ticks, activity.time_internal);
            }
            return Ok(());
        }

        Err(SnapshotError::Inconsistent)
    }
}

impl std::fmt::Debug for ThreadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTracker")
            .field("stack_slots", &self.stack_slots)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ActivityPayload;

    fn region_for(slots: u32) -> Vec<u64> {
        vec![0u64; size_for_stack_depth(slots).div_ceil(8)]
    }

    fn tracker_over(region: &mut [u64], slots: u32) -> ThreadTracker {
        unsafe { ThreadTracker::new(region.as_mut_ptr().cast(), size_for_stack_depth(slots)) }
    }

    fn snap(tracker: &ThreadTracker) -> ActivitySnapshot {
        let mut out = ActivitySnapshot::default();
        tracker.snapshot(&mut out).expect("snapshot");
        out
    }

    #[test]
    fn birth_produces_valid_region() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        assert!(tracker.is_valid());
        assert_eq!(tracker.stack_slots(), 4);
        let out = snap(&tracker);
        assert_eq!(out.process_id, std::process::id() as i64);
        assert_ne!(out.thread_id, 0);
        assert_eq!(out.activity_stack_depth, 0);
        assert!(out.activity_stack.is_empty());
    }

    #[test]
    fn null_base_is_inert() {
        let tracker = unsafe { ThreadTracker::new(std::ptr::null_mut(), 4096) };
        assert!(!tracker.is_valid());
        // Writer operations must not crash.
        tracker.push_activity(0, ActivityType::GENERIC, ActivityData::for_generic(1, 2));
        tracker.pop_activity();
        let mut out = ActivitySnapshot::default();
        assert_eq!(tracker.snapshot(&mut out), Err(SnapshotError::InvalidRegion));
    }

    #[test]
    fn undersized_region_is_inert() {
        let mut region = region_for(MIN_STACK_DEPTH);
        let size = size_for_stack_depth(MIN_STACK_DEPTH) - 1;
        let tracker = unsafe { ThreadTracker::new(region.as_mut_ptr().cast(), size) };
        assert!(!tracker.is_valid());
    }

    #[test]
    fn push_records_task_payload() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        tracker.push_activity(0x1000, ActivityType::TASK_RUN, ActivityData::for_task(42));

        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 1);
        assert_eq!(out.activity_stack.len(), 1);
        let record = &out.activity_stack[0];
        assert_eq!(record.origin_address, 0x1000);
        assert_eq!(record.kind(), ActivityType::TASK_RUN);
        assert_eq!(record.payload(), ActivityPayload::Task { sequence_id: 42 });
        assert!(record.time_internal > 0);
    }

    #[test]
    fn overflow_keeps_counting_but_loses_records() {
        let mut region = region_for(2);
        let tracker = tracker_over(&mut region, 2);
        for i in 0..3 {
            tracker.push_activity(
                0x1000 + i,
                ActivityType::GENERIC,
                ActivityData::for_generic(i as u32, 0),
            );
        }
        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 3);
        assert_eq!(out.activity_stack.len(), 2);
        assert_eq!(out.activity_stack[0].origin_address, 0x1000);
        assert_eq!(out.activity_stack[1].origin_address, 0x1001);

        tracker.pop_activity();
        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 2);
        assert_eq!(out.activity_stack.len(), 2);

        tracker.pop_activity();
        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 1);
        assert_eq!(out.activity_stack.len(), 1);
        assert_eq!(out.activity_stack[0].origin_address, 0x1000);
    }

    #[test]
    fn overflow_recovery_restores_previous_top() {
        let mut region = region_for(3);
        let tracker = tracker_over(&mut region, 3);
        for i in 0..3 {
            tracker.push_activity(
                i,
                ActivityType::GENERIC,
                ActivityData::for_generic(i as u32, 0),
            );
        }
        // Two lost pushes past capacity, then unwind them.
        tracker.push_activity(97, ActivityType::GENERIC, ActivityData::for_generic(97, 0));
        tracker.push_activity(98, ActivityType::GENERIC, ActivityData::for_generic(98, 0));
        tracker.pop_activity();
        tracker.pop_activity();

        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 3);
        assert_eq!(out.activity_stack.len(), 3);
        // The record that was at the top before overflow is intact.
        assert_eq!(out.activity_stack[2].origin_address, 2);
        assert_eq!(
            out.activity_stack[2].payload(),
            ActivityPayload::Generic { id: 2, info: 0 }
        );
    }

    #[test]
    fn change_rewrites_action_and_payload_in_place() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        tracker.push_activity(
            0x2000,
            ActivityType::LOCK_ACQUIRE,
            ActivityData::for_lock(0xDEAD),
        );

        tracker.change_activity(ActivityType::LOCK_ACQUIRE.with_action(0x2), None);
        let out = snap(&tracker);
        let record = &out.activity_stack[0];
        assert_eq!(record.origin_address, 0x2000);
        assert_eq!(record.kind(), ActivityType::LOCK_ACQUIRE.with_action(0x2));
        assert_eq!(record.payload(), ActivityPayload::Lock { address: 0xDEAD });

        tracker.change_activity(ActivityType::NULL, Some(ActivityData::for_lock(0xBEEF)));
        let out = snap(&tracker);
        let record = &out.activity_stack[0];
        assert_eq!(record.kind(), ActivityType::LOCK_ACQUIRE.with_action(0x2));
        assert_eq!(record.payload(), ActivityPayload::Lock { address: 0xBEEF });
    }

    #[test]
    fn change_on_overflowed_top_is_ignored() {
        let mut region = region_for(2);
        let tracker = tracker_over(&mut region, 2);
        for i in 0..3 {
            tracker.push_activity(
                i,
                ActivityType::GENERIC,
                ActivityData::for_generic(i as u32, 0),
            );
        }
        // Top of stack lives past capacity; nothing to rewrite.
        tracker.change_activity(
            ActivityType::GENERIC.with_action(0x5),
            Some(ActivityData::for_generic(9, 9)),
        );
        let out = snap(&tracker);
        assert_eq!(
            out.activity_stack[1].payload(),
            ActivityPayload::Generic { id: 1, info: 0 }
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "cross activity categories")]
    fn change_across_categories_asserts() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        tracker.push_activity(0, ActivityType::GENERIC, ActivityData::for_generic(0, 0));
        tracker.change_activity(ActivityType::TASK_RUN, None);
    }

    #[test]
    fn reader_adopts_without_initializing() {
        let mut region = region_for(4);
        let size = size_for_stack_depth(4);
        let base = region.as_mut_ptr().cast::<u8>();
        let reader = unsafe { ThreadTracker::from_existing(base, size) };
        // Still all zeros: nothing to read.
        assert!(!reader.is_valid());

        let writer = unsafe { ThreadTracker::new(base, size) };
        writer.push_activity(0x42, ActivityType::EVENT_WAIT, ActivityData::for_event(0x99));
        assert!(reader.is_valid());
        let mut out = ActivitySnapshot::default();
        reader.snapshot(&mut out).expect("snapshot");
        assert_eq!(out.activity_stack.len(), 1);
        assert_eq!(
            out.activity_stack[0].payload(),
            ActivityPayload::Event { address: 0x99 }
        );
    }

    #[test]
    fn snapshot_of_zeroed_region_fails() {
        let mut region = region_for(4);
        let reader = unsafe {
            ThreadTracker::from_existing(region.as_mut_ptr().cast(), size_for_stack_depth(4))
        };
        let mut out = ActivitySnapshot::default();
        assert_eq!(reader.snapshot(&mut out), Err(SnapshotError::InvalidRegion));
    }

    #[test]
    fn snapshot_times_are_wall_clock() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        let before = crate::clock::wall_now();
        tracker.push_activity(0, ActivityType::GENERIC, ActivityData::for_generic(0, 0));
        let out = snap(&tracker);
        let after = crate::clock::wall_now();
        let time = out.activity_stack[0].time_internal;
        assert!(time >= before - 1_000_000, "time {time} before {before}");
        assert!(time <= after + 1_000_000, "time {time} after {after}");
    }

    #[test]
    fn push_pop_sequences_track_depth() {
        let mut region = region_for(4);
        let tracker = tracker_over(&mut region, 4);
        for round in 0..100u32 {
            tracker.push_activity(
                u64::from(round),
                ActivityType::GENERIC,
                ActivityData::for_generic(round, 1),
            );
            tracker.push_activity(
                u64::from(round),
                ActivityType::EVENT_WAIT,
                ActivityData::for_event(u64::from(round)),
            );
            tracker.pop_activity();
            tracker.pop_activity();
        }
        let out = snap(&tracker);
        assert_eq!(out.activity_stack_depth, 0);
        assert!(out.activity_stack.is_empty());
    }

    #[test]
    fn thread_name_is_recorded() {
        let handle = std::thread::Builder::new()
            .name("flight-worker".into())
            .spawn(|| {
                let mut region = region_for(4);
                let tracker = tracker_over(&mut region, 4);
                snap(&tracker).thread_name
            })
            .expect("spawn");
        assert_eq!(handle.join().expect("join"), "flight-worker");
    }

    #[test]
    fn thread_refs_are_unique_per_thread() {
        let mine = current_thread_ref();
        assert_ne!(mine, 0);
        assert_eq!(mine, current_thread_ref());
        let other = std::thread::spawn(current_thread_ref)
            .join()
            .expect("join");
        assert_ne!(other, 0);
        assert_ne!(mine, other);
    }
}
