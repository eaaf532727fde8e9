//! Process-wide registry of thread trackers.
//!
//! The registry owns one persistent arena and hands every calling
//! thread a tracker region carved out of it. When a thread exits, its
//! thread-local slot returns the region: the memory is zeroed, its
//! arena type tag flips from live to free, and the reference goes onto
//! a bounded lock-free free list for the next thread. When the arena
//! runs dry the registry falls back to process-local heap memory, so
//! tracking keeps working even though that data cannot outlive the
//! process.
//!
//! Out-of-process analyzers do not talk to the registry at all; they
//! map the arena file and walk its iteration list with
//! [`snapshot_all_in_arena`].

use std::cell::RefCell;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::arena::{PersistentArena, Reference};
use crate::error::ArenaError;
use crate::layout::size_for_stack_depth;
use crate::layout::MIN_STACK_DEPTH;
use crate::metrics::{Counter, Gauge, Histogram};
use crate::tracker::{ActivitySnapshot, ThreadTracker};

/// Arena type tag for a region currently owned by a live thread.
pub const TYPE_ID_TRACKER: u32 = 0x4E34_D2C7;
/// Arena type tag for a recycled region awaiting reuse.
pub const TYPE_ID_TRACKER_FREE: u32 = 0x83C2_96F1;

/// Capacity of the recycled-region free list. A thread churn burst past
/// this bound leaks references (never memory the process still needs).
const MAX_TRACKERS: usize = 100;

thread_local! {
    static THREAD_SLOT: RefCell<Option<ThreadSlot>> = const { RefCell::new(None) };
}

static GLOBAL_REGISTRY: RwLock<Option<ActivityRegistry>> = RwLock::new(None);

/// Metrics the registry reports through.
#[derive(Debug)]
pub struct RegistryMetrics {
    live_trackers: Gauge,
    tracker_counts: Histogram,
    mem_limit_tracker_count: Histogram,
    recycled_blocks: Counter,
}

impl RegistryMetrics {
    fn new() -> Self {
        let buckets = vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0];
        Self {
            live_trackers: Gauge::new("activity_tracker.live_trackers"),
            tracker_counts: Histogram::new("activity_tracker.tracker_counts", buckets.clone()),
            mem_limit_tracker_count: Histogram::new(
                "activity_tracker.mem_limit_tracker_count",
                buckets,
            ),
            recycled_blocks: Counter::new("activity_tracker.recycled_blocks"),
        }
    }

    /// Number of trackers currently alive.
    #[must_use]
    pub fn live_trackers(&self) -> &Gauge {
        &self.live_trackers
    }

    /// Distribution of the live-tracker count sampled at every creation.
    #[must_use]
    pub fn tracker_counts(&self) -> &Histogram {
        &self.tracker_counts
    }

    /// Live-tracker count sampled whenever the arena was exhausted, so
    /// an operator can size the region appropriately.
    #[must_use]
    pub fn mem_limit_tracker_count(&self) -> &Histogram {
        &self.mem_limit_tracker_count
    }

    /// Regions served from the free list instead of fresh allocation.
    #[must_use]
    pub fn recycled_blocks(&self) -> &Counter {
        &self.recycled_blocks
    }
}

/// Memory backing one thread's tracker.
enum TrackerBlock {
    /// Carved from the persistent arena; visible to foreign readers.
    Arena(Reference),
    /// Heap fallback after arena exhaustion; process-local only.
    Heap { base: *mut [u64] },
}

/// The per-thread slot stored in thread-local storage. Dropping it, as
/// the TLS runtime does on thread exit, returns the region.
struct ThreadSlot {
    registry: Weak<RegistryInner>,
    tracker: ThreadTracker,
    block: TrackerBlock,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.return_block(&self.block);
        } else if let TrackerBlock::Heap { base } = self.block {
            // The registry is gone; there is nothing to return an arena
            // reference to, but heap memory is ours to free.
            // SAFETY: produced by Box::into_raw and freed exactly once.
            unsafe { drop(Box::from_raw(base)) };
        }
    }
}

struct RegistryInner {
    arena: PersistentArena,
    stack_memory_size: usize,
    tracker_count: AtomicUsize,
    free_count: AtomicUsize,
    free_slots: [AtomicU32; MAX_TRACKERS],
    metrics: RegistryMetrics,
}

/// Handle to the process-wide activity-tracking registry.
///
/// Cheap to clone; all clones share one arena and one free list. Scope
/// builders take a reference to this handle, and an optional global
/// installation serves code that has nowhere to thread one through.
#[derive(Clone)]
pub struct ActivityRegistry {
    inner: Arc<RegistryInner>,
}

impl ActivityRegistry {
    /// Creates a registry over the given arena, with each tracker sized
    /// for `stack_depth` records.
    #[must_use]
    pub fn with_arena(arena: PersistentArena, stack_depth: u32) -> Self {
        let stack_depth = stack_depth.max(MIN_STACK_DEPTH);
        debug_assert_eq!(
            arena.iter().count(),
            0,
            "registry arenas start out with no iterable blocks"
        );
        Self {
            inner: Arc::new(RegistryInner {
                arena,
                stack_memory_size: size_for_stack_depth(stack_depth),
                tracker_count: AtomicUsize::new(0),
                free_count: AtomicUsize::new(0),
                free_slots: std::array::from_fn(|_| AtomicU32::new(0)),
                metrics: RegistryMetrics::new(),
            }),
        }
    }

    /// Creates a registry over zeroed process-local memory. Data will
    /// not survive the process; useful for tests and local tooling.
    #[must_use]
    pub fn with_local_memory(size: usize, id: u64, name: &str, stack_depth: u32) -> Self {
        Self::with_arena(PersistentArena::new_local(size, id, name), stack_depth)
    }

    /// Creates a registry over a file mapping so that the recorded data
    /// survives the process for post-mortem analysis.
    pub fn with_file(
        path: &Path,
        size: usize,
        id: u64,
        name: &str,
        stack_depth: u32,
    ) -> Result<Self, ArenaError> {
        Ok(Self::with_arena(
            PersistentArena::with_file(path, size, id, name)?,
            stack_depth,
        ))
    }

    /// Installs this registry as the process-global one. Installing over
    /// an existing registry is a programmer error.
    pub fn install_global(&self) {
        let mut global = GLOBAL_REGISTRY.write();
        debug_assert!(global.is_none(), "global activity registry installed twice");
        *global = Some(self.clone());
    }

    /// Returns the installed global registry, if any.
    #[must_use]
    pub fn global() -> Option<Self> {
        GLOBAL_REGISTRY.read().clone()
    }

    /// Clears the global installation.
    pub fn uninstall_global() {
        *GLOBAL_REGISTRY.write() = None;
    }

    /// Runs `f` against the calling thread's tracker, creating one if
    /// this thread has never been seen. The callback must not re-enter
    /// the registry for the same thread.
    pub fn with_tracker_or_create<R>(&self, f: impl FnOnce(&ThreadTracker) -> R) -> R {
        THREAD_SLOT.with(|cell| {
            let mut slot = cell.borrow_mut();
            let stale = !matches!(
                &*slot,
                Some(s) if Weak::as_ptr(&s.registry) == Arc::as_ptr(&self.inner)
            );
            if stale {
                // Drop any slot belonging to a previous registry first so
                // its region goes back to that registry's free list.
                *slot = None;
                *slot = Some(RegistryInner::create_thread_slot(&self.inner));
            }
            let Some(slot) = slot.as_ref() else {
                unreachable!("thread slot installed above")
            };
            f(&slot.tracker)
        })
    }

    /// Runs `f` against the calling thread's tracker if one already
    /// exists. Never allocates, which makes it the only safe entry point
    /// while the caller is inside a lock-acquisition path.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&ThreadTracker) -> R) -> Option<R> {
        THREAD_SLOT.with(|cell| {
            let slot = cell.borrow();
            match &*slot {
                Some(s) if Weak::as_ptr(&s.registry) == Arc::as_ptr(&self.inner) => {
                    Some(f(&s.tracker))
                }
                _ => None,
            }
        })
    }

    /// Drops the calling thread's tracker, returning its region. Mostly
    /// useful in tests; normal teardown happens at thread exit.
    pub fn release_tracker_for_current_thread(&self) {
        THREAD_SLOT.with(|cell| {
            let mut slot = cell.borrow_mut();
            if matches!(
                &*slot,
                Some(s) if Weak::as_ptr(&s.registry) == Arc::as_ptr(&self.inner)
            ) {
                *slot = None;
            }
        });
    }

    /// Number of live trackers.
    #[must_use]
    pub fn tracker_count(&self) -> usize {
        self.inner.tracker_count.load(Ordering::Relaxed)
    }

    /// The region size handed to each tracker.
    #[must_use]
    pub fn stack_memory_size(&self) -> usize {
        self.inner.stack_memory_size
    }

    /// The registry's metrics.
    #[must_use]
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.inner.metrics
    }

    /// The underlying arena.
    #[must_use]
    pub fn arena(&self) -> &PersistentArena {
        &self.inner.arena
    }

    /// Snapshots every live tracker region in the registry's arena.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<ActivitySnapshot> {
        snapshot_all_in_arena(&self.inner.arena)
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("arena", &self.inner.arena)
            .field("stack_memory_size", &self.inner.stack_memory_size)
            .field("tracker_count", &self.tracker_count())
            .finish()
    }
}

impl RegistryInner {
    fn create_thread_slot(inner: &Arc<Self>) -> ThreadSlot {
        let (block, base) = inner.acquire_block();
        // SAFETY: base points at stack_memory_size zeroed bytes owned by
        // the block, 8-byte aligned by both the arena and the heap path,
        // and this thread is the region's only writer.
        let tracker = unsafe { ThreadTracker::new(base, inner.stack_memory_size) };
        debug_assert!(tracker.is_valid());

        let count = inner.tracker_count.fetch_add(1, Ordering::Relaxed) + 1;
        inner.metrics.live_trackers.set(count as i64);
        inner.metrics.tracker_counts.observe(count as f64);
        tracing::debug!(live_trackers = count, "thread tracker created");

        ThreadSlot {
            registry: Arc::downgrade(inner),
            tracker,
            block,
        }
    }

    /// Finds memory for one tracker region: recycled block first, fresh
    /// arena allocation second, process-local heap as the last resort.
    fn acquire_block(&self) -> (TrackerBlock, *mut u8) {
        if let Some(reference) = self.pop_free_block() {
            // Turn the reference back into one of the live tracker type.
            let changed =
                self.arena
                    .change_type(reference, TYPE_ID_TRACKER, TYPE_ID_TRACKER_FREE);
            debug_assert!(changed, "recycled block lost its free tag");
            if let Some(base) = self.arena.get_block(reference, TYPE_ID_TRACKER) {
                self.metrics.recycled_blocks.increment();
                return (TrackerBlock::Arena(reference), base.as_ptr());
            }
            debug_assert!(false, "recycled reference did not resolve");
        }

        if let Some(reference) = self
            .arena
            .allocate(self.stack_memory_size as u32, TYPE_ID_TRACKER)
        {
            if let Some(base) = self.arena.get_block(reference, TYPE_ID_TRACKER) {
                // Once iterable, out-of-process readers will find it.
                self.arena.make_iterable(reference);
                return (TrackerBlock::Arena(reference), base.as_ptr());
            }
        }

        // The arena was sized too small for the thread count. Tracking
        // still works over heap memory; the data just cannot be seen
        // from outside the process. Record the count at which this
        // happened so the region can be resized.
        let count = self.tracker_count.load(Ordering::Relaxed);
        self.metrics.mem_limit_tracker_count.observe(count as f64);
        tracing::warn!(
            live_trackers = count,
            "persistent arena exhausted; tracker falling back to heap memory"
        );
        let words = vec![0u64; self.stack_memory_size.div_ceil(8)].into_boxed_slice();
        let base = Box::into_raw(words);
        (TrackerBlock::Heap { base }, base.cast::<u8>())
    }

    /// Called from the thread-local destructor on thread exit.
    fn return_block(&self, block: &TrackerBlock) {
        // Zero now, while a thread exit is already paying for a context
        // switch, rather than when the next thread needs the region.
        let base = match block {
            TrackerBlock::Arena(reference) => {
                match self.arena.get_block(*reference, TYPE_ID_TRACKER) {
                    Some(base) => base.as_ptr(),
                    None => {
                        debug_assert!(false, "returned reference did not resolve");
                        return;
                    }
                }
            }
            TrackerBlock::Heap { base } => base.cast::<u8>(),
        };
        // SAFETY: the block owns stack_memory_size bytes at base and the
        // owning thread is done writing; a concurrent reader observes
        // the zeroed identity and rejects its copy.
        unsafe { ptr::write_bytes(base, 0, self.stack_memory_size) };

        let count = self.tracker_count.fetch_sub(1, Ordering::Relaxed) - 1;
        self.metrics.live_trackers.set(count as i64);
        tracing::debug!(live_trackers = count, "thread tracker returned");

        match block {
            TrackerBlock::Arena(reference) => {
                // Flip the tag so iteration skips the block, then recycle
                // the reference. Arena memory is never freed.
                let changed =
                    self.arena
                        .change_type(*reference, TYPE_ID_TRACKER_FREE, TYPE_ID_TRACKER);
                debug_assert!(changed, "returned block lost its live tag");
                self.push_free_block(*reference);
            }
            TrackerBlock::Heap { base } => {
                // SAFETY: produced by Box::into_raw in acquire_block.
                unsafe { drop(Box::from_raw(*base)) };
            }
        }
    }

    /// Pops a recycled reference, if any. Lock-free: a zero read means
    /// another thread claimed the slot but has not yet decremented the
    /// count, so yield and reload.
    fn pop_free_block(&self) -> Option<Reference> {
        let mut count = self.free_count.load(Ordering::Acquire);
        while count > 0 {
            // Zeroing the slot keeps an interrupting thread from taking
            // the same reference, and the push path needs empty slots to
            // read as zero.
            let reference = self.free_slots[count - 1].swap(0, Ordering::Relaxed);
            if reference == 0 {
                std::thread::yield_now();
                count = self.free_count.load(Ordering::Acquire);
                continue;
            }
            match self.free_count.compare_exchange(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(reference),
                Err(actual) => {
                    // A concurrent push won; restore the reference and
                    // retry against the new count.
                    self.free_slots[count - 1].store(reference, Ordering::Relaxed);
                    count = actual;
                }
            }
        }
        None
    }

    /// Pushes a recycled reference. A full list abandons the reference:
    /// the block stays owned by the arena, marked free, just never
    /// reused.
    fn push_free_block(&self, reference: Reference) {
        loop {
            let count = self.free_count.load(Ordering::Acquire);
            if count >= MAX_TRACKERS {
                debug_assert!(false, "tracker free list full; reference abandoned");
                return;
            }
            // Claim the slot before publishing it through the count.
            if self.free_slots[count]
                .compare_exchange(0, reference, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                std::thread::yield_now();
                continue;
            }
            if self
                .free_count
                .compare_exchange(count, count + 1, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                // A concurrent pop moved the count; take the reference
                // back out and start over.
                self.free_slots[count].store(0, Ordering::Relaxed);
                continue;
            }
            return;
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let leaked = self.tracker_count.load(Ordering::Relaxed);
        if leaked != 0 {
            // Threads that outlive the registry keep their slots; the
            // TLS destructor finds the registry gone and only frees heap
            // blocks.
            tracing::debug!(live_trackers = leaked, "registry dropped with live trackers");
        }
    }
}

/// Snapshots every live tracker region in an arena.
///
/// This is the analyzer entry point: map the arena (for example with
/// [`PersistentArena::open_file`]) and walk it. Regions mid-recycle or
/// mid-rebirth fail their snapshot and are skipped.
#[must_use]
pub fn snapshot_all_in_arena(arena: &PersistentArena) -> Vec<ActivitySnapshot> {
    let mut snapshots = Vec::new();
    for (reference, type_tag) in arena.iter() {
        if type_tag != TYPE_ID_TRACKER {
            continue;
        }
        let Some(base) = arena.get_block(reference, TYPE_ID_TRACKER) else {
            continue;
        };
        let Some(size) = arena.alloc_size(reference) else {
            continue;
        };
        // SAFETY: the arena owns `size` bytes at `base` for the life of
        // the mapping; the snapshot protocol tolerates a concurrent
        // writer.
        let tracker = unsafe { ThreadTracker::from_existing(base.as_ptr(), size as usize) };
        let mut snapshot = ActivitySnapshot::default();
        if tracker.snapshot(&mut snapshot).is_ok() {
            snapshots.push(snapshot);
        }
    }
    snapshots
}
