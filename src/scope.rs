//! Scoped activity builders.
//!
//! Each builder pushes one record in its constructor and pops it when
//! dropped, so every exit path from the instrumented scope unwinds the
//! stack. The builders are the whole public write surface: they choose
//! the category and payload so call sites never touch raw tags.

use crate::layout::{ActivityData, ActivityType};
use crate::registry::ActivityRegistry;

/// Shared push/pop plumbing for the typed builders.
///
/// `lock_allowed` decides whether a missing tracker may be created:
/// creation allocates and may take locks, which is off limits when the
/// activity being recorded is itself a lock acquisition.
struct ScopedThreadActivity<'a> {
    registry: &'a ActivityRegistry,
    pushed: bool,
}

impl<'a> ScopedThreadActivity<'a> {
    fn begin(
        registry: &'a ActivityRegistry,
        origin_address: u64,
        ty: ActivityType,
        data: ActivityData,
        lock_allowed: bool,
    ) -> Self {
        let pushed = if lock_allowed {
            registry.with_tracker_or_create(|tracker| {
                tracker.push_activity(origin_address, ty, data);
            });
            true
        } else {
            registry
                .with_tracker(|tracker| tracker.push_activity(origin_address, ty, data))
                .is_some()
        };
        Self { registry, pushed }
    }

    fn change(&self, ty: ActivityType, data: Option<ActivityData>) {
        if self.pushed {
            self.registry
                .with_tracker(|tracker| tracker.change_activity(ty, data));
        }
    }
}

impl Drop for ScopedThreadActivity<'_> {
    fn drop(&mut self) {
        if self.pushed {
            self.registry.with_tracker(|tracker| tracker.pop_activity());
        }
    }
}

/// Records a generic instrumented scope.
///
/// The sub-action bits and the info value can be rewritten while the
/// scope is live, which keeps long scopes legible in a snapshot.
pub struct ScopedActivity<'a> {
    inner: ScopedThreadActivity<'a>,
    id: u32,
}

impl<'a> ScopedActivity<'a> {
    /// Pushes a generic activity. `action` must leave the category bits
    /// alone.
    #[must_use]
    pub fn new(
        registry: &'a ActivityRegistry,
        origin_address: u64,
        action: u8,
        id: u32,
        info: i32,
    ) -> Self {
        debug_assert_eq!(action & ActivityType::CATEGORY_MASK, 0);
        Self {
            inner: ScopedThreadActivity::begin(
                registry,
                origin_address,
                ActivityType::GENERIC.with_action(action),
                ActivityData::for_generic(id, info),
                /* lock_allowed */ true,
            ),
            id,
        }
    }

    /// Rewrites the sub-action bits of the live record.
    pub fn change_action(&self, action: u8) {
        debug_assert_eq!(action & ActivityType::CATEGORY_MASK, 0);
        self.inner
            .change(ActivityType::GENERIC.with_action(action), None);
    }

    /// Rewrites the info value of the live record.
    pub fn change_info(&self, info: i32) {
        self.inner.change(
            ActivityType::NULL,
            Some(ActivityData::for_generic(self.id, info)),
        );
    }

    /// Rewrites both the sub-action bits and the info value.
    pub fn change_action_and_info(&self, action: u8, info: i32) {
        debug_assert_eq!(action & ActivityType::CATEGORY_MASK, 0);
        self.inner.change(
            ActivityType::GENERIC.with_action(action),
            Some(ActivityData::for_generic(self.id, info)),
        );
    }
}

/// Records a task being run, keyed by the task's sequence number and
/// the code address it was posted from.
pub struct ScopedTaskRunActivity<'a> {
    _inner: ScopedThreadActivity<'a>,
}

impl<'a> ScopedTaskRunActivity<'a> {
    /// Pushes a task-run activity.
    #[must_use]
    pub fn new(registry: &'a ActivityRegistry, posted_from: u64, sequence_num: u64) -> Self {
        Self {
            _inner: ScopedThreadActivity::begin(
                registry,
                posted_from,
                ActivityType::TASK_RUN,
                ActivityData::for_task(sequence_num),
                /* lock_allowed */ true,
            ),
        }
    }
}

/// Records a lock acquisition in progress, keyed by the lock address.
///
/// Never creates a tracker: tracker creation allocates and may itself
/// take a lock, and this scope runs inside lock-acquisition paths. A
/// thread that has no tracker yet simply goes unrecorded here.
pub struct ScopedLockAcquireActivity<'a> {
    _inner: ScopedThreadActivity<'a>,
}

impl<'a> ScopedLockAcquireActivity<'a> {
    /// Pushes a lock-acquire activity.
    #[must_use]
    pub fn new(registry: &'a ActivityRegistry, lock_address: u64) -> Self {
        Self {
            _inner: ScopedThreadActivity::begin(
                registry,
                0,
                ActivityType::LOCK_ACQUIRE,
                ActivityData::for_lock(lock_address),
                /* lock_allowed */ false,
            ),
        }
    }
}

/// Records an event wait in progress, keyed by the event address.
pub struct ScopedEventWaitActivity<'a> {
    _inner: ScopedThreadActivity<'a>,
}

impl<'a> ScopedEventWaitActivity<'a> {
    /// Pushes an event-wait activity.
    #[must_use]
    pub fn new(registry: &'a ActivityRegistry, event_address: u64) -> Self {
        Self {
            _inner: ScopedThreadActivity::begin(
                registry,
                0,
                ActivityType::EVENT_WAIT,
                ActivityData::for_event(event_address),
                /* lock_allowed */ true,
            ),
        }
    }
}

/// Records a thread join in progress, keyed by the joined thread's
/// reference.
pub struct ScopedThreadJoinActivity<'a> {
    _inner: ScopedThreadActivity<'a>,
}

impl<'a> ScopedThreadJoinActivity<'a> {
    /// Pushes a thread-join activity.
    #[must_use]
    pub fn new(registry: &'a ActivityRegistry, thread_ref: i64) -> Self {
        Self {
            _inner: ScopedThreadActivity::begin(
                registry,
                0,
                ActivityType::THREAD_JOIN,
                ActivityData::for_thread(thread_ref),
                /* lock_allowed */ true,
            ),
        }
    }
}

/// Records a process wait in progress, keyed by the awaited pid.
pub struct ScopedProcessWaitActivity<'a> {
    _inner: ScopedThreadActivity<'a>,
}

impl<'a> ScopedProcessWaitActivity<'a> {
    /// Pushes a process-wait activity.
    #[must_use]
    pub fn new(registry: &'a ActivityRegistry, process_id: i64) -> Self {
        Self {
            _inner: ScopedThreadActivity::begin(
                registry,
                0,
                ActivityType::PROCESS_WAIT,
                ActivityData::for_process(process_id),
                /* lock_allowed */ true,
            ),
        }
    }
}
