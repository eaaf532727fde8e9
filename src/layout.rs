//! Binary layout of a tracker region.
//!
//! A region is a fixed-size byte range holding a [`Header`] followed by
//! `N` [`Activity`] records, where `N` is derived from the region size.
//! Every field has a fixed width and every offset is identical between
//! 32- and 64-bit builds, so a reader of either width can parse a region
//! produced by the other. Integers are little-endian by convention; the
//! cookie is the only version negotiation.

use core::fmt;
use std::sync::atomic::AtomicU32;
#[cfg(target_pointer_width = "64")]
use std::sync::atomic::AtomicI64;
#[cfg(not(target_pointer_width = "64"))]
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
#[cfg(target_pointer_width = "64")]
use std::sync::atomic::Ordering as AtomicOrdering;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Identifies initialized region memory. An arbitrary number with a
/// version added on, so structure changes will not read older data.
pub const HEADER_COOKIE: u64 = 0x9B4A_22C8_5F10_D6E4 + 1; // v1

/// The minimum number of activity slots a region must support.
pub const MIN_STACK_DEPTH: u32 = 2;

/// Fixed capacity of the thread-name buffer, NUL included.
pub const THREAD_NAME_LEN: usize = 32;

/// Frames captured per record when the `call-stack` feature is enabled.
#[cfg(feature = "call-stack")]
pub const CALL_STACK_DEPTH: usize = 10;

/// The 8-bit activity tag: a 4-bit category in the high nibble and a
/// 4-bit sub-action in the low nibble.
///
/// The category of a record never changes for the record's lifetime;
/// only the sub-action bits may be rewritten in place.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityType(u8);

impl ActivityType {
    /// Sentinel meaning "leave the type unchanged" in change operations.
    /// Never stored in a live record by the scope builders.
    pub const NULL: Self = Self(0);
    /// A task being run.
    pub const TASK_RUN: Self = Self(1 << 4);
    /// A lock in the middle of acquisition.
    pub const LOCK_ACQUIRE: Self = Self(2 << 4);
    /// An event being waited on.
    pub const EVENT_WAIT: Self = Self(3 << 4);
    /// A thread join in progress.
    pub const THREAD_JOIN: Self = Self(4 << 4);
    /// A process wait in progress.
    pub const PROCESS_WAIT: Self = Self(5 << 4);
    /// A generic instrumented scope.
    pub const GENERIC: Self = Self(6 << 4);

    /// Mask selecting the category bits of the tag.
    pub const CATEGORY_MASK: u8 = 0xF0;
    /// Mask selecting the sub-action bits of the tag.
    pub const ACTION_MASK: u8 = 0x0F;

    /// Reconstructs a tag from its stored byte.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the stored byte.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns the decoded category.
    #[must_use]
    pub const fn category(self) -> ActivityCategory {
        match self.0 >> 4 {
            1 => ActivityCategory::TaskRun,
            2 => ActivityCategory::LockAcquire,
            3 => ActivityCategory::EventWait,
            4 => ActivityCategory::ThreadJoin,
            5 => ActivityCategory::ProcessWait,
            6 => ActivityCategory::Generic,
            _ => ActivityCategory::Null,
        }
    }

    /// Returns the sub-action bits.
    #[inline]
    #[must_use]
    pub const fn action(self) -> u8 {
        self.0 & Self::ACTION_MASK
    }

    /// Returns the same category with different sub-action bits.
    #[inline]
    #[must_use]
    pub const fn with_action(self, action: u8) -> Self {
        Self((self.0 & Self::CATEGORY_MASK) | (action & Self::ACTION_MASK))
    }

    /// True if both tags carry the same category bits.
    #[inline]
    #[must_use]
    pub const fn same_category(self, other: Self) -> bool {
        self.0 & Self::CATEGORY_MASK == other.0 & Self::CATEGORY_MASK
    }
}

impl fmt::Debug for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}|{:#x}", self.category(), self.action())
    }
}

/// Decoded activity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    /// Sentinel category; not stored by the scope builders.
    Null,
    /// A task being run.
    TaskRun,
    /// A lock acquisition.
    LockAcquire,
    /// An event wait.
    EventWait,
    /// A thread join.
    ThreadJoin,
    /// A process wait.
    ProcessWait,
    /// A generic instrumented scope.
    Generic,
}

/// The 8-byte payload block of a record.
///
/// Stored as raw little-endian bits; the record's category decides which
/// decoding applies. Keeping the stored form a single aligned word makes
/// the payload identical across architectures.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActivityData(u64);

impl ActivityData {
    /// Payload for a generic activity: an association id and a free-form
    /// info value.
    #[must_use]
    pub const fn for_generic(id: u32, info: i32) -> Self {
        Self((id as u64) | ((info as u32 as u64) << 32))
    }

    /// Payload for a task run: the task's sequence identifier.
    #[must_use]
    pub const fn for_task(sequence_id: u64) -> Self {
        Self(sequence_id)
    }

    /// Payload for a lock acquisition: the lock's address.
    #[must_use]
    pub const fn for_lock(address: u64) -> Self {
        Self(address)
    }

    /// Payload for an event wait: the event's address.
    #[must_use]
    pub const fn for_event(address: u64) -> Self {
        Self(address)
    }

    /// Payload for a thread join: the joined thread's reference.
    #[must_use]
    pub const fn for_thread(thread_ref: i64) -> Self {
        Self(thread_ref as u64)
    }

    /// Payload for a process wait: the awaited process id.
    #[must_use]
    pub const fn for_process(process_id: i64) -> Self {
        Self(process_id as u64)
    }

    /// Decodes the payload under the given category.
    #[must_use]
    pub const fn decode(self, category: ActivityCategory) -> ActivityPayload {
        match category {
            ActivityCategory::Null => ActivityPayload::Null,
            ActivityCategory::Generic => ActivityPayload::Generic {
                id: self.0 as u32,
                info: (self.0 >> 32) as u32 as i32,
            },
            ActivityCategory::TaskRun => ActivityPayload::Task { sequence_id: self.0 },
            ActivityCategory::LockAcquire => ActivityPayload::Lock { address: self.0 },
            ActivityCategory::EventWait => ActivityPayload::Event { address: self.0 },
            ActivityCategory::ThreadJoin => ActivityPayload::Thread {
                thread_ref: self.0 as i64,
            },
            ActivityCategory::ProcessWait => ActivityPayload::Process {
                process_id: self.0 as i64,
            },
        }
    }

    /// Returns the raw stored bits.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ActivityData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivityData({:#018x})", self.0)
    }
}

/// A record payload decoded under its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPayload {
    /// No payload.
    Null,
    /// Generic scope payload.
    Generic {
        /// Arbitrary identifier used for association.
        id: u32,
        /// Arbitrary value used for information purposes.
        info: i32,
    },
    /// Task-run payload.
    Task {
        /// Sequence identifier of the posted task.
        sequence_id: u64,
    },
    /// Lock-acquire payload.
    Lock {
        /// Memory address of the lock object.
        address: u64,
    },
    /// Event-wait payload.
    Event {
        /// Memory address of the event object.
        address: u64,
    },
    /// Thread-join payload.
    Thread {
        /// Reference of the thread being joined.
        thread_ref: i64,
    },
    /// Process-wait payload.
    Process {
        /// Id of the process being waited on.
        process_id: i64,
    },
}

/// One in-progress operation, recorded in a region slot.
///
/// During collection `time_internal` holds monotonic ticks; a snapshot
/// rewrites it to wall time before handing records to the caller.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Activity {
    /// Tick count at push time (wall time in a returned snapshot).
    pub time_internal: i64,
    /// Code address that originated the activity, zero when the call
    /// stack makes it obvious. Zero-extended on 32-bit writers.
    pub origin_address: u64,
    /// Program counters of the pushing call stack, zero-terminated if
    /// shorter than the buffer. Empty unless capture is enabled.
    #[cfg(feature = "call-stack")]
    pub call_stack: [u64; CALL_STACK_DEPTH],
    /// The stored [`ActivityType`] byte.
    pub activity_type: u8,
    /// Keeps `data` on a 64-bit boundary on 32-bit builds as well. New
    /// fields can be taken from this space.
    padding: [u8; 7],
    pub(crate) data: ActivityData,
}

impl Activity {
    /// Returns the decoded activity tag.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ActivityType {
        ActivityType::from_raw(self.activity_type)
    }

    /// Returns the payload decoded under the record's category.
    #[must_use]
    pub const fn payload(&self) -> ActivityPayload {
        self.data.decode(self.kind().category())
    }

    /// Returns the raw payload word.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> ActivityData {
        self.data
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("time_internal", &self.time_internal)
            .field("origin_address", &format_args!("{:#x}", self.origin_address))
            .field("kind", &self.kind())
            .field("payload", &self.payload())
            .finish()
    }
}

impl Serialize for Activity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Activity", 4)?;
        state.serialize_field("time", &self.time_internal)?;
        state.serialize_field("origin", &self.origin_address)?;
        state.serialize_field("activity_type", &self.activity_type)?;
        state.serialize_field("payload", &self.payload())?;
        state.end()
    }
}

/// The region header, filled the very first time a thread is seen.
///
/// The atomic fields double as the publication fences of the region:
/// `process_id` releases the header on birth, `current_depth` releases
/// each pushed record, and `stack_unchanged` is the tear flag a reader
/// probes around its copy.
#[repr(C)]
pub(crate) struct Header {
    /// Non-zero exactly when the region has been initialized.
    pub(crate) cookie: u64,
    // The process id wants to be 64 bits everywhere, but it must be
    // atomic for the barriers it provides, which limits it to the
    // natural word size of the machine.
    #[cfg(target_pointer_width = "64")]
    process_id: AtomicI64,
    #[cfg(not(target_pointer_width = "64"))]
    process_id: AtomicI32,
    #[cfg(not(target_pointer_width = "64"))]
    _process_id_padding: i32,
    /// Identifies the writing thread; meaningful only in combination
    /// with the process id.
    pub(crate) thread_ref: i64,
    /// Wall-clock reference taken at birth, nanoseconds since epoch.
    pub(crate) start_time: i64,
    /// Monotonic tick reference taken at the same moment.
    pub(crate) start_ticks: i64,
    /// The number of `Activity` slots in the region.
    pub(crate) stack_slots: u32,
    /// Logical stack depth. May exceed `stack_slots`; slots past the
    /// capacity are never written.
    pub(crate) current_depth: AtomicU32,
    /// Tear flag. A reader stores non-zero before copying the stack and
    /// re-checks it afterwards; the writer zeroes it on every pop.
    pub(crate) stack_unchanged: AtomicU32,
    /// Writer thread name, NUL-padded.
    pub(crate) thread_name: [u8; THREAD_NAME_LEN],
    /// Explicit tail padding so the struct size is the same everywhere.
    _padding: [u8; 4],
}

impl Header {
    #[inline]
    pub(crate) fn process_id(&self, order: AtomicOrdering) -> i64 {
        #[cfg(target_pointer_width = "64")]
        {
            self.process_id.load(order)
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            i64::from(self.process_id.load(order))
        }
    }

    #[inline]
    pub(crate) fn store_process_id(&self, pid: i64, order: AtomicOrdering) {
        #[cfg(target_pointer_width = "64")]
        {
            self.process_id.store(pid, order);
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            self.process_id.store(pid as i32, order);
        }
    }
}

/// Bytes required for a region with the given stack depth.
#[must_use]
pub const fn size_for_stack_depth(stack_depth: u32) -> usize {
    std::mem::size_of::<Header>() + stack_depth as usize * std::mem::size_of::<Activity>()
}
