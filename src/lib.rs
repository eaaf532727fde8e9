//! Post-mortem activity tracking over persistent shared memory.
//!
//! flightrec records a bounded per-thread stack of in-progress
//! operations (tasks being run, locks being acquired, events being
//! waited on, joins, generic instrumented scopes) into memory that can
//! be file-backed and shared across processes. A crash analyzer or
//! out-of-process monitor can read that memory at any instant, even
//! after the writing process has died, and reconstruct what each thread
//! was doing.
//!
//! Normal execution is barely perturbed: a push costs a handful of
//! plain stores and one release-store of a depth counter, and a pop is
//! an atomic decrement plus one release-store. Readers pay instead,
//! with a retried, tear-checked copy protocol.
//!
//! # Architecture
//!
//! - [`tracker::ThreadTracker`] owns one memory region: a self-describing
//!   header plus a fixed array of activity records. One thread writes;
//!   any number of threads or processes snapshot.
//! - [`registry::ActivityRegistry`] hands each thread a tracker carved
//!   out of a [`arena::PersistentArena`], recycles regions through a
//!   lock-free free list when threads exit, and falls back to heap
//!   memory when the arena is exhausted.
//! - [`scope`] holds the RAII builders that instrument code: construct
//!   to push, drop to pop.
//!
//! # Example
//!
//! ```
//! use flightrec::{ActivityRegistry, ScopedTaskRunActivity};
//!
//! let registry = ActivityRegistry::with_local_memory(64 * 1024, 1, "demo", 32);
//!
//! {
//!     let _task = ScopedTaskRunActivity::new(&registry, 0x1000, 42);
//!     // Any thread (or, with a file-backed arena, any process) can
//!     // look at what this thread is doing right now.
//!     let snapshots = registry.snapshot_all();
//!     assert_eq!(snapshots.len(), 1);
//!     assert_eq!(snapshots[0].activity_stack_depth, 1);
//! }
//!
//! let snapshots = registry.snapshot_all();
//! assert_eq!(snapshots[0].activity_stack_depth, 0);
//! ```

#![warn(missing_docs)]

pub mod arena;
pub mod clock;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod registry;
pub mod scope;
pub mod tracker;

pub use arena::{PersistentArena, Reference};
pub use error::{ArenaError, SnapshotError};
pub use layout::{Activity, ActivityCategory, ActivityData, ActivityPayload, ActivityType};
pub use registry::{snapshot_all_in_arena, ActivityRegistry, RegistryMetrics};
pub use scope::{
    ScopedActivity, ScopedEventWaitActivity, ScopedLockAcquireActivity, ScopedProcessWaitActivity,
    ScopedTaskRunActivity, ScopedThreadJoinActivity,
};
pub use tracker::{ActivitySnapshot, ThreadTracker};
