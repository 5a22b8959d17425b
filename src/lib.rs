//! Core of the weft runtime's concurrent collector: a tri-color mark-sweep
//! marker extended with partial-deadlock detection.
//!
//! Root enumeration snapshots every fiber under a stopped world and splits
//! them into a live prefix and a blocked suffix whose pointers carry a high
//! tag bit. The marker refuses to follow tagged pointers, so a fiber parked
//! on a blocking wait is retained only if something genuinely live reaches
//! it; blocked fibers the marker never reached are, by construction, part of
//! a deadlocked cycle and are either reclaimed or reported depending on
//! policy. No wait-for graph is ever materialized.

pub mod assist;
pub mod config;
pub mod context;
pub mod controller;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod fiber;
pub mod heap;
pub mod reclaim;
pub mod report;
pub mod roots;
pub mod scan;
pub mod sema;
pub mod stack;
pub mod stackscan;
pub mod tagging;
pub mod workqueue;

pub use config::{DeadlockPolicy, GcConfig};
pub use context::CollectorContext;
pub use coordinator::{Collector, CycleStats};
pub use drain::{gc_drain, gc_drain_n, DrainFlags};
pub use error::{GcError, GcResult};
pub use fiber::{Fiber, FiberRegistry, FiberState, WaitReason};
pub use roots::{gc_mark_root_check, gc_mark_root_prepare};
pub use scan::{gc_mark_tiny_allocs, mark_new_object, shade};
pub use workqueue::GcWork;
