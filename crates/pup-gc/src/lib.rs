//! Memory management core of the pup language runtime.
//!
//! `pup-gc` owns the heap of a pup program: it hands out storage for objects,
//! coordinates the mutator threads that use that storage, and reclaims what
//! they no longer reach. The object model itself (classes, method tables,
//! instance variables) lives elsewhere and talks to the collector only through
//! the [`ObjectModel`] trait.
//!
//! # Architecture
//!
//! - **Regions**: objects are bump-allocated from 1 MiB regions. Each mutator
//!   owns one local region at a time; full regions move to a lock-free global
//!   list that only the collector reclaims. A region, not an object, is the
//!   unit of reclamation.
//! - **Safepoints**: the collector asks each mutator in turn to stop (with a
//!   signal on unix, or a polled flag elsewhere). The mutator notices the
//!   request at its next [`safepoint_check`], scans its own roots into the
//!   reference queue and meets the collector on a two-party rendezvous.
//! - **Tracing**: the collector drains the segmented reference queue, marking
//!   every reachable object with the mark value of the current cycle. The
//!   mark value flips each cycle, so there is no separate unmark pass.
//! - **Sweep and copy**: regions with no marked object are reclaimed; sparse
//!   regions are evacuated into fresh regions while mutators are parked.
//!
//! # Quick Start
//!
//! ```ignore
//! use pup_gc::{GcConfig, Heap, HeapKind, ObjectModel, ObjectRef, Slot};
//!
//! struct Leaf;
//!
//! impl ObjectModel for Leaf {
//!     fn each_reference(&self, _object: ObjectRef, _visit: &mut dyn FnMut(Slot)) {}
//! }
//!
//! let heap = Heap::new(GcConfig::default(), Leaf)?;
//! let mutator = heap.attach_current_thread()?;
//! let obj = mutator.alloc(24, HeapKind::Object);
//! let root = mutator.root(Some(obj));
//! mutator.safepoint();
//! # Ok::<(), pup_gc::GcError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod gc;
mod lockfree;
mod metrics;
mod model;
mod safepoint;
mod thread;
mod tracing;

/// Region and object layout.
///
/// Public so that object models can reason about sizes and the large-object
/// threshold; allocation itself goes through [`MutatorGuard`].
pub mod heap;

/// Stack-map metadata and frame walking.
pub mod stack;

pub use config::{Convergence, CopyPolicy, GcConfig, RequestMode};
pub use error::GcError;
pub use gc::refqueue::{QueueEntry, QueueWriter, RefQueue, Segment, SEGMENT_CAPACITY};
pub use heap::{Heap, HeapKind, ObjectRef, Slot};
pub use metrics::{CycleStats, HeapMetrics, PhaseTimes};
pub use model::{CopyContext, ObjectModel};
pub use thread::{alloc, safepoint_check, MutatorGuard, Root};
