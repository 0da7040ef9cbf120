//! # Otter Generational Garbage Collector
//!
//! Stop-the-world generational collector over a word-addressed heap.
//!
//! ## Design
//!
//! - **Young collections**: Copy every reachable young object into the old
//!   generation; displaced headers go to a spool, cross-generation edges come
//!   from per-region remembered sets
//! - **Full collections**: Four-phase mark-compact (mark, compute addresses,
//!   adjust pointers, compact) with an optional dead-wood allowance
//! - **Sizing**: An adaptive policy samples pause times and intervals and
//!   recommends generation sizes for the next cycle

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod averages;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod mark_compact;
pub mod object;
pub mod preserved;
pub mod promotion;
pub mod remset_table;
pub mod retire_list;
pub mod roots;
pub mod scavenge;
pub mod sizing;
pub mod sparse_remset;
pub mod spool;

pub use barrier::{RecordOutcome, RememberedSets, write_ref};
pub use collector::{Collector, GcStats};
pub use config::{CompactionPolicy, GcConfig, GenerationSpec, HeapLayout, RemSetConfig, SizingConfig, SpoolConfig};
pub use error::{GcError, GcResult};
pub use heap::{Generation, GenerationId, GenerationRole, Heap};
pub use mark_compact::{CompactionStats, MarkSweepCompact};
pub use object::{Address, MarkWord, ObjectModel, Shape};
pub use promotion::PromotionTracker;
pub use roots::{RootHandle, RootSet, WeakHandle, WeakRoots};
pub use scavenge::{ScavengeStats, scavenge};
pub use sizing::{AdaptiveSizePolicy, Clock, GcCause, ManualClock, MonotonicClock, SizingDecision};
pub use spool::SpoolAllocator;
