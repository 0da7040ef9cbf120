//! Generational collector
//!
//! Owns the heap and every piece of collector state, and decides per pause
//! between a young collection and a full mark-compact. After each pause the
//! sizing policy is sampled; its young recommendation caps how much of the
//! young generation the allocator hands out before the next collection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::barrier::{self, RememberedSets};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::mark_compact::MarkSweepCompact;
use crate::object::{Address, MarkWord, ObjectModel, Shape};
use crate::promotion::PromotionTracker;
use crate::roots::{RootHandle, RootSet, WeakHandle, WeakRoots};
use crate::scavenge::scavenge;
use crate::sizing::{AdaptiveSizePolicy, Clock, GcCause, MonotonicClock};
use crate::spool::SpoolAllocator;

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Young collections run (including failed ones)
    pub young_collections: u64,
    /// Full collections run
    pub full_collections: u64,
    /// Young collections that fell back to a full collection
    pub promotion_failures: u64,
    /// Total time spent in pauses
    pub total_pause: Duration,
    /// Duration of the most recent pause
    pub last_pause: Duration,
    /// Words reclaimed by the most recent collection
    pub last_reclaimed_words: usize,
    /// Words promoted into the old generation, all time
    pub promoted_words: usize,
    /// Words handed out by `allocate`, all time
    pub allocated_words: usize,
}

/// Stop-the-world generational collector
pub struct Collector {
    config: GcConfig,
    heap: Heap,
    roots: RootSet,
    weak: WeakRoots,
    tracker: PromotionTracker,
    remsets: RememberedSets,
    full_gc: MarkSweepCompact,
    policy: AdaptiveSizePolicy,
    stats: GcStats,
    poisoned: bool,
}

impl Collector {
    /// Create a collector using the wall clock
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create a collector whose sizing policy reads `clock`
    pub fn with_clock(config: GcConfig, clock: Arc<dyn Clock>) -> GcResult<Self> {
        config.validate()?;
        let heap = Heap::new(&config.layout, config.compaction.mangle_unused);
        let young_words = heap.generation(heap.young()).capacity_words();
        let old_words = heap.generation(heap.old()).capacity_words();
        let remsets = RememberedSets::new(&heap, &config.remset);
        let tracker = PromotionTracker::new(SpoolAllocator::shared(&config.spool));
        let policy = AdaptiveSizePolicy::new(config.sizing.clone(), clock, young_words, old_words);

        tracing::debug!(
            target: "otter::gc",
            heap_words = heap.capacity_words(),
            young_words,
            old_words,
            generations = heap.generation_count(),
            "Collector initialized"
        );

        Ok(Self {
            full_gc: MarkSweepCompact::new(config.compaction.clone()),
            config,
            heap,
            roots: RootSet::new(),
            weak: WeakRoots::new(),
            tracker,
            remsets,
            policy,
            stats: GcStats::default(),
            poisoned: false,
        })
    }

    fn check_poisoned(&self) -> GcResult<()> {
        if self.poisoned {
            Err(GcError::Poisoned)
        } else {
            Ok(())
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    /// Configuration in effect
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Remembered sets
    pub fn remembered_sets(&self) -> &RememberedSets {
        &self.remsets
    }

    /// Promotion tracker
    pub fn promotion_tracker(&self) -> &PromotionTracker {
        &self.tracker
    }

    /// Sizing policy
    pub fn policy(&self) -> &AdaptiveSizePolicy {
        &self.policy
    }

    /// Statistics so far
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Whether an unrecoverable error has disabled the collector
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Young words the allocator may use before collecting
    pub fn young_limit(&self) -> usize {
        let capacity = self.heap.generation(self.heap.young()).capacity_words();
        self.policy.recommended_young_size().min(capacity)
    }

    /// Recommended young generation size in words
    pub fn recommended_young_size(&self) -> usize {
        self.policy.recommended_young_size()
    }

    /// Recommended old generation size in words
    pub fn recommended_old_size(&self) -> usize {
        self.policy.recommended_old_size()
    }

    /// Check heap consistency
    pub fn verify(&self) -> GcResult<()> {
        self.check_poisoned()?;
        self.heap.verify()
    }

    // ---------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------

    /// Keep `obj` alive until [`unroot`](Self::unroot)
    pub fn root(&mut self, obj: Address) -> RootHandle {
        self.roots.add(obj)
    }

    /// Drop a strong root
    pub fn unroot(&mut self, handle: RootHandle) -> Option<Address> {
        self.roots.remove(handle)
    }

    /// Current address of a rooted object
    pub fn resolve(&self, handle: RootHandle) -> Address {
        self.roots.get(handle)
    }

    /// Observe `obj` without keeping it alive
    pub fn weak_ref(&mut self, obj: Address) -> WeakHandle {
        self.weak.add(obj)
    }

    /// Current address of a weakly held object, `None` once collected
    pub fn resolve_weak(&self, handle: WeakHandle) -> Option<Address> {
        self.weak.get(handle)
    }

    /// Drop a weak handle
    pub fn drop_weak(&mut self, handle: WeakHandle) {
        self.weak.remove(handle);
    }

    // ---------------------------------------------------------------
    // Mutator operations
    // ---------------------------------------------------------------

    /// Allocate an object, collecting once if the young generation is full
    pub fn allocate(&mut self, shape: Shape) -> GcResult<Address> {
        self.check_poisoned()?;
        assert!(shape.is_valid(), "invalid shape {shape:?}");

        let addr = match self.allocate_young(shape) {
            Some(addr) => addr,
            None => {
                self.collect(GcCause::AllocationFailure)?;
                let old = self.heap.old();
                self.allocate_young(shape)
                    .or_else(|| self.heap.allocate_in(old, shape))
                    .ok_or(GcError::OutOfMemory {
                        size_words: shape.size(),
                    })?
            }
        };
        self.stats.allocated_words += shape.size();
        Ok(addr)
    }

    fn allocate_young(&mut self, shape: Shape) -> Option<Address> {
        let young = self.heap.young();
        if self.heap.generation(young).used_words() + shape.size() > self.young_limit() {
            return None;
        }
        self.heap.allocate_in(young, shape)
    }

    /// Store a reference into `holder` through the write barrier
    pub fn write_ref(&mut self, holder: Address, field: usize, value: Option<Address>) -> GcResult<()> {
        self.check_poisoned()?;
        barrier::write_ref(&mut self.heap, &mut self.remsets, holder, field, value);
        Ok(())
    }

    /// Read reference field `field` of `obj`
    pub fn read_ref(&self, obj: Address, field: usize) -> Option<Address> {
        self.heap.load_ref(self.heap.field_slot(obj, field))
    }

    /// Read payload word `index` of `obj`
    pub fn raw(&self, obj: Address, index: usize) -> u64 {
        self.heap.raw(obj, index)
    }

    /// Write payload word `index` of `obj`
    pub fn set_raw(&mut self, obj: Address, index: usize, value: u64) {
        self.heap.set_raw(obj, index, value);
    }

    /// Object header
    pub fn header(&self, obj: Address) -> MarkWord {
        self.heap.header(obj)
    }

    /// Replace an object's header (hashing, locking); only quiescent headers are accepted
    pub fn set_header(&mut self, obj: Address, mark: MarkWord) {
        assert!(mark.is_quiescent(), "mutator header {mark:?} is not quiescent");
        self.heap.set_header(obj, mark);
    }

    // ---------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------

    /// Run a collection.
    ///
    /// Explicit requests always collect the whole heap. Otherwise a young
    /// collection runs when the padded promotion average fits into the old
    /// generation's free space, falling back to a full collection on
    /// promotion failure.
    pub fn collect(&mut self, cause: GcCause) -> GcResult<()> {
        self.check_poisoned()?;
        let result = self.collect_inner(cause);
        if let Err(err) = &result
            && !err.is_recoverable()
        {
            self.poisoned = true;
            tracing::error!(target: "otter::gc", error = %err, "Collector poisoned");
        }
        self.remsets.cleanup();
        result
    }

    fn collect_inner(&mut self, cause: GcCause) -> GcResult<()> {
        if cause.is_user_requested() {
            return self.full_collection(cause);
        }
        let old_free = self.heap.generation(self.heap.old()).free_words();
        if !self.policy.promotion_attempt_is_safe(old_free) {
            tracing::debug!(
                target: "otter::gc",
                old_free,
                padded_promoted = self.policy.padded_average_promoted(),
                "Promotion attempt unsafe; collecting the full heap"
            );
            return self.full_collection(cause);
        }
        match self.young_collection(cause) {
            Err(GcError::PromotionFailed {
                failed_objects,
                failed_words,
            }) => {
                self.stats.promotion_failures += 1;
                tracing::warn!(
                    target: "otter::gc",
                    failed_objects,
                    failed_words,
                    "Falling back to a full collection"
                );
                self.full_collection(GcCause::PromotionFailure)
            }
            other => other,
        }
    }

    fn record_pause(&mut self, pause: Duration) {
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;
    }

    fn young_collection(&mut self, cause: GcCause) -> GcResult<()> {
        let start = Instant::now();
        self.policy.minor_collection_begin();
        let result = scavenge(
            &mut self.heap,
            &mut self.tracker,
            &mut self.remsets,
            &mut self.roots,
            &mut self.weak,
        );
        self.record_pause(start.elapsed());
        self.stats.young_collections += 1;
        let young_limit = self.young_limit();
        self.policy.minor_collection_end(cause, young_limit);

        let stats = result?;
        self.stats.promoted_words += stats.promoted_words;
        self.stats.last_reclaimed_words = stats.reclaimed_words();
        self.policy.update_averages(stats.promoted_words, 0);
        self.resize();
        Ok(())
    }

    fn full_collection(&mut self, cause: GcCause) -> GcResult<()> {
        let start = Instant::now();
        self.policy.major_collection_begin();
        let stats = self
            .full_gc
            .collect(&mut self.heap, &mut self.roots, &mut self.weak)?;
        self.remsets.rebuild(&self.heap);
        self.record_pause(start.elapsed());
        self.stats.full_collections += 1;
        self.stats.last_reclaimed_words = stats.reclaimed_words();

        let young_limit = self.young_limit();
        let old_capacity = self.heap.generation(self.heap.old()).capacity_words();
        self.policy.major_collection_end(cause, young_limit, old_capacity);
        self.resize();
        Ok(())
    }

    fn resize(&mut self) {
        let old_used = self.heap.generation(self.heap.old()).used_words();
        let decision = self.policy.compute_sizes(old_used);
        tracing::trace!(
            target: "otter::gc",
            young_limit = self.young_limit(),
            decision = ?decision,
            "Generation sizes updated"
        );
    }
}
