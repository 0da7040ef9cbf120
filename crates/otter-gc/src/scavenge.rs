//! Young collection with promotion
//!
//! Every live young object is copied into the old generation (promote-all).
//! The copies are threaded onto the promotion tracker, whose drain scans them
//! for further young referents. Old-to-young references come from the strong
//! roots and from the cards recorded in the remembered sets; cards are only
//! scanned below the old top saved at the start of the cycle, since anything
//! above it is a fresh copy the tracker already covers.
//!
//! When an object cannot be promoted (old generation full, or no spool block
//! for its header) it is forwarded to itself and scanned in place. The cycle
//! still completes so that every reference is consistent, then self-forwarding
//! is undone and `GcError::PromotionFailed` tells the caller to run a full
//! collection.

use std::time::Instant;

use crate::barrier::RememberedSets;
use crate::error::{GcError, GcResult, guarantee};
use crate::heap::{GenerationId, Heap};
use crate::object::{Address, MarkWord, ObjectModel, Word};
use crate::preserved::PreservedMarks;
use crate::promotion::PromotionTracker;
use crate::roots::{RootSet, WeakRoots};

/// Outcome of a successful young collection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeStats {
    /// Objects copied into the old generation
    pub promoted_objects: usize,
    /// Words copied into the old generation
    pub promoted_words: usize,
    /// Remembered cards scanned
    pub cards_scanned: usize,
    /// Headers spooled by the promotion tracker
    pub spooled_headers: usize,
    /// Weak roots into young that were cleared
    pub weak_cleared: usize,
    /// Young words in use before the collection
    pub young_used_before: usize,
}

impl ScavengeStats {
    /// Young words freed (live objects moved out count as freed)
    pub fn reclaimed_words(&self) -> usize {
        self.young_used_before.saturating_sub(self.promoted_words)
    }
}

/// Per-cycle state that is not the heap or the tracker
struct ScavengeState {
    old: GenerationId,
    saved_old_top: Address,
    preserved: PreservedMarks,
    /// Self-forwarded objects still to be scanned in place
    failed_stack: Vec<Address>,
    failed_objects: usize,
    failed_words: usize,
    stats: ScavengeStats,
}

impl ScavengeState {
    /// Copy `obj` out of young, or forward it to itself if that is impossible
    fn evacuate(&mut self, heap: &mut Heap, tracker: &mut PromotionTracker, obj: Address) -> Address {
        let mark = heap.header(obj);
        if let Some(to) = mark.forwardee() {
            return to;
        }
        guarantee!(
            mark.is_quiescent(),
            "evacuating {:?} whose header is {:?}",
            obj,
            mark
        );
        let size = heap.size(obj);

        if mark.must_be_preserved()
            && let Err(err) = tracker.ensure_spooling_space()
        {
            return self.promotion_failed(heap, obj, mark, size, &err.to_string());
        }
        let Some(to) = heap.allocate_raw(self.old, size) else {
            return self.promotion_failed(heap, obj, mark, size, "old generation full");
        };

        heap.copy_words(obj, to, size);
        heap.set_header(obj, MarkWord::Forwarded(to));
        let tracked = tracker.track(heap, to);
        guarantee!(
            tracked.is_ok(),
            "tracking {:?} failed after reserving spool space: {:?}",
            to,
            tracked
        );
        self.stats.promoted_objects += 1;
        self.stats.promoted_words += size;
        to
    }

    fn promotion_failed(
        &mut self,
        heap: &mut Heap,
        obj: Address,
        mark: MarkWord,
        size: usize,
        reason: &str,
    ) -> Address {
        if self.failed_objects == 0 {
            tracing::warn!(
                target: "otter::gc",
                object = ?obj,
                size_words = size,
                reason,
                "Promotion failed; scanning in place"
            );
        }
        if mark.must_be_preserved() {
            self.preserved.push(obj, mark);
        }
        heap.set_header(obj, MarkWord::Forwarded(obj));
        self.failed_stack.push(obj);
        self.failed_objects += 1;
        self.failed_words += size;
        obj
    }

    /// Evacuate the young referent of `slot`, if any, and fix the slot
    fn process_slot(
        &mut self,
        heap: &mut Heap,
        tracker: &mut PromotionTracker,
        remsets: &mut RememberedSets,
        slot: Address,
    ) {
        let Some(target) = heap.load_ref(slot) else {
            return;
        };
        if !heap.is_young(target) {
            return;
        }
        let to = self.evacuate(heap, tracker, target);
        if to != target {
            heap.store_ref(slot, Some(to));
        }
        // a failed promotion leaves an old-to-young edge behind
        remsets.record(heap, slot, to);
    }

    fn scan_object(
        &mut self,
        heap: &mut Heap,
        tracker: &mut PromotionTracker,
        remsets: &mut RememberedSets,
        obj: Address,
    ) {
        for slot in heap.pointer_slots(obj) {
            self.process_slot(heap, tracker, remsets, slot);
        }
    }

    fn scan_cards(&mut self, heap: &mut Heap, tracker: &mut PromotionTracker, remsets: &mut RememberedSets) {
        for (region, card) in remsets.remembered_cards() {
            let range = heap.card_range(region, card);
            let Some(id) = heap.generation_of(range.start) else {
                continue;
            };
            let mut limit = heap.generation(id).top();
            if id == self.old {
                limit = limit.min(self.saved_old_top);
            }
            let end = range.end.min(limit);
            let mut addr = range.start;
            while addr < end {
                if let Word::Ref(Some(_)) = heap.word(addr) {
                    self.process_slot(heap, tracker, remsets, addr);
                }
                addr = addr.offset(1);
            }
            self.stats.cards_scanned += 1;
        }
    }
}

/// Run one young collection.
///
/// On `Err(GcError::PromotionFailed)` the heap is consistent and parseable
/// but the young generation still holds the objects that could not be
/// promoted; the caller should follow up with a full collection. Any other
/// error is unrecoverable.
pub fn scavenge(
    heap: &mut Heap,
    tracker: &mut PromotionTracker,
    remsets: &mut RememberedSets,
    roots: &mut RootSet,
    weak: &mut WeakRoots,
) -> GcResult<ScavengeStats> {
    let start = Instant::now();
    let young = heap.young();
    let old = heap.old();

    // save marks
    let mut state = ScavengeState {
        old,
        saved_old_top: heap.generation(old).top(),
        preserved: PreservedMarks::new(),
        failed_stack: Vec::new(),
        failed_objects: 0,
        failed_words: 0,
        stats: ScavengeStats {
            young_used_before: heap.generation(young).used_words(),
            ..ScavengeStats::default()
        },
    };
    tracker.start_tracking();

    tracing::debug!(
        target: "otter::gc",
        young_used = state.stats.young_used_before,
        old_free = heap.generation(old).free_words(),
        remembered_cards = remsets.occupied_cards(),
        "Young GC starting"
    );

    roots.update(|obj| {
        if heap.is_young(obj) {
            state.evacuate(heap, tracker, obj)
        } else {
            obj
        }
    });
    state.scan_cards(heap, tracker, remsets);

    while !tracker.no_promotions() || !state.failed_stack.is_empty() {
        tracker.drain(heap, |heap, tracker, obj| {
            state.scan_object(heap, tracker, remsets, obj);
            Ok(())
        })?;
        while let Some(obj) = state.failed_stack.pop() {
            state.scan_object(heap, tracker, remsets, obj);
        }
    }
    state.stats.spooled_headers = tracker.stats().spooled;
    tracker.stop_tracking();

    state.stats.weak_cleared = weak.update(|target| {
        if !heap.is_young(target) {
            return Some(target);
        }
        heap.header(target).forwardee()
    });

    if state.failed_objects > 0 {
        undo_self_forwarding(heap, young, &mut state.preserved);
        tracing::warn!(
            target: "otter::gc",
            failed_objects = state.failed_objects,
            failed_words = state.failed_words,
            promoted_objects = state.stats.promoted_objects,
            pause_us = start.elapsed().as_micros() as u64,
            "Young GC ended with promotion failure"
        );
        return Err(GcError::PromotionFailed {
            failed_objects: state.failed_objects,
            failed_words: state.failed_words,
        });
    }

    let generation = heap.generation(young);
    let (bottom, top) = (generation.bottom(), generation.top());
    heap.generation_mut(young).set_top(bottom);
    heap.mangle(bottom..top);
    remsets.clear();

    tracing::info!(
        target: "otter::gc",
        promoted_objects = state.stats.promoted_objects,
        promoted_words = state.stats.promoted_words,
        reclaimed_words = state.stats.reclaimed_words(),
        cards_scanned = state.stats.cards_scanned,
        pause_us = start.elapsed().as_micros() as u64,
        "Young GC complete"
    );
    Ok(state.stats)
}

/// Make the young generation quiescent again after a failed cycle: objects
/// forwarded to themselves get their header back, originals of promoted
/// copies become fillers.
fn undo_self_forwarding(heap: &mut Heap, young: GenerationId, preserved: &mut PreservedMarks) {
    let objects: Vec<Address> = heap.objects(young).collect();
    for obj in objects {
        match heap.header(obj).forwardee() {
            Some(to) if to == obj => heap.set_header(obj, MarkWord::PROTOTYPE),
            Some(_) => {
                let size = heap.size(obj);
                heap.fill_with_dead_object(obj, size);
            }
            None => {}
        }
    }
    preserved.restore(heap);
}
