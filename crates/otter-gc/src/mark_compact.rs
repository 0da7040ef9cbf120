//! Full mark-sweep-compact collection
//!
//! Sliding compaction in four strictly sequential phases:
//!
//! 1. **Mark**: trace from the strong roots, setting `MarkWord::Marked`.
//!    Headers that must survive are pushed onto the preserved-mark stack
//!    first. Weak roots to unmarked objects are cleared afterwards.
//! 2. **Compute addresses**: walk every generation bottom to top in layout
//!    order. Each live object is assigned the current compaction cursor of
//!    its generation's first destination with room; the header becomes
//!    `Forwarded(dest)`, or the prototype when the object stays put. Each run
//!    of dead objects gets a `DeadSpan` header pointing at the next live
//!    object, unless it is cheap enough to keep as dead wood.
//! 3. **Adjust pointers**: rewrite every interior slot, root, weak root and
//!    preserved-mark address to the forwarded location.
//! 4. **Compact**: slide each object to its destination (always at or below
//!    its current address), reset its header, set each generation's top and
//!    restore preserved headers.

use std::time::Instant;

use crate::config::CompactionPolicy;
use crate::error::{GcError, GcResult, guarantee};
use crate::heap::{GenerationId, GenerationRole, Heap};
use crate::object::{Address, MarkWord, ObjectModel};
use crate::preserved::PreservedMarks;
use crate::roots::{RootSet, WeakRoots};

/// Outcome of one full collection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Full collection number, 1-based
    pub invocation: u64,
    /// Objects reached by marking
    pub marked_objects: usize,
    /// Words of reachable objects
    pub live_words: usize,
    /// Words of dead runs kept in place as fillers
    pub dead_wood_words: usize,
    /// Objects whose address changed
    pub moved_objects: usize,
    /// Headers saved and restored around the collection
    pub preserved_marks: usize,
    /// Weak roots cleared
    pub weak_cleared: usize,
    /// Used words before the collection
    pub used_before: usize,
    /// Used words after the collection
    pub used_after: usize,
}

impl CompactionStats {
    /// Words freed by the collection
    pub fn reclaimed_words(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }
}

/// Full-heap sliding compactor
#[derive(Debug)]
pub struct MarkSweepCompact {
    policy: CompactionPolicy,
    invocations: u64,
}

impl MarkSweepCompact {
    /// Create an engine with the given policy
    pub fn new(policy: CompactionPolicy) -> Self {
        Self {
            policy,
            invocations: 0,
        }
    }

    /// Policy in effect
    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Full collections started so far
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Collect the whole heap.
    ///
    /// `CompactionExhausted` leaves the heap unparseable; the caller must
    /// treat it as fatal.
    pub fn collect(
        &mut self,
        heap: &mut Heap,
        roots: &mut RootSet,
        weak: &mut WeakRoots,
    ) -> GcResult<CompactionStats> {
        self.invocations += 1;
        let invocation = self.invocations;
        let allow_dead_wood = self.policy.allows_dead_wood(invocation);
        let start = Instant::now();

        tracing::debug!(
            target: "otter::gc",
            collection = invocation,
            roots = roots.len(),
            used_words = heap.used_words(),
            dead_wood = allow_dead_wood,
            "Full GC starting"
        );

        let mut cycle = FullCollection::new(heap, roots, weak, &self.policy);
        cycle.stats.invocation = invocation;
        cycle.mark_phase();
        cycle.compute_addresses(allow_dead_wood)?;
        cycle.adjust_pointers();
        cycle.compact();
        let stats = cycle.stats;

        tracing::info!(
            target: "otter::gc",
            collection = invocation,
            live_words = stats.live_words,
            reclaimed_words = stats.reclaimed_words(),
            dead_wood_words = stats.dead_wood_words,
            moved_objects = stats.moved_objects,
            pause_us = start.elapsed().as_micros() as u64,
            "Full GC complete"
        );
        Ok(stats)
    }
}

/// State of one collection in progress
struct FullCollection<'a> {
    heap: &'a mut Heap,
    roots: &'a mut RootSet,
    weak: &'a mut WeakRoots,
    policy: &'a CompactionPolicy,
    preserved: PreservedMarks,
    stack: Vec<Address>,
    /// Compaction cursor per generation
    cursors: Vec<Address>,
    stats: CompactionStats,
}

impl<'a> FullCollection<'a> {
    fn new(
        heap: &'a mut Heap,
        roots: &'a mut RootSet,
        weak: &'a mut WeakRoots,
        policy: &'a CompactionPolicy,
    ) -> Self {
        let cursors = heap.generations().map(|(_, g)| g.bottom()).collect();
        let used_before = heap.used_words();
        Self {
            heap,
            roots,
            weak,
            policy,
            preserved: PreservedMarks::new(),
            stack: Vec::new(),
            cursors,
            stats: CompactionStats {
                used_before,
                ..CompactionStats::default()
            },
        }
    }

    // ---------------------------------------------------------------
    // Phase 1: mark
    // ---------------------------------------------------------------

    fn mark_phase(&mut self) {
        let roots: Vec<Address> = self.roots.iter().collect();
        for root in roots {
            self.mark_object(root);
        }
        while let Some(obj) = self.stack.pop() {
            for slot in self.heap.pointer_slots(obj) {
                if let Some(target) = self.heap.load_ref(slot) {
                    self.mark_object(target);
                }
            }
        }

        let heap = &*self.heap;
        self.stats.weak_cleared = self
            .weak
            .update(|target| heap.header(target).is_marked().then_some(target));
        tracing::debug!(
            target: "otter::gc",
            marked = self.stats.marked_objects,
            live_words = self.stats.live_words,
            preserved = self.preserved.len(),
            weak_cleared = self.stats.weak_cleared,
            "Mark phase complete"
        );
    }

    fn mark_object(&mut self, obj: Address) {
        let mark = self.heap.header(obj);
        if mark.is_marked() {
            return;
        }
        guarantee!(
            mark.is_quiescent(),
            "marking {:?} whose header is {:?}",
            obj,
            mark
        );
        if mark.must_be_preserved() {
            self.preserved.push(obj, mark);
        }
        self.heap.set_header(obj, MarkWord::Marked);
        self.stats.marked_objects += 1;
        self.stats.live_words += self.heap.size(obj);
        self.stack.push(obj);
    }

    // ---------------------------------------------------------------
    // Phase 2: compute new addresses
    // ---------------------------------------------------------------

    fn compute_addresses(&mut self, allow_dead_wood: bool) -> GcResult<()> {
        for index in 0..self.heap.generation_count() {
            let id = GenerationId(index);
            let generation = self.heap.generation(id);
            let role = generation.role();
            let (bottom, top) = (generation.bottom(), generation.top());
            let destinations = generation.destinations().to_vec();
            let mut budget = if allow_dead_wood {
                generation.capacity_words() * self.policy.dead_ratio(role) as usize / 100
            } else {
                0
            };

            let mut dest_index = 0;
            let mut q = bottom;
            while q < top {
                let size = self.heap.size(q);
                if self.heap.header(q).is_marked() {
                    self.forward(role, &destinations, &mut dest_index, q, size)?;
                    q = q.offset(size);
                    continue;
                }

                let mut end = q.offset(size);
                while end < top && !self.heap.header(end).is_marked() {
                    end = end.offset(self.heap.size(end));
                }
                let run = q.words_until(end);

                // A dead run that would not move anything anyway may stay as
                // filler, sparing the copy of everything above it.
                if budget > 0
                    && destinations.get(dest_index) == Some(&id)
                    && self.cursors[index] == q
                {
                    if run <= budget {
                        budget -= run;
                        self.heap.fill_with_dead_object(q, run);
                        self.cursors[index] = end;
                        self.stats.dead_wood_words += run;
                        q = end;
                        continue;
                    }
                    budget = 0;
                }

                self.heap
                    .set_header(q, MarkWord::DeadSpan { next_live: end });
                q = end;
            }
        }
        Ok(())
    }

    fn forward(
        &mut self,
        role: GenerationRole,
        destinations: &[GenerationId],
        dest_index: &mut usize,
        obj: Address,
        size: usize,
    ) -> GcResult<Address> {
        loop {
            let Some(&dest) = destinations.get(*dest_index) else {
                tracing::error!(
                    target: "otter::gc",
                    generation = ?role,
                    object = ?obj,
                    size_words = size,
                    "No compaction destination has room"
                );
                return Err(GcError::CompactionExhausted {
                    generation: role,
                    size_words: size,
                });
            };
            let cursor = self.cursors[dest.0];
            if cursor.words_until(self.heap.generation(dest).end()) >= size {
                guarantee!(
                    cursor <= obj,
                    "destination {:?} lies above {:?}",
                    cursor,
                    obj
                );
                self.cursors[dest.0] = cursor.offset(size);
                if cursor == obj {
                    self.heap.set_header(obj, MarkWord::PROTOTYPE);
                } else {
                    self.heap.set_header(obj, MarkWord::Forwarded(cursor));
                    self.stats.moved_objects += 1;
                }
                return Ok(cursor);
            }
            tracing::debug!(
                target: "otter::gc",
                generation = ?role,
                full = ?self.heap.generation(dest).role(),
                "Compaction destination full, moving to the next"
            );
            *dest_index += 1;
        }
    }

    // ---------------------------------------------------------------
    // Phase 3: adjust pointers
    // ---------------------------------------------------------------

    fn new_location(heap: &Heap, obj: Address) -> Address {
        match heap.header(obj) {
            MarkWord::Forwarded(to) => to,
            mark if mark.is_quiescent() => obj,
            other => panic!("reference to {obj:?} with header {other:?} after address computation"),
        }
    }

    fn adjust_pointers(&mut self) {
        for index in 0..self.heap.generation_count() {
            let generation = self.heap.generation(GenerationId(index));
            let (mut q, top) = (generation.bottom(), generation.top());
            while q < top {
                if let MarkWord::DeadSpan { next_live } = self.heap.header(q) {
                    q = next_live;
                    continue;
                }
                for slot in self.heap.pointer_slots(q) {
                    if let Some(target) = self.heap.load_ref(slot) {
                        let to = Self::new_location(self.heap, target);
                        if to != target {
                            self.heap.store_ref(slot, Some(to));
                        }
                    }
                }
                q = q.offset(self.heap.size(q));
            }
        }

        let heap = &*self.heap;
        self.roots.update(|obj| Self::new_location(heap, obj));
        self.weak.update(|obj| Some(Self::new_location(heap, obj)));
        self.preserved.adjust(|obj| Self::new_location(heap, obj));
    }

    // ---------------------------------------------------------------
    // Phase 4: compact
    // ---------------------------------------------------------------

    fn compact(&mut self) {
        let mut compacted = 0;
        for index in 0..self.heap.generation_count() {
            let generation = self.heap.generation(GenerationId(index));
            let (mut q, top) = (generation.bottom(), generation.top());
            while q < top {
                match self.heap.header(q) {
                    MarkWord::DeadSpan { next_live } => {
                        q = next_live;
                    }
                    MarkWord::Forwarded(to) => {
                        let size = self.heap.size(q);
                        self.heap.copy_words(q, to, size);
                        self.heap.set_header(to, MarkWord::PROTOTYPE);
                        compacted += size;
                        q = q.offset(size);
                    }
                    mark => {
                        guarantee!(
                            mark == MarkWord::PROTOTYPE,
                            "unexpected header {:?} at {:?} during compaction",
                            mark,
                            q
                        );
                        let size = self.heap.size(q);
                        compacted += size;
                        q = q.offset(size);
                    }
                }
            }
        }

        for index in 0..self.heap.generation_count() {
            let id = GenerationId(index);
            let old_top = self.heap.generation(id).top();
            let new_top = self.cursors[index];
            self.heap.generation_mut(id).set_top(new_top);
            if new_top < old_top {
                self.heap.mangle(new_top..old_top);
            }
        }

        self.stats.preserved_marks = self.preserved.restore(self.heap);
        self.stats.used_after = self.heap.used_words();

        guarantee!(
            compacted - self.stats.dead_wood_words == self.stats.live_words,
            "live words not conserved: marked {} but compacted {} ({} dead wood)",
            self.stats.live_words,
            compacted,
            self.stats.dead_wood_words
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapLayout;
    use crate::object::Shape;

    fn heap() -> Heap {
        let layout = HeapLayout::two_generation(512, 512).with_geometry(128, 16);
        Heap::new(&layout, true)
    }

    fn no_dead_wood() -> CompactionPolicy {
        CompactionPolicy {
            always_compact_count: 1,
            ..CompactionPolicy::default()
        }
    }

    /// Allocate `count` old objects, linking each to the previous one
    fn chain(heap: &mut Heap, id: GenerationId, count: usize) -> Vec<Address> {
        let mut objs: Vec<Address> = Vec::new();
        for i in 0..count {
            let obj = heap.allocate_in(id, Shape::new(1, 1)).unwrap();
            heap.set_raw(obj, 0, i as u64);
            if let Some(&prev) = objs.last() {
                let slot = heap.field_slot(obj, 0);
                heap.store_ref(slot, Some(prev));
            }
            objs.push(obj);
        }
        objs
    }

    #[test]
    fn test_compacts_live_objects_to_bottom() {
        let mut heap = heap();
        let old = heap.old();
        let garbage = heap.allocate_in(old, Shape::new(0, 10)).unwrap();
        let objs = chain(&mut heap, old, 3);
        let mut roots = RootSet::new();
        let root = roots.add(objs[2]);
        let mut weak = WeakRoots::new();

        let mut engine = MarkSweepCompact::new(no_dead_wood());
        let stats = engine.collect(&mut heap, &mut roots, &mut weak).unwrap();

        assert_eq!(garbage, Address(0));
        assert_eq!(stats.live_words, 12);
        assert_eq!(stats.reclaimed_words(), 12);
        assert_eq!(heap.generation(old).top(), Address(12));
        let head = roots.get(root);
        assert_eq!(head, Address(8));
        assert_eq!(heap.raw(head, 0), 2);
        let mid = heap.load_ref(heap.field_slot(head, 0)).unwrap();
        assert_eq!(heap.raw(mid, 0), 1);
        assert!(heap.verify().is_ok());
    }

    #[test]
    fn test_forwarding_complete_before_compaction() {
        let mut heap = heap();
        let old = heap.old();
        let young = heap.young();
        heap.allocate_in(old, Shape::new(0, 4)).unwrap();
        let kept_old = chain(&mut heap, old, 2);
        heap.allocate_in(young, Shape::new(0, 4)).unwrap();
        let kept_young = chain(&mut heap, young, 2);
        let mut roots = RootSet::new();
        roots.add(kept_old[1]);
        roots.add(kept_young[1]);
        let mut weak = WeakRoots::new();
        let policy = no_dead_wood();

        let mut cycle = FullCollection::new(&mut heap, &mut roots, &mut weak, &policy);
        cycle.mark_phase();
        cycle.compute_addresses(false).unwrap();
        for obj in kept_old.iter().chain(&kept_young) {
            let to = FullCollection::new_location(cycle.heap, *obj);
            assert!(to <= *obj);
            assert!(cycle.heap.generation(old).contains(to));
        }
        cycle.adjust_pointers();
        cycle.compact();
        assert_eq!(cycle.stats.moved_objects, 4);
        assert_eq!(heap.generation(young).used_words(), 0);
        assert_eq!(heap.generation(old).used_words(), 16);
    }

    #[test]
    fn test_preserved_headers_follow_objects() {
        let mut heap = heap();
        let old = heap.old();
        heap.allocate_in(old, Shape::new(0, 6)).unwrap();
        let obj = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        heap.set_header(obj, MarkWord::Neutral { hash: 77, age: 2 });
        let mut roots = RootSet::new();
        let root = roots.add(obj);
        let mut weak = WeakRoots::new();

        let mut engine = MarkSweepCompact::new(no_dead_wood());
        let stats = engine.collect(&mut heap, &mut roots, &mut weak).unwrap();
        assert_eq!(stats.preserved_marks, 1);
        let moved = roots.get(root);
        assert_eq!(moved, Address(0));
        assert_eq!(heap.header(moved), MarkWord::Neutral { hash: 77, age: 2 });
    }

    #[test]
    fn test_weak_roots_cleared_or_updated() {
        let mut heap = heap();
        let old = heap.old();
        let dead = heap.allocate_in(old, Shape::new(0, 2)).unwrap();
        let live = heap.allocate_in(old, Shape::new(0, 2)).unwrap();
        let mut roots = RootSet::new();
        roots.add(live);
        let mut weak = WeakRoots::new();
        let to_dead = weak.add(dead);
        let to_live = weak.add(live);

        let mut engine = MarkSweepCompact::new(no_dead_wood());
        let stats = engine.collect(&mut heap, &mut roots, &mut weak).unwrap();
        assert_eq!(stats.weak_cleared, 1);
        assert_eq!(weak.get(to_dead), None);
        assert_eq!(weak.get(to_live), Some(Address(0)));
    }

    #[test]
    fn test_dead_wood_left_in_place() {
        let mut heap = heap();
        let old = heap.old();
        // 4 dead words at the bottom fit in the 5% budget (25 words)
        heap.allocate_in(old, Shape::new(0, 2)).unwrap();
        let live = heap.allocate_in(old, Shape::new(0, 2)).unwrap();
        let mut roots = RootSet::new();
        let root = roots.add(live);
        let mut weak = WeakRoots::new();

        let mut engine = MarkSweepCompact::new(CompactionPolicy::default());
        let stats = engine.collect(&mut heap, &mut roots, &mut weak).unwrap();
        assert_eq!(stats.dead_wood_words, 4);
        assert_eq!(stats.moved_objects, 0);
        assert_eq!(roots.get(root), live);
        assert_eq!(heap.generation(old).top(), Address(8));
        assert!(heap.verify().is_ok());

        // second through fourth runs: the fourth ignores the budget
        for _ in 0..3 {
            engine.collect(&mut heap, &mut roots, &mut weak).unwrap();
        }
        assert_eq!(engine.invocations(), 4);
        assert_eq!(roots.get(root), Address(0));
        assert_eq!(heap.generation(old).top(), Address(4));
    }

    #[test]
    fn test_young_overflows_into_itself() {
        // old is 128 words with 120 live; young's 16 live words only partly fit
        let layout = HeapLayout::two_generation(256, 128).with_geometry(128, 16);
        let mut heap = Heap::new(&layout, false);
        let old = heap.old();
        let young = heap.young();
        let mut roots = RootSet::new();
        for _ in 0..12 {
            let obj = heap.allocate_in(old, Shape::new(0, 8)).unwrap();
            roots.add(obj);
        }
        heap.allocate_in(young, Shape::new(0, 30)).unwrap();
        let a = heap.allocate_in(young, Shape::new(0, 6)).unwrap();
        let b = heap.allocate_in(young, Shape::new(0, 6)).unwrap();
        let ra = roots.add(a);
        let rb = roots.add(b);
        let mut weak = WeakRoots::new();

        let mut engine = MarkSweepCompact::new(no_dead_wood());
        engine.collect(&mut heap, &mut roots, &mut weak).unwrap();
        assert_eq!(roots.get(ra), Address(120));
        assert_eq!(roots.get(rb), heap.generation(young).bottom());
        assert_eq!(heap.generation(old).top(), Address(128));
        assert_eq!(heap.generation(young).used_words(), 8);
    }

    #[test]
    fn test_exhausted_destinations() {
        let mut layout = HeapLayout::two_generation(128, 128).with_geometry(128, 16);
        layout.generations[1].destinations = vec![GenerationRole::Old];
        let mut heap = Heap::new(&layout, false);
        let old = heap.old();
        let young = heap.young();
        let mut roots = RootSet::new();
        roots.add(heap.allocate_in(old, Shape::new(0, 100)).unwrap());
        roots.add(heap.allocate_in(young, Shape::new(0, 40)).unwrap());
        let mut weak = WeakRoots::new();

        let mut engine = MarkSweepCompact::new(no_dead_wood());
        let err = engine.collect(&mut heap, &mut roots, &mut weak).unwrap_err();
        assert_eq!(
            err,
            GcError::CompactionExhausted {
                generation: GenerationRole::Young,
                size_words: 42
            }
        );
    }
}
