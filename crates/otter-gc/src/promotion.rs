//! Promotion tracking
//!
//! Objects promoted into the old generation during a young collection are
//! chained into an intrusive singly linked list that runs through their
//! headers (`MarkWord::Promoted`). Headers that cannot be rebuilt from the
//! prototype are first copied into spool blocks. Draining the list restores
//! every header in the order it was saved and hands each object to a visitor,
//! which may promote (and so track) further objects while the walk is running.

use std::collections::VecDeque;

use crate::error::{GcResult, guarantee};
use crate::object::{Address, MarkWord, ObjectModel};
use crate::spool::{SharedSpoolAllocator, SpoolBlock};

/// Per-cycle tracking counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PromotionStats {
    /// Objects tracked since tracking started
    pub tracked: usize,
    /// Of those, objects whose header went to the spool
    pub spooled: usize,
}

/// Intrusive list of promoted objects plus their displaced headers
pub struct PromotionTracker {
    head: Option<Address>,
    tail: Option<Address>,
    tracking: bool,
    spool: SharedSpoolAllocator,
    /// Front is restored first, back receives new headers
    blocks: VecDeque<SpoolBlock>,
    stats: PromotionStats,
}

impl PromotionTracker {
    /// Create a tracker drawing spool blocks from `spool`
    pub fn new(spool: SharedSpoolAllocator) -> Self {
        Self {
            head: None,
            tail: None,
            tracking: false,
            spool,
            blocks: VecDeque::new(),
            stats: PromotionStats::default(),
        }
    }

    /// Begin a promotion cycle
    pub fn start_tracking(&mut self) {
        guarantee!(self.no_promotions(), "start_tracking with promotions pending");
        self.tracking = true;
        self.stats = PromotionStats::default();
    }

    /// End a promotion cycle; the list must already be drained
    pub fn stop_tracking(&mut self) {
        guarantee!(
            self.no_promotions() && self.blocks.is_empty(),
            "stop_tracking with {} spool block(s) outstanding",
            self.blocks.len()
        );
        self.tracking = false;
    }

    /// Whether a cycle is in progress
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Whether the list is empty
    pub fn no_promotions(&self) -> bool {
        self.head.is_none()
    }

    /// Counters for the current cycle
    pub fn stats(&self) -> PromotionStats {
        self.stats
    }

    /// Make sure the next `track` of a header that needs preserving cannot fail
    pub fn ensure_spooling_space(&mut self) -> GcResult<()> {
        if self.blocks.back().is_some_and(|block| !block.is_full()) {
            return Ok(());
        }
        let block = self.spool.lock().allocate()?;
        self.blocks.push_back(block);
        Ok(())
    }

    /// Record a freshly promoted object.
    ///
    /// On error the object's header is untouched and the object is not tracked.
    pub fn track<H: ObjectModel>(&mut self, heap: &mut H, obj: Address) -> GcResult<()> {
        guarantee!(self.tracking, "track({:?}) outside a promotion cycle", obj);
        let mark = heap.header(obj);
        guarantee!(
            mark.is_quiescent(),
            "track({:?}) of object with header {:?}",
            obj,
            mark
        );

        let spooled = mark.must_be_preserved();
        if spooled {
            self.ensure_spooling_space()?;
            if let Some(block) = self.blocks.back_mut() {
                block.push(mark);
            }
            self.stats.spooled += 1;
        }
        heap.set_header(obj, MarkWord::Promoted { next: None, spooled });

        match self.tail {
            Some(tail) => match heap.header(tail) {
                MarkWord::Promoted { spooled, .. } => heap.set_header(
                    tail,
                    MarkWord::Promoted {
                        next: Some(obj),
                        spooled,
                    },
                ),
                other => panic!("promotion tail {tail:?} has header {other:?}"),
            },
            None => self.head = Some(obj),
        }
        self.tail = Some(obj);
        self.stats.tracked += 1;
        Ok(())
    }

    /// Walk the list head to tail, restoring headers and visiting objects.
    ///
    /// The visitor may call [`track`](Self::track) again; such objects are
    /// visited by the same drain. Returns the number of objects visited.
    ///
    /// If the visitor fails, the headers of every object still in the list
    /// are restored without visiting it and the list is emptied before the
    /// error is returned.
    pub fn drain<H, F>(&mut self, heap: &mut H, mut visitor: F) -> GcResult<usize>
    where
        H: ObjectModel,
        F: FnMut(&mut H, &mut PromotionTracker, Address) -> GcResult<()>,
    {
        let mut visited = 0;
        while let Some(first) = self.head {
            let mut cursor = Some(first);
            while let Some(obj) = cursor {
                let (next, spooled) = match heap.header(obj) {
                    MarkWord::Promoted { next, spooled } => (next, spooled),
                    other => panic!("promoted object {obj:?} has header {other:?}"),
                };
                if next.is_none() {
                    // Last node: anything tracked from here on starts a new list.
                    guarantee!(
                        self.tail == Some(obj),
                        "promotion list ends at {:?} but tail is {:?}",
                        obj,
                        self.tail
                    );
                    self.head = None;
                    self.tail = None;
                }

                let restored = if spooled {
                    self.restore_displaced()
                } else {
                    MarkWord::PROTOTYPE
                };
                heap.set_header(obj, restored);

                if let Err(err) = visitor(heap, self, obj) {
                    self.abandon(heap, next.or(self.head));
                    return Err(err);
                }
                visited += 1;
                cursor = next;
            }
        }
        self.release_drained_blocks();
        Ok(visited)
    }

    fn restore_displaced(&mut self) -> MarkWord {
        // A drained front block may have been followed by a new one while the
        // walk was running.
        while self.blocks.len() > 1 && self.blocks.front().is_some_and(SpoolBlock::is_drained) {
            if let Some(done) = self.blocks.pop_front() {
                self.spool.lock().release(done);
            }
        }
        let Some(block) = self.blocks.front_mut() else {
            panic!("spooled header requested but no spool block is held");
        };
        let Some(mark) = block.pop_front() else {
            panic!("spool underflow: front block has nothing left to restore");
        };
        mark
    }

    /// Restore headers from `cursor` to the end of the list without visiting
    fn abandon<H: ObjectModel>(&mut self, heap: &mut H, mut cursor: Option<Address>) {
        let mut restored = 0usize;
        while let Some(obj) = cursor {
            let (next, spooled) = match heap.header(obj) {
                MarkWord::Promoted { next, spooled } => (next, spooled),
                other => panic!("promoted object {obj:?} has header {other:?}"),
            };
            let mark = if spooled {
                self.restore_displaced()
            } else {
                MarkWord::PROTOTYPE
            };
            heap.set_header(obj, mark);
            restored += 1;
            cursor = next;
        }
        self.head = None;
        self.tail = None;
        self.release_drained_blocks();
        tracing::debug!(
            target: "otter::gc",
            restored,
            "Promotion list abandoned after visitor error"
        );
    }

    fn release_drained_blocks(&mut self) {
        let mut spool = self.spool.lock();
        while let Some(block) = self.blocks.pop_front() {
            guarantee!(
                block.is_drained(),
                "promotion list drained with {} spooled header(s) left",
                block.pending()
            );
            spool.release(block);
        }
    }

    /// Objects currently in the list, head first
    pub fn promoted_objects<H: ObjectModel>(&self, heap: &H) -> Vec<Address> {
        let mut objects = Vec::new();
        let mut cursor = self.head;
        while let Some(obj) = cursor {
            objects.push(obj);
            cursor = match heap.header(obj) {
                MarkWord::Promoted { next, .. } => next,
                _ => None,
            };
        }
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapLayout, SpoolConfig};
    use crate::error::GcError;
    use crate::heap::Heap;
    use crate::object::Shape;
    use crate::spool::SpoolAllocator;

    fn setup(block_capacity: usize, max_blocks: Option<usize>) -> (Heap, PromotionTracker) {
        let layout = HeapLayout::two_generation(1024, 1024).with_geometry(256, 32);
        let heap = Heap::new(&layout, false);
        let spool = SpoolAllocator::shared(&SpoolConfig {
            block_capacity,
            scratch_blocks: 1,
            max_blocks,
        });
        (heap, PromotionTracker::new(spool))
    }

    fn hashed(i: u32) -> MarkWord {
        if i % 3 == 0 {
            MarkWord::Locked { owner: i }
        } else {
            MarkWord::Neutral { hash: i, age: 1 }
        }
    }

    #[test]
    fn test_track_links_in_order() {
        let (mut heap, mut tracker) = setup(4, None);
        let old = heap.old();
        tracker.start_tracking();
        let objs: Vec<_> = (0..3)
            .map(|_| heap.allocate_in(old, Shape::new(0, 1)).unwrap())
            .collect();
        for &obj in &objs {
            tracker.track(&mut heap, obj).unwrap();
        }
        assert_eq!(tracker.promoted_objects(&heap), objs);
        assert!(heap.header(objs[0]).is_promoted());
        assert_eq!(tracker.stats().tracked, 3);
        assert_eq!(tracker.stats().spooled, 0);
    }

    #[test]
    fn test_header_round_trip_across_blocks() {
        let (mut heap, mut tracker) = setup(2, None);
        let old = heap.old();
        tracker.start_tracking();

        let mut expected = Vec::new();
        for i in 0..11u32 {
            let obj = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
            // every other object keeps the prototype header
            let mark = if i % 2 == 0 { hashed(i + 1) } else { MarkWord::PROTOTYPE };
            heap.set_header(obj, mark);
            tracker.track(&mut heap, obj).unwrap();
            expected.push((obj, mark));
        }
        assert_eq!(tracker.stats().spooled, 6);

        let visited = tracker.drain(&mut heap, |_, _, _| Ok(())).unwrap();
        assert_eq!(visited, 11);
        for (obj, mark) in expected {
            assert_eq!(heap.header(obj), mark);
        }
        assert!(tracker.no_promotions());
        tracker.stop_tracking();
        assert_eq!(tracker.spool.lock().in_use(), 0);
    }

    #[test]
    fn test_drain_visits_objects_tracked_during_walk() {
        let (mut heap, mut tracker) = setup(2, None);
        let old = heap.old();
        tracker.start_tracking();

        let first = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        heap.set_header(first, hashed(1));
        tracker.track(&mut heap, first).unwrap();

        let mut extra = Vec::new();
        let mut order = Vec::new();
        let visited = tracker
            .drain(&mut heap, |heap, tracker, obj| {
                order.push(obj);
                // each visit promotes one more object until five exist
                if order.len() < 5 {
                    let next = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
                    heap.set_header(next, hashed(order.len() as u32 + 1));
                    tracker.track(heap, next)?;
                    extra.push(next);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(visited, 5);
        assert_eq!(order[0], first);
        assert_eq!(&order[1..], extra.as_slice());
        for (i, obj) in order.iter().enumerate() {
            assert_eq!(heap.header(*obj), hashed(i as u32 + 1));
        }
        tracker.stop_tracking();
    }

    #[test]
    fn test_drain_reuses_block_after_front_drained() {
        let (mut heap, mut tracker) = setup(2, None);
        let old = heap.old();
        tracker.start_tracking();

        let first = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        let second = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        heap.set_header(first, hashed(1));
        heap.set_header(second, hashed(2));
        tracker.track(&mut heap, first).unwrap();
        tracker.track(&mut heap, second).unwrap();

        // The only block is full; each visit of the tail promotes another
        // hashed object, which needs a fresh block once the first is spent.
        let mut order = Vec::new();
        tracker
            .drain(&mut heap, |heap, tracker, obj| {
                order.push(obj);
                if order.len() >= 2 && order.len() < 6 {
                    let next = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
                    heap.set_header(next, hashed(order.len() as u32 + 1));
                    tracker.track(heap, next)?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(order.len(), 6);
        for (i, obj) in order.iter().enumerate() {
            assert_eq!(heap.header(*obj), hashed(i as u32 + 1));
        }
        tracker.stop_tracking();
        assert_eq!(tracker.spool.lock().in_use(), 0);
    }

    #[test]
    fn test_failed_visit_restores_remaining_headers() {
        let (mut heap, mut tracker) = setup(2, None);
        let old = heap.old();
        tracker.start_tracking();

        let a = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        let b = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        let c = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        heap.set_header(a, hashed(1));
        heap.set_header(b, hashed(2));
        for obj in [a, b, c] {
            tracker.track(&mut heap, obj).unwrap();
        }

        let err = tracker
            .drain(&mut heap, |_, _, _| Err(GcError::OutOfMemory { size_words: 1 }))
            .unwrap_err();
        assert_eq!(err, GcError::OutOfMemory { size_words: 1 });

        assert_eq!(heap.header(a), hashed(1));
        assert_eq!(heap.header(b), hashed(2));
        assert_eq!(heap.header(c), MarkWord::PROTOTYPE);
        assert!(tracker.no_promotions());
        assert_eq!(tracker.spool.lock().in_use(), 0);

        tracker.stop_tracking();
        tracker.start_tracking();
        tracker.track(&mut heap, a).unwrap();
        assert_eq!(tracker.drain(&mut heap, |_, _, _| Ok(())).unwrap(), 1);
        assert_eq!(heap.header(a), hashed(1));
    }

    #[test]
    fn test_spool_failure_leaves_header_intact() {
        let (mut heap, mut tracker) = setup(1, Some(1));
        let old = heap.old();
        tracker.start_tracking();

        let a = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        let b = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        heap.set_header(a, hashed(1));
        heap.set_header(b, hashed(2));
        tracker.track(&mut heap, a).unwrap();

        let err = tracker.track(&mut heap, b).unwrap_err();
        assert!(matches!(err, GcError::SpoolExhausted { .. }));
        assert_eq!(heap.header(b), hashed(2));
        assert_eq!(tracker.promoted_objects(&heap), vec![a]);

        tracker.drain(&mut heap, |_, _, _| Ok(())).unwrap();
        assert_eq!(heap.header(a), hashed(1));
    }

    #[test]
    #[should_panic(expected = "outside a promotion cycle")]
    fn test_track_requires_cycle() {
        let (mut heap, mut tracker) = setup(2, None);
        let old = heap.old();
        let obj = heap.allocate_in(old, Shape::new(0, 1)).unwrap();
        let _ = tracker.track(&mut heap, obj);
    }
}
