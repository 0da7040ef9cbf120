//! Per-region sparse remembered set
//!
//! Each young region owns one set recording which cards of other regions may
//! hold references into it. Mutations go to `next`; when `next` is replaced by
//! a grown copy while a scan may still be reading the previous table, that
//! table is kept as `cur` until the post-cycle cleanup retires it.

use crate::heap::{CardIndex, RegionIndex};
use crate::remset_table::{AddCardResult, CARDS_PER_ENTRY, RsHashTable};
use crate::retire_list::RetireLists;

/// Sparse remembered set of one region
#[derive(Debug)]
pub struct SparseRemSet {
    owner: RegionIndex,
    initial_capacity: usize,
    next: Box<RsHashTable>,
    /// Table in use by readers at the time of the first expansion this cycle
    cur: Option<Box<RsHashTable>>,
    expanded: bool,
}

impl SparseRemSet {
    /// Empty set for `owner`
    pub fn new(owner: RegionIndex, initial_capacity: usize) -> Self {
        Self {
            owner,
            initial_capacity,
            next: Box::new(RsHashTable::new(initial_capacity)),
            cur: None,
            expanded: false,
        }
    }

    /// Region whose incoming references are recorded
    pub fn owner(&self) -> RegionIndex {
        self.owner
    }

    /// Record a card, growing the table when it passes its load factor
    pub fn add_card(
        &mut self,
        region: RegionIndex,
        card: CardIndex,
        lists: &RetireLists,
    ) -> AddCardResult {
        let result = self.next.add_card(region, card);
        if self.next.should_expand() {
            self.expand(lists);
        }
        result
    }

    fn expand(&mut self, lists: &RetireLists) {
        let capacity = self.next.capacity() * 2;
        let grown = Box::new(self.next.rehashed(capacity));
        let last = std::mem::replace(&mut self.next, grown);
        if self.cur.is_none() {
            self.cur = Some(last);
        } else {
            lists.retire(last);
        }
        if !self.expanded {
            self.expanded = true;
            lists.expanded.push(self.owner);
        }
        tracing::debug!(
            target: "otter::gc",
            region = self.owner,
            capacity,
            entries = self.next.occupied_entries(),
            "Remembered set expanded"
        );
    }

    /// Cards recorded for `region`
    pub fn get_cards(&self, region: RegionIndex) -> Option<[CardIndex; CARDS_PER_ENTRY]> {
        self.next.get_cards(region)
    }

    /// Whether `card` of `region` is recorded
    pub fn contains_card(&self, region: RegionIndex, card: CardIndex) -> bool {
        self.next.contains_card(region, card)
    }

    /// Forget `region`
    pub fn delete_entry(&mut self, region: RegionIndex) -> bool {
        self.next.delete_entry(region)
    }

    /// Current table
    pub fn table(&self) -> &RsHashTable {
        &self.next
    }

    /// Table readers started the cycle with
    pub fn in_use(&self) -> &RsHashTable {
        self.cur.as_deref().unwrap_or(&self.next)
    }

    /// Whether the set grew since the last cleanup
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Retire the reader snapshot; readers now use `next`
    pub fn cleanup(&mut self, lists: &RetireLists) {
        if let Some(cur) = self.cur.take() {
            lists.retire(cur);
        }
        self.expanded = false;
    }

    /// Drop every entry and return to the initial capacity
    pub fn clear(&mut self, lists: &RetireLists) {
        if let Some(cur) = self.cur.take() {
            lists.retire(cur);
        }
        if self.next.capacity() == self.initial_capacity {
            self.next.clear();
        } else {
            let last = std::mem::replace(
                &mut self.next,
                Box::new(RsHashTable::new(self.initial_capacity)),
            );
            lists.retire(last);
        }
        // a pending entry on the expanded list is harmless; cleanup of a set
        // without a snapshot is a no-op
        self.expanded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_keeps_cards() {
        let lists = RetireLists::new();
        let mut set = SparseRemSet::new(7, 8);
        for region in 0..5u32 {
            assert_eq!(set.add_card(region, region + 1, &lists), AddCardResult::Added);
        }
        assert_eq!(set.table().capacity(), 16);
        assert!(set.is_expanded());
        for region in 0..5u32 {
            assert!(set.contains_card(region, region + 1));
        }
        // readers still see the pre-growth table
        assert_eq!(set.in_use().capacity(), 8);
        assert_eq!(lists.expanded.take_all(), vec![7]);
    }

    #[test]
    fn test_second_growth_retires_intermediate_table() {
        let lists = RetireLists::new();
        let mut set = SparseRemSet::new(0, 4);
        for region in 0..9u32 {
            set.add_card(region, 0, &lists);
        }
        // 4 -> 8 -> 16 -> 32: first old table is the snapshot, the rest retire
        assert_eq!(set.table().capacity(), 32);
        assert_eq!(set.in_use().capacity(), 4);
        assert_eq!(lists.deleted.len(), 2);
        // registered once per cycle
        assert_eq!(lists.expanded.len(), 1);
    }

    #[test]
    fn test_cleanup_promotes_next() {
        let lists = RetireLists::new();
        let mut set = SparseRemSet::new(1, 8);
        for region in 0..5u32 {
            set.add_card(region, 3, &lists);
        }
        set.cleanup(&lists);
        assert!(!set.is_expanded());
        assert_eq!(set.in_use().capacity(), 16);
        assert_eq!(lists.drain_deleted(), 1);

        set.cleanup(&lists);
        assert_eq!(lists.drain_deleted(), 0);
        assert_eq!(set.in_use().capacity(), 16);
    }

    #[test]
    fn test_clear_resets_capacity() {
        let lists = RetireLists::new();
        let mut set = SparseRemSet::new(1, 8);
        for region in 0..5u32 {
            set.add_card(region, 3, &lists);
        }
        set.clear(&lists);
        assert_eq!(set.table().capacity(), 8);
        assert_eq!(set.table().occupied_entries(), 0);
        assert_eq!(set.get_cards(2), None);
    }
}
