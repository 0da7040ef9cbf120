//! Sparse remembered-set hash table
//!
//! Maps a source region to at most [`CARDS_PER_ENTRY`] cards. Entries live in
//! a flat array; buckets and collision chains link entries by index, and freed
//! entries are threaded onto an index-based free list through the same `next`
//! field, so the table can be copied or relocated without fixing up pointers.
//!
//! ```text
//! buckets: [ 3 | NULL | 0 | ... ]          region & (capacity - 1)
//!             │          │
//! entries: [ {r=2, cards, next=NULL} | ... | {r=10, cards, next=...} ]
//! ```

use crate::error::guarantee;
use crate::heap::{CardIndex, RegionIndex};

/// Inline card slots per entry
pub const CARDS_PER_ENTRY: usize = 4;

/// Sentinel for an unused card slot
pub const NULL_CARD: CardIndex = CardIndex::MAX;

/// Index of an entry in the entry array
pub type EntryIndex = u32;

/// Sentinel for "no entry"
pub const NULL_ENTRY: EntryIndex = EntryIndex::MAX;

const NULL_REGION: RegionIndex = RegionIndex::MAX;

/// Outcome of adding a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddCardResult {
    /// The card was stored
    Added,
    /// The card was already present
    Found,
    /// The region's entry already holds its maximum number of cards
    Overflow,
}

/// One region's cards
#[derive(Debug, Clone, Copy)]
pub struct RsEntry {
    region: RegionIndex,
    cards: [CardIndex; CARDS_PER_ENTRY],
    next: EntryIndex,
}

impl RsEntry {
    const FREE: RsEntry = RsEntry {
        region: NULL_REGION,
        cards: [NULL_CARD; CARDS_PER_ENTRY],
        next: NULL_ENTRY,
    };

    fn init(&mut self, region: RegionIndex) {
        self.region = region;
        self.cards = [NULL_CARD; CARDS_PER_ENTRY];
        self.next = NULL_ENTRY;
    }

    /// Source region
    pub fn region(&self) -> RegionIndex {
        self.region
    }

    /// Whether the entry is in use
    pub fn is_valid(&self) -> bool {
        self.region != NULL_REGION
    }

    /// Stored cards, sentinels included
    pub fn raw_cards(&self) -> &[CardIndex; CARDS_PER_ENTRY] {
        &self.cards
    }

    /// Stored cards without sentinels
    pub fn cards(&self) -> impl Iterator<Item = CardIndex> + '_ {
        self.cards.iter().copied().filter(|&c| c != NULL_CARD)
    }

    /// Number of non-sentinel card slots
    pub fn num_valid_cards(&self) -> usize {
        self.cards().count()
    }

    /// Whether `card` is stored
    pub fn contains_card(&self, card: CardIndex) -> bool {
        self.cards.contains(&card)
    }

    fn add_card(&mut self, card: CardIndex) -> AddCardResult {
        for slot in &mut self.cards {
            if *slot == card {
                return AddCardResult::Found;
            }
            if *slot == NULL_CARD {
                *slot = card;
                return AddCardResult::Added;
            }
        }
        AddCardResult::Overflow
    }
}

/// Open-chained table from source region to cards
#[derive(Debug, Clone)]
pub struct RsHashTable {
    entries: Vec<RsEntry>,
    buckets: Vec<EntryIndex>,
    occupied_entries: usize,
    occupied_cards: usize,
    /// Recycled entries, linked through `next`
    free_list: EntryIndex,
    /// First entry never handed out
    free_region: EntryIndex,
}

impl RsHashTable {
    /// Create an empty table; `capacity` must be a power of two
    pub fn new(capacity: usize) -> Self {
        guarantee!(
            capacity.is_power_of_two(),
            "remembered-set capacity {} is not a power of two",
            capacity
        );
        Self {
            entries: vec![RsEntry::FREE; capacity],
            buckets: vec![NULL_ENTRY; capacity],
            occupied_entries: 0,
            occupied_cards: 0,
            free_list: NULL_ENTRY,
            free_region: 0,
        }
    }

    /// Number of entries (and buckets)
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Entries in use
    pub fn occupied_entries(&self) -> usize {
        self.occupied_entries
    }

    /// Cards stored across all entries
    pub fn occupied_cards(&self) -> usize {
        self.occupied_cards
    }

    /// Whether the table is past its load factor
    pub fn should_expand(&self) -> bool {
        self.occupied_entries * 2 > self.capacity()
    }

    #[inline]
    fn bucket_of(&self, region: RegionIndex) -> usize {
        region as usize & (self.capacity() - 1)
    }

    fn entry_index(&self, region: RegionIndex) -> Option<EntryIndex> {
        let mut cursor = self.buckets[self.bucket_of(region)];
        while cursor != NULL_ENTRY {
            let entry = &self.entries[cursor as usize];
            if entry.region == region {
                return Some(cursor);
            }
            cursor = entry.next;
        }
        None
    }

    /// Entry for `region`, if present
    pub fn entry(&self, region: RegionIndex) -> Option<&RsEntry> {
        self.entry_index(region).map(|i| &self.entries[i as usize])
    }

    fn alloc_entry(&mut self) -> EntryIndex {
        if self.free_list != NULL_ENTRY {
            let index = self.free_list;
            self.free_list = self.entries[index as usize].next;
            return index;
        }
        guarantee!(
            (self.free_region as usize) < self.capacity(),
            "remembered-set table full: {} of {} entries occupied",
            self.occupied_entries,
            self.capacity()
        );
        let index = self.free_region;
        self.free_region += 1;
        index
    }

    fn free_entry(&mut self, index: EntryIndex) {
        let entry = &mut self.entries[index as usize];
        *entry = RsEntry::FREE;
        entry.next = self.free_list;
        self.free_list = index;
    }

    /// Look up the entry for `region`, allocating it at the bucket head if absent
    pub(crate) fn entry_for_region_create(&mut self, region: RegionIndex) -> EntryIndex {
        if let Some(index) = self.entry_index(region) {
            return index;
        }
        let index = self.alloc_entry();
        let bucket = self.bucket_of(region);
        let entry = &mut self.entries[index as usize];
        entry.init(region);
        entry.next = self.buckets[bucket];
        self.buckets[bucket] = index;
        self.occupied_entries += 1;
        guarantee!(
            self.occupied_entries <= self.capacity(),
            "occupied entries {} exceed capacity {}",
            self.occupied_entries,
            self.capacity()
        );
        index
    }

    /// Record `card` for `region`
    pub fn add_card(&mut self, region: RegionIndex, card: CardIndex) -> AddCardResult {
        guarantee!(
            region != NULL_REGION && card != NULL_CARD,
            "sentinel region/card passed to add_card"
        );
        let index = self.entry_for_region_create(region);
        let result = self.entries[index as usize].add_card(card);
        if result == AddCardResult::Added {
            self.occupied_cards += 1;
        }
        result
    }

    /// Cards recorded for `region`, sentinel-padded
    pub fn get_cards(&self, region: RegionIndex) -> Option<[CardIndex; CARDS_PER_ENTRY]> {
        self.entry(region).map(|entry| entry.cards)
    }

    /// Whether `card` is recorded for `region`
    pub fn contains_card(&self, region: RegionIndex, card: CardIndex) -> bool {
        self.entry(region).is_some_and(|entry| entry.contains_card(card))
    }

    /// Unlink and free the entry for `region`. Returns whether it existed.
    pub fn delete_entry(&mut self, region: RegionIndex) -> bool {
        let bucket = self.bucket_of(region);
        let mut prev = NULL_ENTRY;
        let mut cursor = self.buckets[bucket];
        while cursor != NULL_ENTRY {
            let entry = self.entries[cursor as usize];
            if entry.region == region {
                if prev == NULL_ENTRY {
                    self.buckets[bucket] = entry.next;
                } else {
                    self.entries[prev as usize].next = entry.next;
                }
                self.occupied_cards -= entry.num_valid_cards();
                self.occupied_entries -= 1;
                self.free_entry(cursor);
                return true;
            }
            prev = cursor;
            cursor = entry.next;
        }
        false
    }

    /// Copy of this table at `capacity`, with every valid entry reinserted
    pub fn rehashed(&self, capacity: usize) -> RsHashTable {
        let mut table = RsHashTable::new(capacity);
        for entry in self.iter() {
            let index = table.entry_for_region_create(entry.region);
            table.entries[index as usize].cards = entry.cards;
            table.occupied_cards += entry.num_valid_cards();
        }
        guarantee!(
            table.occupied_cards == self.occupied_cards
                && table.occupied_entries == self.occupied_entries,
            "rehash lost entries: {}/{} -> {}/{}",
            self.occupied_entries,
            self.occupied_cards,
            table.occupied_entries,
            table.occupied_cards
        );
        table
    }

    /// Valid entries in array order
    pub fn iter(&self) -> impl Iterator<Item = &RsEntry> {
        self.entries.iter().filter(|entry| entry.is_valid())
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.fill(RsEntry::FREE);
        self.buckets.fill(NULL_ENTRY);
        self.occupied_entries = 0;
        self.occupied_cards = 0;
        self.free_list = NULL_ENTRY;
        self.free_region = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(table: &RsHashTable) {
        assert!(table.occupied_entries() <= table.capacity());
        assert!(table.occupied_cards() <= table.occupied_entries() * CARDS_PER_ENTRY);
        let counted: usize = table.iter().map(RsEntry::num_valid_cards).sum();
        assert_eq!(counted, table.occupied_cards());
        assert_eq!(table.iter().count(), table.occupied_entries());
    }

    #[test]
    fn test_fill_entry_then_overflow() {
        let mut table = RsHashTable::new(8);
        for card in [10, 20, 30, 40] {
            assert_eq!(table.add_card(3, card), AddCardResult::Added);
        }
        assert_eq!(table.add_card(3, 50), AddCardResult::Overflow);
        assert_eq!(table.occupied_cards(), 4);
        assert_eq!(table.occupied_entries(), 1);
        assert_eq!(table.get_cards(3), Some([10, 20, 30, 40]));
        assert!(!table.contains_card(3, 50));
        check_invariants(&table);
    }

    #[test]
    fn test_duplicate_card_found() {
        let mut table = RsHashTable::new(8);
        assert_eq!(table.add_card(1, 7), AddCardResult::Added);
        assert_eq!(table.add_card(1, 7), AddCardResult::Found);
        assert_eq!(table.occupied_cards(), 1);
        assert!(table.contains_card(1, 7));
        assert_eq!(table.get_cards(2), None);
    }

    #[test]
    fn test_chained_regions_share_bucket() {
        let mut table = RsHashTable::new(8);
        // 1, 9 and 17 all hash to bucket 1
        table.add_card(1, 0);
        table.add_card(9, 1);
        table.add_card(17, 2);
        assert!(table.contains_card(1, 0));
        assert!(table.contains_card(9, 1));
        assert!(table.contains_card(17, 2));

        assert!(table.delete_entry(9));
        assert!(!table.delete_entry(9));
        assert!(table.contains_card(1, 0));
        assert!(table.contains_card(17, 2));
        assert_eq!(table.occupied_entries(), 2);
        check_invariants(&table);
    }

    #[test]
    fn test_free_list_reuses_entries() {
        let mut table = RsHashTable::new(4);
        for region in 0..4 {
            table.add_card(region, region);
        }
        assert!(table.delete_entry(2));
        assert!(table.delete_entry(0));
        // Both freed slots come back before the table would report full
        table.add_card(100, 1);
        table.add_card(200, 2);
        assert_eq!(table.occupied_entries(), 4);
        assert!(table.contains_card(100, 1));
        assert!(table.contains_card(200, 2));
        check_invariants(&table);
    }

    #[test]
    fn test_rehash_preserves_cards() {
        let mut table = RsHashTable::new(8);
        for region in 0..4u32 {
            for card in 0..=region {
                table.add_card(region * 8, card);
            }
        }
        let grown = table.rehashed(16);
        assert_eq!(grown.capacity(), 16);
        for region in 0..4u32 {
            for card in 0..=region {
                assert!(grown.contains_card(region * 8, card));
            }
        }
        check_invariants(&grown);
    }

    #[test]
    #[should_panic(expected = "table full")]
    fn test_full_table_is_fatal() {
        let mut table = RsHashTable::new(2);
        table.add_card(0, 0);
        table.add_card(1, 0);
        table.add_card(2, 0);
    }
}
