//! Remembered sets and the generational write barrier
//!
//! Every young region keeps a set of the (region, card) pairs outside the
//! young generation that may hold a reference into it. The barrier records a
//! pair whenever a non-young slot is made to point into young; a young
//! collection scans exactly those cards as extra roots.
//!
//! A source region starts out in the sparse table with up to four cards. When
//! a fifth distinct card arrives, the region moves to a fine-grain card bitmap
//! covering all of its cards and the sparse entry is deleted.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::config::RemSetConfig;
use crate::heap::{CardIndex, Heap, RegionIndex};
use crate::object::{Address, ObjectModel};
use crate::remset_table::AddCardResult;
use crate::retire_list::RetireLists;
use crate::sparse_remset::SparseRemSet;

/// One bit per card of a region
#[derive(Debug, Clone)]
pub struct CardBitmap {
    bits: Vec<u64>,
    cards: usize,
}

impl CardBitmap {
    /// Bitmap for a region of `cards` cards, all clean
    pub fn new(cards: usize) -> Self {
        Self {
            bits: vec![0; cards.div_ceil(64)],
            cards,
        }
    }

    /// Mark a card. Returns whether it was clean.
    pub fn mark_card(&mut self, card: CardIndex) -> bool {
        let card = card as usize;
        assert!(card < self.cards, "card {card} out of range");
        let (word, bit) = (card / 64, 1u64 << (card % 64));
        let clean = self.bits[word] & bit == 0;
        self.bits[word] |= bit;
        clean
    }

    /// Whether a card is marked
    pub fn is_dirty(&self, card: CardIndex) -> bool {
        let card = card as usize;
        card < self.cards && self.bits[card / 64] & (1u64 << (card % 64)) != 0
    }

    /// Marked cards in ascending order
    pub fn dirty_cards(&self) -> impl Iterator<Item = CardIndex> + '_ {
        (0..self.cards)
            .filter(|&card| self.bits[card / 64] & (1u64 << (card % 64)) != 0)
            .map(|card| card as CardIndex)
    }

    /// Number of marked cards
    pub fn dirty_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// How a card was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored in (or already present in) the sparse table
    Sparse(AddCardResult),
    /// Stored in the source region's fine-grain bitmap
    Fine {
        /// Whether the card was newly marked
        newly_marked: bool,
    },
    /// The sparse entry overflowed and the region moved to a bitmap
    Coarsened,
}

/// Remembered set of one young region
#[derive(Debug)]
pub struct RegionRemSet {
    sparse: SparseRemSet,
    fine: FxHashMap<RegionIndex, CardBitmap>,
    cards_per_region: usize,
}

impl RegionRemSet {
    fn new(owner: RegionIndex, config: &RemSetConfig, cards_per_region: usize) -> Self {
        Self {
            sparse: SparseRemSet::new(owner, config.initial_capacity),
            fine: FxHashMap::default(),
            cards_per_region,
        }
    }

    /// Region whose incoming references are recorded
    pub fn owner(&self) -> RegionIndex {
        self.sparse.owner()
    }

    /// Sparse part
    pub fn sparse(&self) -> &SparseRemSet {
        &self.sparse
    }

    fn add_card(&mut self, region: RegionIndex, card: CardIndex, lists: &RetireLists) -> RecordOutcome {
        if let Some(bitmap) = self.fine.get_mut(&region) {
            return RecordOutcome::Fine {
                newly_marked: bitmap.mark_card(card),
            };
        }
        match self.sparse.add_card(region, card, lists) {
            AddCardResult::Overflow => {
                let mut bitmap = CardBitmap::new(self.cards_per_region);
                for stored in self.sparse.get_cards(region).into_iter().flatten() {
                    bitmap.mark_card(stored);
                }
                bitmap.mark_card(card);
                self.sparse.delete_entry(region);
                self.fine.insert(region, bitmap);
                tracing::warn!(
                    target: "otter::gc",
                    owner = self.owner(),
                    source_region = region,
                    "Sparse remembered-set entry overflowed; using card bitmap"
                );
                RecordOutcome::Coarsened
            }
            result => RecordOutcome::Sparse(result),
        }
    }

    /// Whether `card` of `region` is recorded
    pub fn contains_card(&self, region: RegionIndex, card: CardIndex) -> bool {
        match self.fine.get(&region) {
            Some(bitmap) => bitmap.is_dirty(card),
            None => self.sparse.contains_card(region, card),
        }
    }

    /// Recorded cards of `region`, ascending
    pub fn cards_of(&self, region: RegionIndex) -> Vec<CardIndex> {
        let mut cards: Vec<CardIndex> = match self.fine.get(&region) {
            Some(bitmap) => bitmap.dirty_cards().collect(),
            None => self
                .sparse
                .table()
                .entry(region)
                .map(|entry| entry.cards().collect())
                .unwrap_or_default(),
        };
        cards.sort_unstable();
        cards
    }

    /// Call `f(region, card)` for every recorded card
    pub fn for_each_card(&self, f: &mut dyn FnMut(RegionIndex, CardIndex)) {
        for entry in self.sparse.table().iter() {
            for card in entry.cards() {
                f(entry.region(), card);
            }
        }
        for (&region, bitmap) in &self.fine {
            for card in bitmap.dirty_cards() {
                f(region, card);
            }
        }
    }

    /// Number of recorded cards
    pub fn occupied_cards(&self) -> usize {
        self.sparse.table().occupied_cards()
            + self.fine.values().map(CardBitmap::dirty_count).sum::<usize>()
    }

    /// Whether `region` was moved to a bitmap
    pub fn is_coarsened(&self, region: RegionIndex) -> bool {
        self.fine.contains_key(&region)
    }

    fn clear(&mut self, lists: &RetireLists) {
        self.sparse.clear(lists);
        self.fine.clear();
    }
}

/// Remembered sets of every young region plus the shared retire lists
pub struct RememberedSets {
    first_region: RegionIndex,
    sets: Vec<RegionRemSet>,
    lists: RetireLists,
}

impl RememberedSets {
    /// One empty set per region of the young generation
    pub fn new(heap: &Heap, config: &RemSetConfig) -> Self {
        let regions = heap.regions_of(heap.young());
        let cards_per_region = heap.cards_per_region();
        Self {
            first_region: regions.start,
            sets: regions
                .map(|owner| RegionRemSet::new(owner, config, cards_per_region))
                .collect(),
            lists: RetireLists::new(),
        }
    }

    /// Set owned by a young region
    pub fn set(&self, owner: RegionIndex) -> Option<&RegionRemSet> {
        owner
            .checked_sub(self.first_region)
            .and_then(|i| self.sets.get(i as usize))
    }

    /// All sets, lowest region first
    pub fn sets(&self) -> &[RegionRemSet] {
        &self.sets
    }

    /// Shared retire lists
    pub fn lists(&self) -> &RetireLists {
        &self.lists
    }

    /// Record that `card` of `region` may point into `owner`
    pub fn add_card(&mut self, owner: RegionIndex, region: RegionIndex, card: CardIndex) -> RecordOutcome {
        let index = owner
            .checked_sub(self.first_region)
            .map(|i| i as usize)
            .filter(|&i| i < self.sets.len());
        let Some(index) = index else {
            panic!("region {owner} has no remembered set");
        };
        self.sets[index].add_card(region, card, &self.lists)
    }

    /// Cards of `region` recorded in any set, ascending
    pub fn get_cards(&self, region: RegionIndex) -> Vec<CardIndex> {
        let cards: BTreeSet<CardIndex> = self
            .sets
            .iter()
            .flat_map(|set| set.cards_of(region))
            .collect();
        cards.into_iter().collect()
    }

    /// Whether any set records `card` of `region`
    pub fn contains_card(&self, region: RegionIndex, card: CardIndex) -> bool {
        self.sets.iter().any(|set| set.contains_card(region, card))
    }

    /// Distinct (region, card) pairs across every set, ascending
    pub fn remembered_cards(&self) -> Vec<(RegionIndex, CardIndex)> {
        let mut cards = BTreeSet::new();
        for set in &self.sets {
            set.for_each_card(&mut |region, card| {
                cards.insert((region, card));
            });
        }
        cards.into_iter().collect()
    }

    /// Total recorded cards (a card remembered by two sets counts twice)
    pub fn occupied_cards(&self) -> usize {
        self.sets.iter().map(RegionRemSet::occupied_cards).sum()
    }

    /// Post-barrier: remember `slot` if it now points from outside young into young
    pub fn record(&mut self, heap: &Heap, slot: Address, target: Address) -> Option<RecordOutcome> {
        if heap.is_young(slot) || !heap.is_young(target) {
            return None;
        }
        Some(self.add_card(heap.region_of(target), heap.region_of(slot), heap.card_of(slot)))
    }

    /// Forget everything
    pub fn clear(&mut self) {
        for set in &mut self.sets {
            set.clear(&self.lists);
        }
    }

    /// Rebuild from scratch by scanning every non-young generation
    pub fn rebuild(&mut self, heap: &Heap) {
        self.clear();
        let young = heap.young();
        for (id, _) in heap.generations() {
            if id == young {
                continue;
            }
            for obj in heap.objects(id) {
                heap.for_each_pointer(obj, &mut |slot, target| {
                    self.record(heap, slot, target);
                });
            }
        }
        tracing::debug!(
            target: "otter::gc",
            cards = self.occupied_cards(),
            "Remembered sets rebuilt"
        );
    }

    /// Retire reader snapshots of every set that grew, then free every
    /// retired table. Returns the number of tables freed. Idempotent.
    pub fn cleanup(&mut self) -> usize {
        for owner in self.lists.expanded.take_all() {
            if let Some(index) = owner.checked_sub(self.first_region)
                && let Some(set) = self.sets.get_mut(index as usize)
            {
                set.sparse.cleanup(&self.lists);
            }
        }
        let freed = self.lists.drain_deleted();
        if freed > 0 {
            tracing::debug!(target: "otter::gc", freed, "Retired remembered-set tables freed");
        }
        freed
    }
}

/// Store `value` into reference field `field` of `holder` and run the barrier
pub fn write_ref(
    heap: &mut Heap,
    remsets: &mut RememberedSets,
    holder: Address,
    field: usize,
    value: Option<Address>,
) -> Option<RecordOutcome> {
    let slot = heap.field_slot(holder, field);
    heap.store_ref(slot, value);
    value.and_then(|target| remsets.record(heap, slot, target))
}
