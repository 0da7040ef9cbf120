//! GC Heap management
//!
//! The heap is a single word arena partitioned into generations. Each
//! generation is a contiguous `[bottom, top, end)` range with bump
//! allocation; the arena is also divided into fixed-size regions, and each
//! region into cards, for remembered-set bookkeeping.

use std::ops::Range;

use crate::config::HeapLayout;
use crate::error::{GcError, GcResult, guarantee};
use crate::object::{
    Address, MANGLE_PATTERN, MarkWord, OBJECT_HEADER_WORDS, ObjectModel, PointerSlots, Shape, Word,
};

/// Region number within the heap
pub type RegionIndex = u32;

/// Card number within a region
pub type CardIndex = u32;

/// Role a generation plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationRole {
    /// Newly allocated objects
    Young,
    /// Objects that survived a young collection
    Old,
    /// Long-lived runtime metadata
    Permanent,
}

/// Index of a generation in layout (and compaction walk) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(pub usize);

/// A contiguous generation
#[derive(Debug, Clone)]
pub struct Generation {
    role: GenerationRole,
    bottom: Address,
    top: Address,
    end: Address,
    destinations: Vec<GenerationId>,
}

impl Generation {
    /// Role of this generation
    pub fn role(&self) -> GenerationRole {
        self.role
    }

    /// First word
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    /// Allocation frontier
    pub fn top(&self) -> Address {
        self.top
    }

    /// One past the last word
    pub fn end(&self) -> Address {
        self.end
    }

    /// Move the allocation frontier
    pub fn set_top(&mut self, top: Address) {
        guarantee!(
            top >= self.bottom && top <= self.end,
            "{:?} top {:?} outside [{:?}, {:?}]",
            self.role,
            top,
            self.bottom,
            self.end
        );
        self.top = top;
    }

    /// Compaction destinations, in the order they are tried
    pub fn destinations(&self) -> &[GenerationId] {
        &self.destinations
    }

    /// Words between bottom and top
    pub fn used_words(&self) -> usize {
        self.bottom.words_until(self.top)
    }

    /// Words between top and end
    pub fn free_words(&self) -> usize {
        self.top.words_until(self.end)
    }

    /// Total capacity in words
    pub fn capacity_words(&self) -> usize {
        self.bottom.words_until(self.end)
    }

    /// Whether `addr` lies within the reserved range
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Whether `addr` lies within the allocated range
    pub fn is_allocated(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.top
    }
}

/// Word-addressed generational heap
pub struct Heap {
    words: Vec<Word>,
    generations: Vec<Generation>,
    region_words: usize,
    card_words: usize,
    mangle: bool,
}

impl Heap {
    /// Lay out a heap. `layout` must already be validated.
    pub fn new(layout: &HeapLayout, mangle: bool) -> Self {
        let total: usize = layout.generations.iter().map(|g| g.capacity_words).sum();
        let fill = if mangle {
            Word::Raw(MANGLE_PATTERN)
        } else {
            Word::Raw(0)
        };

        let mut generations = Vec::with_capacity(layout.generations.len());
        let mut cursor = 0;
        for spec in &layout.generations {
            let bottom = Address(cursor);
            cursor += spec.capacity_words;
            let destinations = spec
                .destinations
                .iter()
                .filter_map(|role| layout.generations.iter().position(|g| g.role == *role))
                .map(GenerationId)
                .collect();
            generations.push(Generation {
                role: spec.role,
                bottom,
                top: bottom,
                end: Address(cursor),
                destinations,
            });
        }

        Self {
            words: vec![fill; total],
            generations,
            region_words: layout.region_words,
            card_words: layout.card_words,
            mangle,
        }
    }

    // ---------------------------------------------------------------
    // Generations
    // ---------------------------------------------------------------

    /// All generations in layout order
    pub fn generations(&self) -> impl Iterator<Item = (GenerationId, &Generation)> {
        self.generations
            .iter()
            .enumerate()
            .map(|(i, g)| (GenerationId(i), g))
    }

    /// Number of generations
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Generation by id
    pub fn generation(&self, id: GenerationId) -> &Generation {
        &self.generations[id.0]
    }

    /// Mutable generation by id
    pub fn generation_mut(&mut self, id: GenerationId) -> &mut Generation {
        &mut self.generations[id.0]
    }

    /// Generation with the given role
    pub fn generation_id(&self, role: GenerationRole) -> Option<GenerationId> {
        self.generations
            .iter()
            .position(|g| g.role == role)
            .map(GenerationId)
    }

    /// The young generation
    pub fn young(&self) -> GenerationId {
        self.generation_id(GenerationRole::Young)
            .unwrap_or_else(|| panic!("heap layout has no young generation"))
    }

    /// The old generation
    pub fn old(&self) -> GenerationId {
        self.generation_id(GenerationRole::Old)
            .unwrap_or_else(|| panic!("heap layout has no old generation"))
    }

    /// Generation containing `addr`
    pub fn generation_of(&self, addr: Address) -> Option<GenerationId> {
        self.generations
            .iter()
            .position(|g| g.contains(addr))
            .map(GenerationId)
    }

    /// Whether `addr` is in the young generation
    pub fn is_young(&self, addr: Address) -> bool {
        self.generation(self.young()).contains(addr)
    }

    /// Total allocated words across generations
    pub fn used_words(&self) -> usize {
        self.generations.iter().map(Generation::used_words).sum()
    }

    /// Total capacity in words
    pub fn capacity_words(&self) -> usize {
        self.words.len()
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Reserve `size` words at the top of a generation without initializing them
    pub fn allocate_raw(&mut self, id: GenerationId, size: usize) -> Option<Address> {
        let generation = &mut self.generations[id.0];
        if generation.free_words() < size {
            return None;
        }
        let addr = generation.top;
        generation.top = addr.offset(size);
        Some(addr)
    }

    /// Allocate and initialize an object in a generation
    pub fn allocate_in(&mut self, id: GenerationId, shape: Shape) -> Option<Address> {
        guarantee!(shape.is_valid(), "invalid shape {:?}", shape);
        let addr = self.allocate_raw(id, shape.size())?;
        self.init_object(addr, shape);
        Some(addr)
    }

    fn init_object(&mut self, addr: Address, shape: Shape) {
        let start = addr.index();
        let refs_end = start + OBJECT_HEADER_WORDS + shape.ref_fields as usize;
        self.words[start] = Word::Header(MarkWord::PROTOTYPE);
        self.words[start + 1] = Word::Shape(shape);
        self.words[start + OBJECT_HEADER_WORDS..refs_end].fill(Word::Ref(None));
        self.words[refs_end..start + shape.size()].fill(Word::Raw(0));
    }

    /// Write a reference-free filler object over `[addr, addr + size)`
    pub fn fill_with_dead_object(&mut self, addr: Address, size: usize) {
        guarantee!(
            size >= OBJECT_HEADER_WORDS,
            "filler of {} words at {:?} is too small",
            size,
            addr
        );
        self.init_object(addr, Shape::filler(size));
    }

    /// Copy `len` words from `from` to `to`; the ranges may overlap
    pub fn copy_words(&mut self, from: Address, to: Address, len: usize) {
        self.words
            .copy_within(from.index()..from.index() + len, to.index());
    }

    /// Overwrite reclaimed memory when mangling is enabled
    pub fn mangle(&mut self, range: Range<Address>) {
        if self.mangle && range.start < range.end {
            self.words[range.start.index()..range.end.index()].fill(Word::Raw(MANGLE_PATTERN));
        }
    }

    // ---------------------------------------------------------------
    // Word access
    // ---------------------------------------------------------------

    /// Read a raw heap word
    pub fn word(&self, addr: Address) -> Word {
        self.words[addr.index()]
    }

    /// Object shape
    pub fn shape(&self, obj: Address) -> Shape {
        match self.words[obj.index() + 1] {
            Word::Shape(shape) => shape,
            other => panic!("no shape word after object at {obj:?}: {other:?}"),
        }
    }

    /// Read payload word `index` (0-based, after the reference slots)
    pub fn raw(&self, obj: Address, index: usize) -> u64 {
        match self.words[self.payload_index(obj, index)] {
            Word::Raw(value) => value,
            other => panic!("payload word {index} of {obj:?} is {other:?}"),
        }
    }

    /// Write payload word `index`
    pub fn set_raw(&mut self, obj: Address, index: usize, value: u64) {
        let at = self.payload_index(obj, index);
        self.words[at] = Word::Raw(value);
    }

    fn payload_index(&self, obj: Address, index: usize) -> usize {
        let shape = self.shape(obj);
        let at = OBJECT_HEADER_WORDS + shape.ref_fields as usize + index;
        assert!(at < shape.size(), "payload index {index} out of bounds for {obj:?}");
        obj.index() + at
    }

    /// Address of reference field `field` of `obj`
    pub fn field_slot(&self, obj: Address, field: usize) -> Address {
        let shape = self.shape(obj);
        assert!(
            field < shape.ref_fields as usize,
            "reference field {field} out of bounds for {obj:?}"
        );
        obj.offset(OBJECT_HEADER_WORDS + field)
    }

    // ---------------------------------------------------------------
    // Region / card geometry
    // ---------------------------------------------------------------

    /// Region size in words
    pub fn region_words(&self) -> usize {
        self.region_words
    }

    /// Card size in words
    pub fn card_words(&self) -> usize {
        self.card_words
    }

    /// Cards per region
    pub fn cards_per_region(&self) -> usize {
        self.region_words / self.card_words
    }

    /// Region containing `addr`
    pub fn region_of(&self, addr: Address) -> RegionIndex {
        (addr.index() / self.region_words) as RegionIndex
    }

    /// Card of `addr`, relative to its region
    pub fn card_of(&self, addr: Address) -> CardIndex {
        ((addr.index() % self.region_words) / self.card_words) as CardIndex
    }

    /// Address range covered by a region
    pub fn region_range(&self, region: RegionIndex) -> Range<Address> {
        let start = region as usize * self.region_words;
        Address(start)..Address(start + self.region_words)
    }

    /// Address range covered by a card
    pub fn card_range(&self, region: RegionIndex, card: CardIndex) -> Range<Address> {
        let start = region as usize * self.region_words + card as usize * self.card_words;
        Address(start)..Address(start + self.card_words)
    }

    /// Regions covering a generation
    pub fn regions_of(&self, id: GenerationId) -> Range<RegionIndex> {
        let generation = self.generation(id);
        self.region_of(generation.bottom)..self.region_of(generation.end)
    }

    // ---------------------------------------------------------------
    // Walking
    // ---------------------------------------------------------------

    /// Objects of a generation from bottom to top. The generation must be parseable.
    pub fn objects(&self, id: GenerationId) -> ObjectWalk<'_> {
        let generation = self.generation(id);
        ObjectWalk {
            heap: self,
            cursor: generation.bottom,
            limit: generation.top,
        }
    }

    /// Check that every object outside a pause has a quiescent header and
    /// every reference lands on an object start.
    ///
    /// Inconsistencies are reported as [`GcError::HeapCorrupted`]; a
    /// generation that does not parse at all still panics during the walk.
    pub fn verify(&self) -> GcResult<()> {
        let mut starts = rustc_hash::FxHashSet::default();
        for (id, _) in self.generations() {
            for obj in self.objects(id) {
                let header = self.header(obj);
                if !header.is_quiescent() {
                    return Err(GcError::HeapCorrupted(format!(
                        "object {obj:?} has non-quiescent header {header:?}"
                    )));
                }
                starts.insert(obj);
            }
        }
        for (id, _) in self.generations() {
            for obj in self.objects(id) {
                let mut dangling = None;
                self.for_each_pointer(obj, &mut |slot, target| {
                    if dangling.is_none() && !starts.contains(&target) {
                        dangling = Some((slot, target));
                    }
                });
                if let Some((slot, target)) = dangling {
                    return Err(GcError::HeapCorrupted(format!(
                        "slot {slot:?} of {obj:?} points at {target:?}, which is not an object"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ObjectModel for Heap {
    fn header(&self, obj: Address) -> MarkWord {
        match self.words[obj.index()] {
            Word::Header(mark) => mark,
            other => panic!("no object header at {obj:?}: {other:?}"),
        }
    }

    fn set_header(&mut self, obj: Address, mark: MarkWord) {
        self.words[obj.index()] = Word::Header(mark);
    }

    fn size(&self, obj: Address) -> usize {
        self.shape(obj).size()
    }

    fn pointer_slots(&self, obj: Address) -> PointerSlots {
        PointerSlots::new(obj, self.shape(obj).ref_fields as usize)
    }

    fn load_ref(&self, slot: Address) -> Option<Address> {
        match self.words[slot.index()] {
            Word::Ref(value) => value,
            other => panic!("slot {slot:?} is not a reference: {other:?}"),
        }
    }

    fn store_ref(&mut self, slot: Address, value: Option<Address>) {
        guarantee!(
            matches!(self.words[slot.index()], Word::Ref(_)),
            "store into non-reference word {:?}",
            slot
        );
        self.words[slot.index()] = Word::Ref(value);
    }
}

/// Iterator over the objects of a parseable generation
pub struct ObjectWalk<'a> {
    heap: &'a Heap,
    cursor: Address,
    limit: Address,
}

impl Iterator for ObjectWalk<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.cursor >= self.limit {
            return None;
        }
        let obj = self.cursor;
        self.cursor = obj.offset(self.heap.size(obj));
        Some(obj)
    }
}
