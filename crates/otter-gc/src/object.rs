//! GC object layout
//!
//! Every object occupies a contiguous run of heap words:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ word 0: Header(MarkWord)     │  phase-dependent meaning
//! │ word 1: Shape                │  size in words + reference count
//! │ word 2..: Ref × ref_fields   │  traced slots
//! │ ...:     Raw × rest          │  untraced payload
//! └──────────────────────────────┘
//! ```
//!
//! The header is an explicit tagged union. Outside a pause only the quiescent
//! variants (`Neutral`, `Locked`) appear; the collector temporarily replaces
//! them with `Marked`, `Forwarded`, `DeadSpan` or `Promoted`, and exactly one
//! interpretation is valid at any moment.

use std::fmt;
use std::ops::Range;

/// Words taken by the header and shape
pub const OBJECT_HEADER_WORDS: usize = 2;

/// Payload written over freed memory when mangling is enabled
pub const MANGLE_PATTERN: u64 = 0xBAAD_BABE_DEAD_BEEF;

/// Word index into the heap arena
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub usize);

impl Address {
    /// Address `words` words past this one
    #[inline]
    pub const fn offset(self, words: usize) -> Address {
        Address(self.0 + words)
    }

    /// Distance in words from `self` up to `end`
    #[inline]
    pub const fn words_until(self, end: Address) -> usize {
        end.0 - self.0
    }

    /// Raw word index
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Object header ("mark word")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkWord {
    /// Unlocked object, optionally carrying an identity hash and an age
    Neutral {
        /// Identity hash (0 = not yet hashed)
        hash: u32,
        /// Number of young collections survived
        age: u8,
    },
    /// Object locked by a mutator thread
    Locked {
        /// Owning thread id
        owner: u32,
    },
    /// Reached during the mark phase of a full collection
    Marked,
    /// Relocated; the body now lives at the given address (or will after compaction)
    Forwarded(Address),
    /// First words of a dead run; the next live object starts at `next_live`
    DeadSpan {
        /// Start of the next live object (or the generation's top)
        next_live: Address,
    },
    /// Linked into the promotion tracker's list
    Promoted {
        /// Next promoted object
        next: Option<Address>,
        /// Whether the real header was saved to the spool
        spooled: bool,
    },
}

impl MarkWord {
    /// Header of a freshly allocated object
    pub const PROTOTYPE: MarkWord = MarkWord::Neutral { hash: 0, age: 0 };

    /// Whether this is a mutator-visible header (not GC bookkeeping)
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        matches!(self, MarkWord::Neutral { .. } | MarkWord::Locked { .. })
    }

    /// Whether overwriting this header would lose information
    #[inline]
    pub fn must_be_preserved(&self) -> bool {
        self.is_quiescent() && *self != Self::PROTOTYPE
    }

    /// Whether the mark phase reached this object
    #[inline]
    pub fn is_marked(&self) -> bool {
        matches!(self, MarkWord::Marked)
    }

    /// Forwarding destination, if any
    #[inline]
    pub fn forwardee(&self) -> Option<Address> {
        match *self {
            MarkWord::Forwarded(to) => Some(to),
            _ => None,
        }
    }

    /// Whether the object is currently linked into a promotion list
    #[inline]
    pub fn is_promoted(&self) -> bool {
        matches!(self, MarkWord::Promoted { .. })
    }
}

impl Default for MarkWord {
    fn default() -> Self {
        Self::PROTOTYPE
    }
}

/// Object size and layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// Total size in words, header included
    pub size_words: u32,
    /// Number of reference slots following the shape word
    pub ref_fields: u32,
}

impl Shape {
    /// Shape with `ref_fields` references followed by `raw_words` of payload
    pub const fn new(ref_fields: u32, raw_words: u32) -> Self {
        Self {
            size_words: OBJECT_HEADER_WORDS as u32 + ref_fields + raw_words,
            ref_fields,
        }
    }

    /// Reference-free object covering `size_words` (used for dead-space fillers)
    pub const fn filler(size_words: usize) -> Self {
        Self {
            size_words: size_words as u32,
            ref_fields: 0,
        }
    }

    /// Total size in words
    #[inline]
    pub fn size(&self) -> usize {
        self.size_words as usize
    }

    /// Whether the layout is self-consistent
    pub fn is_valid(&self) -> bool {
        let size = self.size();
        size >= OBJECT_HEADER_WORDS && OBJECT_HEADER_WORDS + self.ref_fields as usize <= size
    }
}

/// One heap word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    /// Object header
    Header(MarkWord),
    /// Object shape (always directly after the header)
    Shape(Shape),
    /// Reference slot
    Ref(Option<Address>),
    /// Untraced payload
    Raw(u64),
}

impl Default for Word {
    fn default() -> Self {
        Word::Raw(0)
    }
}

/// Object-model capability the collector needs from the heap
pub trait ObjectModel {
    /// Read an object's header
    fn header(&self, obj: Address) -> MarkWord;

    /// Overwrite an object's header
    fn set_header(&mut self, obj: Address, mark: MarkWord);

    /// Object size in words
    fn size(&self, obj: Address) -> usize;

    /// Addresses of the object's reference slots
    fn pointer_slots(&self, obj: Address) -> PointerSlots;

    /// Read a reference slot
    fn load_ref(&self, slot: Address) -> Option<Address>;

    /// Write a reference slot
    fn store_ref(&mut self, slot: Address, value: Option<Address>);

    /// Call `f(slot, target)` for every non-null reference in the object
    fn for_each_pointer(&self, obj: Address, f: &mut dyn FnMut(Address, Address)) {
        for slot in self.pointer_slots(obj) {
            if let Some(target) = self.load_ref(slot) {
                f(slot, target);
            }
        }
    }
}

/// Iterator over an object's reference slot addresses.
///
/// Holds no borrow of the heap, so slots can be rewritten while iterating.
#[derive(Debug, Clone)]
pub struct PointerSlots(Range<usize>);

impl PointerSlots {
    /// Slots of an object at `obj` with `ref_fields` references
    pub fn new(obj: Address, ref_fields: usize) -> Self {
        let first = obj.0 + OBJECT_HEADER_WORDS;
        Self(first..first + ref_fields)
    }
}

impl Iterator for PointerSlots {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        self.0.next().map(Address)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl ExactSizeIterator for PointerSlots {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prototype_not_preserved() {
        assert!(!MarkWord::PROTOTYPE.must_be_preserved());
        assert!(MarkWord::Neutral { hash: 7, age: 0 }.must_be_preserved());
        assert!(MarkWord::Locked { owner: 1 }.must_be_preserved());
        assert!(!MarkWord::Marked.must_be_preserved());
        assert!(!MarkWord::Forwarded(Address(4)).must_be_preserved());
    }

    #[test]
    fn test_forwardee() {
        assert_eq!(MarkWord::Forwarded(Address(12)).forwardee(), Some(Address(12)));
        assert_eq!(MarkWord::Marked.forwardee(), None);
    }

    #[test]
    fn test_shape_layout() {
        let shape = Shape::new(3, 4);
        assert_eq!(shape.size(), 9);
        assert!(shape.is_valid());

        let bogus = Shape {
            size_words: 3,
            ref_fields: 2,
        };
        assert!(!bogus.is_valid());
    }

    #[test]
    fn test_pointer_slots() {
        let slots: Vec<_> = PointerSlots::new(Address(10), 3).collect();
        assert_eq!(slots, vec![Address(12), Address(13), Address(14)]);
    }
}
