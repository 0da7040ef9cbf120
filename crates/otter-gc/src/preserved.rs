//! Preserved marks
//!
//! Headers that carry information beyond the prototype (identity hash, lock
//! owner, age) are saved here before the collector repurposes the header
//! word, and written back once the header is free again.

use crate::error::guarantee;
use crate::object::{Address, MarkWord, ObjectModel};

/// Saved `(object, header)` pairs
#[derive(Debug, Default)]
pub struct PreservedMarks {
    marks: Vec<(Address, MarkWord)>,
}

impl PreservedMarks {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Save `mark` for `obj`
    pub fn push(&mut self, obj: Address, mark: MarkWord) {
        guarantee!(
            mark.must_be_preserved(),
            "preserving header {:?} of {:?} that the prototype can rebuild",
            mark,
            obj
        );
        self.marks.push((obj, mark));
    }

    /// Saved entries
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Whether nothing is saved
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Rewrite every saved address, e.g. to the object's post-compaction location
    pub fn adjust(&mut self, mut f: impl FnMut(Address) -> Address) {
        for (obj, _) in &mut self.marks {
            *obj = f(*obj);
        }
    }

    /// Write every saved header back and empty the stack
    pub fn restore<H: ObjectModel>(&mut self, heap: &mut H) -> usize {
        let restored = self.marks.len();
        for (obj, mark) in self.marks.drain(..) {
            heap.set_header(obj, mark);
        }
        restored
    }

    /// Saved header for `obj`, if any
    pub fn find(&self, obj: Address) -> Option<MarkWord> {
        self.marks
            .iter()
            .find(|(saved, _)| *saved == obj)
            .map(|(_, mark)| *mark)
    }
}
