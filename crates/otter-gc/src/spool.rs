//! Spool blocks for displaced headers
//!
//! When a promoted object's header is repurposed as a list link, a header that
//! cannot be rebuilt from the prototype is copied into a spool block first.
//! Blocks are fixed-capacity FIFO buffers recycled through a free list shared
//! by every tracker in the process.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SpoolConfig;
use crate::error::{GcError, GcResult, guarantee};
use crate::object::MarkWord;

/// Which budget a block was charged to.
///
/// Every block is backed by an ordinary `Vec`; the scratch budget only
/// models the pre-reserved scratch area, so the first `scratch_blocks`
/// blocks are accounted as `Scratch` and the rest as `Fallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Charged to the scratch budget
    Scratch,
    /// Charged to the general allocator
    Fallback,
}

/// Fixed-capacity buffer of displaced headers
#[derive(Debug)]
pub struct SpoolBlock {
    headers: Vec<MarkWord>,
    capacity: usize,
    /// Index of the next header to restore
    read: usize,
    source: BlockSource,
}

impl SpoolBlock {
    fn new(capacity: usize, source: BlockSource) -> Self {
        Self {
            headers: Vec::with_capacity(capacity),
            capacity,
            read: 0,
            source,
        }
    }

    /// Whether another header fits
    pub fn is_full(&self) -> bool {
        self.headers.len() == self.capacity
    }

    /// Whether every saved header has been restored
    pub fn is_drained(&self) -> bool {
        self.read == self.headers.len()
    }

    /// Headers saved but not yet restored
    pub fn pending(&self) -> usize {
        self.headers.len() - self.read
    }

    /// Storage origin
    pub fn source(&self) -> BlockSource {
        self.source
    }

    /// Save a header at the tail
    pub fn push(&mut self, mark: MarkWord) {
        guarantee!(!self.is_full(), "push into full spool block");
        self.headers.push(mark);
    }

    /// Restore the oldest unrestored header
    pub fn pop_front(&mut self) -> Option<MarkWord> {
        let mark = self.headers.get(self.read).copied()?;
        self.read += 1;
        Some(mark)
    }

    fn reset(&mut self) {
        self.headers.clear();
        self.read = 0;
    }
}

/// Spool allocator shared by all promotion trackers
pub type SharedSpoolAllocator = Arc<Mutex<SpoolAllocator>>;

/// Hands out spool blocks, recycling returned ones first
#[derive(Debug)]
pub struct SpoolAllocator {
    free: Vec<SpoolBlock>,
    block_capacity: usize,
    scratch_remaining: usize,
    max_blocks: Option<usize>,
    created: usize,
    in_use: usize,
}

impl SpoolAllocator {
    /// Create an allocator with no blocks yet
    pub fn new(config: &SpoolConfig) -> Self {
        Self {
            free: Vec::new(),
            block_capacity: config.block_capacity,
            scratch_remaining: config.scratch_blocks,
            max_blocks: config.max_blocks,
            created: 0,
            in_use: 0,
        }
    }

    /// Create an allocator wrapped for sharing
    pub fn shared(config: &SpoolConfig) -> SharedSpoolAllocator {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Headers per block
    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    /// Take a block: free list, then the scratch budget, then the general allocator
    pub fn allocate(&mut self) -> GcResult<SpoolBlock> {
        if let Some(block) = self.free.pop() {
            self.in_use += 1;
            return Ok(block);
        }
        if let Some(limit) = self.max_blocks
            && self.created >= limit
        {
            return Err(GcError::SpoolExhausted {
                blocks_in_use: self.in_use,
                limit,
            });
        }
        let source = if self.scratch_remaining > 0 {
            self.scratch_remaining -= 1;
            BlockSource::Scratch
        } else {
            BlockSource::Fallback
        };
        self.created += 1;
        self.in_use += 1;
        Ok(SpoolBlock::new(self.block_capacity, source))
    }

    /// Return a fully drained block to the free list
    pub fn release(&mut self, mut block: SpoolBlock) {
        guarantee!(
            block.is_drained(),
            "releasing spool block with {} unrestored header(s)",
            block.pending()
        );
        guarantee!(self.in_use > 0, "spool release without matching allocate");
        block.reset();
        self.in_use -= 1;
        self.free.push(block);
    }

    /// Whether a block could be handed out right now
    pub fn can_allocate(&self) -> bool {
        !self.free.is_empty() || self.max_blocks.is_none_or(|limit| self.created < limit)
    }

    /// Blocks currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Blocks waiting on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Blocks ever created
    pub fn created(&self) -> usize {
        self.created
    }
}
