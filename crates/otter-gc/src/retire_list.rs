//! Lock-free push-only lists
//!
//! Parallel workers may publish items while holding only a shared reference;
//! the list is emptied in one step by swapping the head to null once every
//! worker has rejoined. Nothing ever pops a single node concurrently, so the
//! usual ABA hazard of Treiber stacks does not arise: a pusher never
//! dereferences the head it reads, it only links its own node to it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::heap::RegionIndex;
use crate::remset_table::RsHashTable;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Multi-producer list drained as a whole
pub struct LockFreeList<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
}

// SAFETY: nodes are uniquely owned by the list once published and are only
// turned back into `Box`es by the thread that swapped them out of `head`.
unsafe impl<T: Send> Send for LockFreeList<T> {}
unsafe impl<T: Send> Sync for LockFreeList<T> {}

impl<T> LockFreeList<T> {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
        }
    }

    /// Publish `value`
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        // Counted before publishing so a concurrent `take_all` never
        // subtracts a node that has not been added yet.
        self.len.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not yet shared.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach every published item, most recent first
    pub fn take_all(&self) -> Vec<T> {
        let mut cursor = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut items = Vec::new();
        while !cursor.is_null() {
            // SAFETY: the swap above made this chain unreachable from `head`,
            // so this thread is its sole owner.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
            items.push(node.value);
        }
        self.len.fetch_sub(items.len(), Ordering::Relaxed);
        items
    }

    /// Remove the most recent item; exclusive access makes this trivially safe
    pub fn pop(&mut self) -> Option<T> {
        let head = *self.head.get_mut();
        if head.is_null() {
            return None;
        }
        // SAFETY: `&mut self` excludes concurrent pushers and drainers.
        let node = unsafe { Box::from_raw(head) };
        *self.head.get_mut() = node.next;
        *self.len.get_mut() -= 1;
        Some(node.value)
    }

    /// Whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Approximate number of published items
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for LockFreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeList<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Lists shared by every sparse remembered set
#[derive(Default)]
pub struct RetireLists {
    /// Young regions whose set grew since the last cleanup
    pub expanded: LockFreeList<RegionIndex>,
    /// Tables replaced by a grown copy, awaiting deletion
    pub deleted: LockFreeList<Box<RsHashTable>>,
}

impl RetireLists {
    /// Create empty lists
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a replaced table for deletion at the next cleanup
    pub fn retire(&self, table: Box<RsHashTable>) {
        self.deleted.push(table);
    }

    /// Drop every retired table, returning how many were freed
    pub fn drain_deleted(&self) -> usize {
        self.deleted.take_all().len()
    }
}
