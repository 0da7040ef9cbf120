//! Strong and weak root handles
//!
//! Embedders hold objects through handles into a slot table owned by the
//! collector. The collector rewrites slot contents when objects move, so a
//! handle stays valid across collections. Weak slots do not keep their target
//! alive; when the target dies the slot is cleared.

use crate::object::Address;

/// Strong root handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

/// Weak root handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle(usize);

/// Slot table with recycled indices
#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Option<Address>>,
    /// Whether a slot is handed out (a handed-out weak slot may hold `None`)
    live: Vec<bool>,
    free: Vec<usize>,
}

impl SlotTable {
    fn insert(&mut self, value: Address) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                self.live[index] = true;
                index
            }
            None => {
                self.slots.push(Some(value));
                self.live.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<Address> {
        assert!(self.live[index], "handle {index} already released");
        self.live[index] = false;
        self.free.push(index);
        self.slots[index].take()
    }

    fn get(&self, index: usize) -> Option<Address> {
        assert!(self.live[index], "use of released handle {index}");
        self.slots[index]
    }

    fn set(&mut self, index: usize, value: Option<Address>) {
        assert!(self.live[index], "use of released handle {index}");
        self.slots[index] = value;
    }

    fn len(&self) -> usize {
        self.live.iter().filter(|live| **live).count()
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut Option<Address>> {
        self.slots.iter_mut().filter(|slot| slot.is_some())
    }

    fn values(&self) -> impl Iterator<Item = Address> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }
}

/// Strong roots
#[derive(Debug, Default)]
pub struct RootSet {
    table: SlotTable,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Root an object
    pub fn add(&mut self, obj: Address) -> RootHandle {
        RootHandle(self.table.insert(obj))
    }

    /// Release a root, returning the object's current address
    pub fn remove(&mut self, handle: RootHandle) -> Option<Address> {
        self.table.remove(handle.0)
    }

    /// Current address of a rooted object
    pub fn get(&self, handle: RootHandle) -> Address {
        match self.table.get(handle.0) {
            Some(addr) => addr,
            None => panic!("strong root {handle:?} is empty"),
        }
    }

    /// Re-point a root at another object
    pub fn set(&mut self, handle: RootHandle, obj: Address) {
        self.table.set(handle.0, Some(obj));
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no live handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rooted addresses
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.table.values()
    }

    /// Rewrite every rooted address in place
    pub fn update(&mut self, mut f: impl FnMut(Address) -> Address) {
        for slot in self.table.values_mut() {
            if let Some(addr) = slot {
                *addr = f(*addr);
            }
        }
    }
}

/// Weak roots
#[derive(Debug, Default)]
pub struct WeakRoots {
    table: SlotTable,
}

impl WeakRoots {
    /// Create an empty weak table
    pub fn new() -> Self {
        Self::default()
    }

    /// Weakly reference an object
    pub fn add(&mut self, obj: Address) -> WeakHandle {
        WeakHandle(self.table.insert(obj))
    }

    /// Release a weak handle
    pub fn remove(&mut self, handle: WeakHandle) -> Option<Address> {
        self.table.remove(handle.0)
    }

    /// Target's current address, or `None` once it has been collected
    pub fn get(&self, handle: WeakHandle) -> Option<Address> {
        self.table.get(handle.0)
    }

    /// Number of live handles (cleared ones included)
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no live handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Targets not yet cleared
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.table.values()
    }

    /// Rewrite or clear every uncleared target. `f` returns `None` to clear.
    /// Returns how many were cleared.
    pub fn update(&mut self, mut f: impl FnMut(Address) -> Option<Address>) -> usize {
        let mut cleared = 0;
        for slot in self.table.values_mut() {
            if let Some(addr) = *slot {
                *slot = f(addr);
                if slot.is_none() {
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_handles_recycle() {
        let mut roots = RootSet::new();
        let a = roots.add(Address(10));
        let b = roots.add(Address(20));
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.remove(a), Some(Address(10)));
        let c = roots.add(Address(30));
        assert_eq!(c, a);
        assert_eq!(roots.get(b), Address(20));
        assert_eq!(roots.get(c), Address(30));
    }

    #[test]
    fn test_root_update() {
        let mut roots = RootSet::new();
        let a = roots.add(Address(10));
        roots.update(|addr| addr.offset(5));
        assert_eq!(roots.get(a), Address(15));
    }

    #[test]
    fn test_weak_clear() {
        let mut weak = WeakRoots::new();
        let a = weak.add(Address(4));
        let b = weak.add(Address(8));
        let cleared = weak.update(|addr| (addr != Address(4)).then_some(addr));
        assert_eq!(cleared, 1);
        assert_eq!(weak.get(a), None);
        assert_eq!(weak.get(b), Some(Address(8)));
        assert_eq!(weak.len(), 2);
        assert_eq!(weak.iter().collect::<Vec<_>>(), vec![Address(8)]);
    }

    #[test]
    #[should_panic(expected = "released")]
    fn test_released_handle_panics() {
        let mut roots = RootSet::new();
        let a = roots.add(Address(1));
        roots.remove(a);
        roots.get(a);
    }
}
