//! Root enumeration
//!
//! Roots belong to the mutator. The collector asks for them once per pause
//! through [`RootProvider`] and may rewrite every slot it is handed, so the
//! provider yields `&mut Address` rather than copies.

use std::fmt;

use crate::object::Address;

/// Identifier of a mutator thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(pub u32);

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutator-{}", self.0)
    }
}

/// Trait for mutator runtimes that can hand their roots to the collector
pub trait RootProvider {
    /// Threads with root slots at this pause
    fn threads(&self) -> Vec<MutatorId>;

    /// Visit every reference slot of one parked thread's stack
    fn stack_walk(&mut self, thread: MutatorId, visitor: &mut dyn FnMut(&mut Address));

    /// Visit static slots that belong to no thread
    fn visit_statics(&mut self, _visitor: &mut dyn FnMut(&mut Address)) {}

    /// Visit every live reference slot across all threads and statics
    fn enumerate_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        for thread in self.threads() {
            self.stack_walk(thread, visitor);
        }
        self.visit_statics(visitor);
    }
}

/// Provider with no roots at all
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn threads(&self) -> Vec<MutatorId> {
        Vec::new()
    }

    fn stack_walk(&mut self, _thread: MutatorId, _visitor: &mut dyn FnMut(&mut Address)) {}
}

/// Index of a slot in a [`RootStack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSlot(pub usize);

/// Shadow stack of root slots for a single mutator thread
///
/// Addresses read from the stack are only valid until the next collection;
/// read the slot again afterwards.
#[derive(Debug, Default, Clone)]
pub struct RootStack {
    slots: Vec<Address>,
}

impl RootStack {
    /// Thread id reported to the collector
    pub const THREAD: MutatorId = MutatorId(0);

    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a root
    pub fn push(&mut self, addr: Address) -> RootSlot {
        self.slots.push(addr);
        RootSlot(self.slots.len() - 1)
    }

    /// Pop the most recent root
    pub fn pop(&mut self) -> Option<Address> {
        self.slots.pop()
    }

    /// Current value of a slot
    pub fn get(&self, slot: RootSlot) -> Address {
        self.slots[slot.0]
    }

    /// Overwrite a slot
    pub fn set(&mut self, slot: RootSlot, addr: Address) {
        self.slots[slot.0] = addr;
    }

    /// Drop the reference held by a slot
    pub fn clear(&mut self, slot: RootSlot) {
        self.slots[slot.0] = Address::NULL;
    }

    /// Shrink the stack to `len` slots
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots
    pub fn as_slice(&self) -> &[Address] {
        &self.slots
    }
}

impl RootProvider for RootStack {
    fn threads(&self) -> Vec<MutatorId> {
        vec![Self::THREAD]
    }

    fn stack_walk(&mut self, thread: MutatorId, visitor: &mut dyn FnMut(&mut Address)) {
        if thread != Self::THREAD {
            return;
        }
        for slot in &mut self.slots {
            if !slot.is_null() {
                visitor(slot);
            }
        }
    }
}
