//! Multi-threaded front end
//!
//! [`SharedHeap`] wraps a [`HeapManager`] for use by several mutator
//! threads. Each thread [`attach`](SharedHeap::attach)es once and gets a
//! [`Mutator`], which owns the thread's root stack. Mutators address
//! objects only through [`RootSlot`]s, so a collection can move anything
//! without invalidating what a thread holds.
//!
//! Lock order is safepoint, then heap, then root stacks. No thread waits
//! for a safepoint while holding the heap lock.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::heap::HeapManager;
use crate::object::{Address, DescriptorId};
use crate::reference::{QueueId, RefHandle, ReferenceKind};
use crate::roots::{MutatorId, RootProvider, RootSlot, RootStack};
use crate::safepoint::Safepoint;
use crate::scheduler::Generation;
use crate::snapshot::HeapSnapshot;
use crate::stats::{GcCycleReport, GcStats};

type SharedStack = Arc<Mutex<RootStack>>;

/// Heap shared by several mutator threads
#[derive(Debug)]
pub struct SharedHeap {
    heap: Mutex<HeapManager>,
    safepoint: Safepoint,
    stacks: Mutex<Vec<(MutatorId, SharedStack)>>,
}

impl SharedHeap {
    /// Create a shared heap
    pub fn new(config: HeapConfig) -> GcResult<Arc<Self>> {
        Ok(Arc::new(Self {
            heap: Mutex::new(HeapManager::with_config(config)?),
            safepoint: Safepoint::new(),
            stacks: Mutex::new(Vec::new()),
        }))
    }

    /// Register the calling thread as a mutator
    pub fn attach(self: &Arc<Self>) -> Mutator {
        let id = self.safepoint.register();
        let roots = SharedStack::default();
        self.stacks.lock().push((id, Arc::clone(&roots)));
        Mutator {
            shared: Arc::clone(self),
            id,
            roots,
        }
    }

    /// Register an object type
    pub fn register_type(&self, name: &str, reference_offsets: &[u32]) -> GcResult<DescriptorId> {
        self.heap.lock().register_type(name, reference_offsets)
    }

    /// Copy of the cumulative statistics
    pub fn stats(&self) -> GcStats {
        self.heap.lock().stats().clone()
    }

    /// Snapshot of every object in the heap
    pub fn snapshot(&self) -> HeapSnapshot {
        self.heap.lock().snapshot()
    }

    /// Run `f` with exclusive access to the heap.
    ///
    /// Do not collect from inside `f`; use [`Mutator::request_collection`].
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut HeapManager) -> R) -> R {
        f(&mut *self.heap.lock())
    }

    /// Safepoint coordinator
    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    /// Stop the world and run `collect` with every thread's roots.
    fn collect<R>(&self, collect: impl FnOnce(&mut HeapManager, &mut dyn RootProvider) -> R) -> R {
        let _pause = self.safepoint.stop_the_world();
        let mut guard = self.heap.lock();
        let heap: &mut HeapManager = &mut guard;
        let stacks = self.stacks.lock().clone();
        let mut threads = ThreadStacks {
            stacks: stacks.iter().map(|(id, stack)| (*id, stack.lock())).collect(),
        };
        let roots: &mut dyn RootProvider = &mut threads;
        collect(heap, roots)
    }
}

/// Root stacks of every attached thread, locked for a pause
struct ThreadStacks<'a> {
    stacks: Vec<(MutatorId, MutexGuard<'a, RootStack>)>,
}

impl RootProvider for ThreadStacks<'_> {
    fn threads(&self) -> Vec<MutatorId> {
        self.stacks.iter().map(|(id, _)| *id).collect()
    }

    fn stack_walk(&mut self, thread: MutatorId, visitor: &mut dyn FnMut(&mut Address)) {
        if let Some((_, stack)) = self.stacks.iter_mut().find(|(id, _)| *id == thread) {
            stack.stack_walk(RootStack::THREAD, visitor);
        }
    }
}

/// A thread's handle on a [`SharedHeap`].
///
/// Every operation polls the safepoint first. Addresses returned by
/// [`get`](Self::get) are only valid until the next operation.
#[derive(Debug)]
pub struct Mutator {
    shared: Arc<SharedHeap>,
    id: MutatorId,
    roots: SharedStack,
}

impl Mutator {
    /// Thread id
    pub fn id(&self) -> MutatorId {
        self.id
    }

    /// Park if another thread is collecting
    #[inline]
    pub fn safepoint_poll(&self) {
        self.shared.safepoint.poll();
    }

    /// Allocate an object and root it in a new slot
    pub fn allocate(&self, size: usize, type_id: DescriptorId) -> GcResult<RootSlot> {
        self.safepoint_poll();
        let fast = self.shared.heap.lock().allocate(size, type_id);
        let addr = match fast {
            Err(GcError::Allocation(_)) => self
                .shared
                .collect(|heap, roots| heap.allocate_with_gc(size, type_id, roots))?,
            other => other?,
        };
        Ok(self.roots.lock().push(addr))
    }

    /// Current address held in `slot`
    pub fn get(&self, slot: RootSlot) -> Address {
        self.roots.lock().get(slot)
    }

    /// Number of root slots
    pub fn roots_len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Drop every root slot from `len` on
    pub fn truncate_roots(&self, len: usize) {
        self.roots.lock().truncate(len);
    }

    /// Store the object in `value` (or null) into a reference field of `object`
    pub fn store(&self, object: RootSlot, offset: u32, value: Option<RootSlot>) -> GcResult<()> {
        self.safepoint_poll();
        let (object, value) = {
            let roots = self.roots.lock();
            (roots.get(object), value.map_or(Address::NULL, |v| roots.get(v)))
        };
        self.shared.heap.lock().write_reference(object, offset, value)
    }

    /// Load a reference field of `object`, rooting a non-null target in a new slot
    pub fn load(&self, object: RootSlot, offset: u32) -> GcResult<Option<RootSlot>> {
        self.safepoint_poll();
        let object = self.get(object);
        let target = self.shared.heap.lock().read_reference(object, offset)?;
        if target.is_null() {
            return Ok(None);
        }
        Ok(Some(self.roots.lock().push(target)))
    }

    /// Write a `u64` into the payload of `object`
    pub fn write_u64(&self, object: RootSlot, offset: usize, value: u64) -> GcResult<()> {
        self.safepoint_poll();
        let object = self.get(object);
        self.shared.heap.lock().write_u64(object, offset, value)
    }

    /// Read a `u64` from the payload of `object`
    pub fn read_u64(&self, object: RootSlot, offset: usize) -> GcResult<u64> {
        self.safepoint_poll();
        let object = self.get(object);
        self.shared.heap.lock().read_u64(object, offset)
    }

    /// Register a weak, soft, phantom or strong reference to `object`
    pub fn register_reference(
        &self,
        kind: ReferenceKind,
        object: RootSlot,
        queue: Option<QueueId>,
    ) -> GcResult<RefHandle> {
        self.safepoint_poll();
        let object = self.get(object);
        self.shared.heap.lock().register_reference(kind, object, queue)
    }

    /// Stop the world and run a collection
    pub fn request_collection(&self, generation: Generation) -> GcResult<GcCycleReport> {
        self.shared
            .collect(|heap, roots| heap.request_collection(generation, roots))
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.shared.stacks.lock().retain(|(id, _)| *id != self.id);
        self.shared.safepoint.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CollectionKind;

    #[test]
    fn test_single_mutator_survives_collections() {
        let heap = SharedHeap::new(HeapConfig::small().with_eden_size(1024)).unwrap();
        let node = heap.register_type("Node", &[0]).unwrap();
        let mutator = heap.attach();

        let head = mutator.allocate(32, node).unwrap();
        mutator.write_u64(head, 8, 0).unwrap();
        let mut tail = head;
        for i in 1..20u64 {
            let next = mutator.allocate(32, node).unwrap();
            mutator.write_u64(next, 8, i).unwrap();
            mutator.store(tail, 0, Some(next)).unwrap();
            tail = next;
            // Garbage between list cells
            mutator.allocate(64, node).unwrap();
            mutator.truncate_roots(tail.0 + 1);
        }
        assert!(heap.stats().minor_collections > 0);

        let mut cursor = Some(head);
        let mut seen = 0;
        while let Some(slot) = cursor {
            assert_eq!(mutator.read_u64(slot, 8).unwrap(), seen);
            seen += 1;
            cursor = mutator.load(slot, 0).unwrap();
        }
        assert_eq!(seen, 20);
    }

    #[test]
    fn test_request_collection_rewrites_roots() {
        let heap = SharedHeap::new(HeapConfig::small()).unwrap();
        let node = heap.register_type("Node", &[0]).unwrap();
        let mutator = heap.attach();

        let slot = mutator.allocate(32, node).unwrap();
        let before = mutator.get(slot);
        let report = mutator.request_collection(Generation::Young).unwrap();

        assert_eq!(report.generation, CollectionKind::Minor);
        assert_ne!(mutator.get(slot), before);
        assert_eq!(heap.safepoint().pauses(), 1);
    }

    #[test]
    fn test_detach_deregisters() {
        let heap = SharedHeap::new(HeapConfig::small()).unwrap();
        let first = heap.attach();
        let second = heap.attach();
        assert_ne!(first.id(), second.id());
        assert_eq!(heap.safepoint().registered(), 2);
        drop(first);
        drop(second);
        assert_eq!(heap.safepoint().registered(), 0);
    }
}
