//! Minor (copying) collection
//!
//! Evacuates every reachable object out of eden and the from-survivor, into
//! the to-survivor or, when the tenuring policy says so or the to-survivor is
//! full, into the old generation.
//!
//! The cycle runs in two steps:
//!
//! - **Plan**: trace from roots, strong handles and remembered slots and
//!   reserve a destination for each reachable young object. Nothing is
//!   written. If the old generation cannot take a promotion the cycle stops
//!   here with [`GcError::PromotionFailed`] and the heap is untouched.
//! - **Evacuate**: copy, install forwarding pointers in the old copies, then
//!   rewrite every slot that may point into evacuated space. Once this starts
//!   it runs to completion.

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::error::{GcError, GcResult};
use crate::heap::HeapManager;
use crate::layout::TypeRegistry;
use crate::object::Address;
use crate::reference::Reachability;
use crate::region::Regions;
use crate::roots::RootProvider;
use crate::stats::{CollectionKind, GcCycleReport};
use crate::tenuring::{Destination, TenuringPolicy};

/// A planned copy of one young object
#[derive(Debug, Clone, Copy)]
struct Evacuation {
    from: Address,
    to: Address,
    size: usize,
    destination: Destination,
    /// Age the copy carries
    age: u8,
}

/// Scratch state of one minor cycle
#[derive(Debug)]
struct MinorCollector {
    plan: Vec<Evacuation>,
    destinations: FxHashMap<Address, Address>,
    stack: Vec<Address>,
    to_top: Address,
    to_limit: Address,
    old_top: Address,
    old_limit: Address,
}

impl MinorCollector {
    fn new(regions: &Regions) -> Self {
        let to_space = regions.to_space();
        assert_eq!(to_space.used(), 0, "to-survivor must be empty before a minor cycle");
        Self {
            plan: Vec::new(),
            destinations: FxHashMap::default(),
            stack: Vec::new(),
            to_top: to_space.top(),
            to_limit: to_space.limit(),
            old_top: regions.old().top(),
            old_limit: regions.old().limit(),
        }
    }
}

/// Planning view used while tracing
struct MinorTrace<'a> {
    collector: &'a mut MinorCollector,
    regions: &'a Regions,
    types: &'a TypeRegistry,
    tenuring: &'a TenuringPolicy,
}

impl MinorTrace<'_> {
    /// Reserve a destination for `addr` if it is an unplanned young object
    fn visit(&mut self, addr: Address) -> GcResult<()> {
        if addr.is_null()
            || !self.regions.is_evacuated(addr)
            || self.collector.destinations.contains_key(&addr)
        {
            return Ok(());
        }

        let header = self.regions.header(addr);
        let size = header.size();
        let c = &mut *self.collector;
        let survivor_free = c.to_limit.distance_from(c.to_top);
        let destination = self.tenuring.destination(header.age, size, survivor_free);

        let to = match destination {
            Destination::Survivor => {
                let to = c.to_top;
                c.to_top = to.offset(size);
                to
            }
            Destination::Old => {
                let available = c.old_limit.distance_from(c.old_top);
                if size > available {
                    return Err(GcError::PromotionFailed {
                        needed: size,
                        available,
                    });
                }
                let to = c.old_top;
                c.old_top = to.offset(size);
                to
            }
        };

        c.destinations.insert(addr, to);
        c.plan.push(Evacuation {
            from: addr,
            to,
            size,
            destination,
            age: self.tenuring.age_after(header.age, destination),
        });
        c.stack.push(addr);
        Ok(())
    }

    /// Trace fields of planned objects until the stack is empty
    fn drain(&mut self) -> GcResult<()> {
        let regions = self.regions;
        let types = self.types;
        while let Some(object) = self.collector.stack.pop() {
            let type_id = regions.header(object).type_id;
            for &offset in types.references_of(type_id) {
                self.visit(regions.read_address(object.field(offset)))?;
            }
        }
        Ok(())
    }
}

impl Reachability for MinorTrace<'_> {
    fn in_scope(&self, addr: Address) -> bool {
        self.regions.is_evacuated(addr)
    }

    fn is_reached(&self, addr: Address) -> bool {
        self.collector.destinations.contains_key(&addr)
    }

    fn retain(&mut self, addr: Address) -> GcResult<()> {
        self.visit(addr)?;
        self.drain()
    }
}

/// New address of `addr` after evacuation.
///
/// Addresses outside evacuated space are returned unchanged. A young
/// address without a forwarding pointer means a slot was missed while
/// planning, which would leave the mutator with a dangling reference.
fn forwarded(regions: &Regions, addr: Address) -> Address {
    if addr.is_null() || !regions.is_evacuated(addr) {
        return addr;
    }
    let header = regions.header(addr);
    assert!(
        header.is_forwarded(),
        "young object {addr} is referenced but was not evacuated"
    );
    header.forwarding
}

impl HeapManager {
    /// Run a minor collection.
    ///
    /// Fails only with [`GcError::PromotionFailed`], before anything moved.
    pub fn collect_minor(&mut self, roots: &mut dyn RootProvider) -> GcResult<GcCycleReport> {
        let start = Instant::now();
        let eden_used = self.regions.eden().used();
        let from_used = self.regions.from_space().used();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "gengc::gc",
            eden_used,
            survivor_used = from_used,
            old_used = self.regions.old().used(),
            remembered = self.remembered_set.len(),
            "minor GC starting"
        );

        let mut collector = MinorCollector::new(&self.regions);

        // Phase 1: Plan evacuation
        let decisions = {
            let mut trace = MinorTrace {
                collector: &mut collector,
                regions: &self.regions,
                types: &self.types,
                tenuring: &self.tenuring,
            };

            let mut traced = Ok(());
            roots.enumerate_roots(&mut |slot| {
                if traced.is_ok() {
                    traced = trace.visit(*slot);
                }
            });
            traced?;
            for referent in self.references.strong_referents() {
                trace.visit(referent)?;
            }
            for slot in self.remembered_set.slots() {
                trace.visit(self.regions.read_address(slot))?;
            }
            trace.drain()?;

            let pressure = self.references.memory_pressure();
            self.references.plan(&mut trace, pressure)
        };
        let decisions = match decisions {
            Ok(decisions) => decisions,
            Err(err) => {
                #[cfg(feature = "gc_logging")]
                tracing::warn!(target: "gengc::gc", error = %err, "minor GC abandoned before evacuation");
                return Err(err);
            }
        };
        let references_processed = decisions.len();
        self.references.apply(decisions);

        // Phase 2: Copy and install forwarding pointers
        for ev in &collector.plan {
            self.regions.copy_object(ev.from, ev.to, ev.size);

            let mut copy = self.regions.header(ev.to);
            copy.age = ev.age;
            copy.marked = false;
            copy.forwarding = Address::NULL;
            self.regions.set_header(ev.to, &copy);

            let mut original = self.regions.header(ev.from);
            original.forwarding = ev.to;
            self.regions.set_header(ev.from, &original);
        }
        self.regions.to_space_mut().set_top(collector.to_top);
        self.regions.old_mut().set_top(collector.old_top);

        // Phase 3: Rewrite roots, handles and remembered slots
        roots.enumerate_roots(&mut |slot| *slot = forwarded(&self.regions, *slot));
        self.references
            .rewrite_referents(|addr| forwarded(&self.regions, addr));
        for slot in self.remembered_set.slots() {
            let value = self.regions.read_address(slot);
            let target = forwarded(&self.regions, value);
            if target != value {
                self.regions.write_address(slot, target);
            }
        }

        // Phase 4: Rewrite fields of the copies
        let mut objects_promoted = 0;
        let mut bytes_promoted = 0;
        let mut survivor_bytes = 0;
        for ev in &collector.plan {
            let type_id = self.regions.header(ev.to).type_id;
            let promoted = ev.destination == Destination::Old;
            for &offset in self.types.references_of(type_id) {
                let slot = ev.to.field(offset);
                let value = self.regions.read_address(slot);
                let target = forwarded(&self.regions, value);
                if target != value {
                    self.regions.write_address(slot, target);
                }
                if promoted && self.regions.to_space().contains(target) {
                    self.remembered_set.add(slot);
                }
            }
            if promoted {
                objects_promoted += 1;
                bytes_promoted += ev.size;
            } else {
                survivor_bytes += ev.size;
            }
        }

        // Phase 5: Drop remembered slots that no longer point into young space
        let regions = &self.regions;
        self.remembered_set
            .retain(|slot| regions.to_space().contains(regions.read_address(slot)));

        // Phase 6: Release eden and from-space, swap survivor roles
        self.regions.eden_mut().reset();
        self.regions.from_space_mut().reset();
        self.regions.swap_survivors();

        let live_bytes = survivor_bytes + bytes_promoted;
        let report = GcCycleReport {
            cycle: self.stats.collections() + 1,
            generation: CollectionKind::Minor,
            bytes_reclaimed: eden_used + from_used - live_bytes,
            objects_relocated: collector.plan.len(),
            objects_promoted,
            bytes_promoted,
            live_bytes,
            references_processed,
            pause: start.elapsed(),
        };

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "gengc::gc",
            cycle = report.cycle,
            reclaimed = report.bytes_reclaimed,
            relocated = report.objects_relocated,
            promoted = report.objects_promoted,
            survivor_used = survivor_bytes,
            pause_us = report.pause.as_micros() as u64,
            "minor GC complete"
        );

        Ok(self.finish_cycle(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::DescriptorId;
    use crate::region::RegionKind;
    use crate::roots::{NoRoots, RootStack};

    fn heap(config: HeapConfig) -> (HeapManager, DescriptorId) {
        let mut heap = HeapManager::with_config(config).unwrap();
        let node = heap.register_type("Node", &[0]).unwrap();
        (heap, node)
    }

    #[test]
    fn test_unreachable_young_objects_reclaimed() {
        let (mut heap, node) = heap(HeapConfig::small());
        for _ in 0..5 {
            heap.allocate(64, node).unwrap();
        }

        let report = heap.collect_minor(&mut NoRoots).unwrap();
        assert_eq!(report.bytes_reclaimed, 320);
        assert_eq!(report.objects_relocated, 0);
        assert_eq!(heap.regions().eden().used(), 0);
        assert_eq!(heap.regions().from_space().used(), 0);
    }

    #[test]
    fn test_survivors_copied_with_fields() {
        let (mut heap, node) = heap(HeapConfig::small());
        let mut roots = RootStack::new();

        let tail = heap.allocate(32, node).unwrap();
        heap.write_u64(tail, 8, 7).unwrap();
        let head = heap.allocate(32, node).unwrap();
        heap.write_u64(head, 8, 11).unwrap();
        heap.write_reference(head, 0, tail).unwrap();
        let slot = roots.push(head);

        let report = heap.collect_minor(&mut roots).unwrap();
        assert_eq!(report.objects_relocated, 2);

        let head = roots.get(slot);
        assert_eq!(heap.region_of(head), Some(heap.regions().from_space().kind()));
        assert_eq!(heap.read_u64(head, 8).unwrap(), 11);
        let tail = heap.read_reference(head, 0).unwrap();
        assert_eq!(heap.read_u64(tail, 8).unwrap(), 7);
        assert_eq!(heap.header(tail).unwrap().age, 1);
    }

    #[test]
    fn test_shared_and_cyclic_references_copied_once() {
        let (mut heap, node) = heap(HeapConfig::small());
        let mut roots = RootStack::new();

        let a = heap.allocate(32, node).unwrap();
        let b = heap.allocate(32, node).unwrap();
        heap.write_reference(a, 0, b).unwrap();
        heap.write_reference(b, 0, a).unwrap();
        let first = roots.push(a);
        let second = roots.push(a);

        let report = heap.collect_minor(&mut roots).unwrap();
        assert_eq!(report.objects_relocated, 2);
        assert_eq!(heap.regions().from_space().used(), 64);

        let a = roots.get(first);
        assert_eq!(roots.get(second), a);
        let b = heap.read_reference(a, 0).unwrap();
        assert_eq!(heap.read_reference(b, 0).unwrap(), a);
    }

    #[test]
    fn test_remembered_slot_keeps_young_object_alive() {
        let (mut heap, node) = heap(HeapConfig::small());
        let big = heap.config().large_object_threshold + 8;
        let old = heap.allocate(big, node).unwrap();
        let young = heap.allocate(32, node).unwrap();
        heap.write_u64(young, 8, 99).unwrap();
        heap.write_reference(old, 0, young).unwrap();

        // The old object is a root only through the remembered set
        let mut roots = RootStack::new();
        roots.push(old);
        heap.allocate(32, node).unwrap();

        heap.collect_minor(&mut roots).unwrap();

        let moved = heap.read_reference(old, 0).unwrap();
        assert_ne!(moved, young);
        assert_eq!(heap.read_u64(moved, 8).unwrap(), 99);
        assert!(heap.remembered_set().contains(old.field(0)));
    }

    #[test]
    fn test_metaspace_slot_is_a_minor_root() {
        let (mut heap, node) = heap(HeapConfig::small().with_tenuring_threshold(8));
        let meta = heap.allocate_permanent(32, node).unwrap();
        let young = heap.allocate(32, node).unwrap();
        heap.write_u64(young, 8, 9).unwrap();
        heap.write_reference(meta, 0, young).unwrap();
        assert!(heap.remembered_set().contains(meta.field(0)));

        let mut previous = young;
        for cycle in 1..=3u8 {
            heap.collect_minor(&mut RootStack::new()).unwrap();

            let target = heap.read_reference(meta, 0).unwrap();
            assert_ne!(target, previous);
            assert_eq!(heap.region_of(target), Some(heap.regions().from_space().kind()));
            assert_eq!(heap.read_u64(target, 8).unwrap(), 9);
            assert_eq!(heap.header(target).unwrap().age, cycle);
            assert!(heap.remembered_set().contains(meta.field(0)));
            previous = target;
        }
        assert_eq!(heap.region_of(meta), Some(RegionKind::Metaspace));
    }

    #[test]
    fn test_stale_remembered_slot_dropped() {
        let (mut heap, node) = heap(HeapConfig::small());
        let big = heap.config().large_object_threshold + 8;
        let old = heap.allocate(big, node).unwrap();
        let young = heap.allocate(32, node).unwrap();
        heap.write_reference(old, 0, young).unwrap();
        heap.write_reference(old, 0, Address::NULL).unwrap();
        assert_eq!(heap.remembered_set().len(), 1);

        heap.collect_minor(&mut NoRoots).unwrap();
        assert!(heap.remembered_set().is_empty());
    }

    #[test]
    fn test_promotion_at_threshold() {
        let (mut heap, node) = heap(HeapConfig::small().with_tenuring_threshold(2));
        let mut roots = RootStack::new();
        let slot = roots.push(heap.allocate(32, node).unwrap());

        heap.collect_minor(&mut roots).unwrap();
        assert!(heap.is_young(roots.get(slot)));
        assert_eq!(heap.header(roots.get(slot)).unwrap().age, 1);

        let report = heap.collect_minor(&mut roots).unwrap();
        assert_eq!(report.objects_promoted, 1);
        assert_eq!(heap.region_of(roots.get(slot)), Some(RegionKind::Old));
        assert_eq!(heap.header(roots.get(slot)).unwrap().age, 0);
    }

    #[test]
    fn test_promoted_object_pointing_young_is_remembered() {
        let (mut heap, node) = heap(HeapConfig::small().with_tenuring_threshold(2));
        let mut roots = RootStack::new();
        let parent = roots.push(heap.allocate(32, node).unwrap());
        heap.collect_minor(&mut roots).unwrap();

        // The child is one cycle younger, so it stays young when the parent promotes
        let child = heap.allocate(32, node).unwrap();
        heap.write_reference(roots.get(parent), 0, child).unwrap();
        heap.collect_minor(&mut roots).unwrap();

        let parent = roots.get(parent);
        let child = heap.read_reference(parent, 0).unwrap();
        assert_eq!(heap.region_of(parent), Some(RegionKind::Old));
        assert!(heap.is_young(child));
        assert!(heap.remembered_set().contains(parent.field(0)));
    }

    #[test]
    fn test_survivor_overflow_promotes() {
        let config = HeapConfig::small().with_survivor_size(64);
        let (mut heap, node) = heap(config);
        let mut roots = RootStack::new();
        for _ in 0..3 {
            roots.push(heap.allocate(32, node).unwrap());
        }

        let report = heap.collect_minor(&mut roots).unwrap();
        assert_eq!(report.objects_promoted, 1);
        assert_eq!(heap.regions().from_space().used(), 64);
        assert_eq!(heap.regions().old().used(), 32);
    }

    #[test]
    fn test_promotion_failure_leaves_heap_untouched() {
        let config = HeapConfig::small()
            .with_survivor_size(32)
            .with_old_size(32);
        let (mut heap, node) = heap(config);
        let mut roots = RootStack::new();
        let a = roots.push(heap.allocate(32, node).unwrap());
        let b = roots.push(heap.allocate(48, node).unwrap());
        let before = (roots.get(a), roots.get(b));

        let err = heap.collect_minor(&mut roots).unwrap_err();
        assert_eq!(
            err,
            GcError::PromotionFailed {
                needed: 48,
                available: 32
            }
        );
        assert_eq!((roots.get(a), roots.get(b)), before);
        assert_eq!(heap.regions().eden().used(), 80);
        assert_eq!(heap.regions().to_space().used(), 0);
        assert_eq!(heap.stats().minor_collections, 0);
        heap.verify().unwrap();
    }
}
