//! Major (mark-sweep-compact) collection of the old generation
//!
//! ## Phases
//!
//! 1. **Mark**: depth-first from roots, strong handles, every young object
//!    and every metaspace object, using the mark bit in the object header.
//!    Only old objects are marked; young and metaspace objects act as roots.
//! 2. **Plan**: walk the old generation in address order and assign each
//!    live object its slid-down address.
//! 3. **Update**: rewrite every slot that may point into the old generation,
//!    and move remembered slots along with their containing objects.
//! 4. **Compact**: slide live objects down in ascending order and clear
//!    their marks. The old generation ends up gap-free.

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::error::GcResult;
use crate::heap::HeapManager;
use crate::layout::TypeRegistry;
use crate::object::Address;
use crate::reference::Reachability;
use crate::region::Regions;
use crate::roots::RootProvider;
use crate::stats::{CollectionKind, GcCycleReport};

/// Marking view of the heap
struct MajorTrace<'a> {
    regions: &'a mut Regions,
    types: &'a TypeRegistry,
    stack: Vec<Address>,
}

impl MajorTrace<'_> {
    /// Set the mark bit of an unmarked old object and queue it
    fn mark(&mut self, addr: Address) {
        if addr.is_null() || !self.regions.old().contains_allocated(addr) {
            return;
        }
        let mut header = self.regions.header(addr);
        if header.marked {
            return;
        }
        header.marked = true;
        self.regions.set_header(addr, &header);
        self.stack.push(addr);
    }

    /// Mark the targets of every reference field of `object`
    fn scan(&mut self, object: Address) {
        let types = self.types;
        let type_id = self.regions.header(object).type_id;
        for &offset in types.references_of(type_id) {
            let target = self.regions.read_address(object.field(offset));
            self.mark(target);
        }
    }

    fn drain(&mut self) {
        while let Some(object) = self.stack.pop() {
            self.scan(object);
        }
    }
}

impl Reachability for MajorTrace<'_> {
    fn in_scope(&self, addr: Address) -> bool {
        self.regions.old().contains(addr)
    }

    fn is_reached(&self, addr: Address) -> bool {
        self.regions.header(addr).marked
    }

    fn retain(&mut self, addr: Address) -> GcResult<()> {
        self.mark(addr);
        self.drain();
        Ok(())
    }
}

/// Where live old objects go
#[derive(Debug, Default)]
struct CompactionPlan {
    /// Live objects in address order, with their sizes
    live: Vec<(Address, usize)>,
    /// Old address to new address, for objects that move
    forwarding: FxHashMap<Address, Address>,
    /// Bytes the live objects occupy after compaction
    live_bytes: usize,
    reclaimed_bytes: usize,
    reclaimed_objects: usize,
}

impl CompactionPlan {
    fn build(regions: &Regions) -> Self {
        let old = regions.old();
        let mut plan = Self::default();
        for addr in old.object_addresses() {
            let header = old.header(addr);
            let size = header.size();
            if header.marked {
                let target = old.base().offset(plan.live_bytes);
                if target != addr {
                    plan.forwarding.insert(addr, target);
                }
                plan.live.push((addr, size));
                plan.live_bytes += size;
            } else {
                plan.reclaimed_bytes += size;
                plan.reclaimed_objects += 1;
            }
        }
        plan
    }

    /// New address of `addr`. Only valid before objects move.
    fn relocated(&self, regions: &Regions, addr: Address) -> Address {
        if addr.is_null() || !regions.old().contains(addr) {
            return addr;
        }
        if let Some(&target) = self.forwarding.get(&addr) {
            return target;
        }
        assert!(
            regions.header(addr).marked,
            "unmarked old object {addr} is still referenced"
        );
        addr
    }

    /// Live object containing `slot`, if any
    fn container_of(&self, slot: Address) -> Option<Address> {
        let index = self.live.partition_point(|&(addr, _)| addr <= slot);
        let (addr, size) = *self.live.get(index.checked_sub(1)?)?;
        (slot < addr.offset(size)).then_some(addr)
    }
}

/// Rewrite every reference field of `object` through `plan`
fn update_fields(regions: &mut Regions, types: &TypeRegistry, plan: &CompactionPlan, object: Address) {
    let type_id = regions.header(object).type_id;
    for &offset in types.references_of(type_id) {
        let slot = object.field(offset);
        let value = regions.read_address(slot);
        let target = plan.relocated(regions, value);
        if target != value {
            regions.write_address(slot, target);
        }
    }
}

impl HeapManager {
    /// Run a major collection of the old generation.
    ///
    /// Soft references are cleared only if memory pressure was signalled.
    /// Afterwards pressure is re-evaluated from old occupancy.
    pub fn collect_major(&mut self, roots: &mut dyn RootProvider) -> GcResult<GcCycleReport> {
        let pressure = self.references.memory_pressure();
        self.major_cycle(roots, pressure)
    }

    /// Major collection that clears unreached soft referents regardless of
    /// the pressure flag. Last resort before reporting out of memory.
    pub(crate) fn collect_major_under_pressure(
        &mut self,
        roots: &mut dyn RootProvider,
    ) -> GcResult<GcCycleReport> {
        self.major_cycle(roots, true)
    }

    fn major_cycle(&mut self, roots: &mut dyn RootProvider, pressure: bool) -> GcResult<GcCycleReport> {
        let start = Instant::now();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "gengc::gc",
            old_used = self.regions.old().used(),
            remembered = self.remembered_set.len(),
            pressure,
            "major GC starting"
        );

        // Phase 1: Mark
        let decisions = {
            let mut seeds = self.regions.eden().object_addresses();
            seeds.extend(self.regions.from_space().object_addresses());
            seeds.extend(self.regions.metaspace().object_addresses());

            let mut trace = MajorTrace {
                regions: &mut self.regions,
                types: &self.types,
                stack: Vec::new(),
            };
            roots.enumerate_roots(&mut |slot| trace.mark(*slot));
            for referent in self.references.strong_referents() {
                trace.mark(referent);
            }
            for object in seeds {
                trace.scan(object);
            }
            trace.drain();

            self.references.plan(&mut trace, pressure)?
        };
        let references_processed = decisions.len();
        self.references.apply(decisions);

        // Phase 2: Plan new addresses
        let plan = CompactionPlan::build(&self.regions);

        // Phase 3: Update references while old headers are still in place
        for &(object, _) in &plan.live {
            update_fields(&mut self.regions, &self.types, &plan, object);
        }
        let mut others = self.regions.eden().object_addresses();
        others.extend(self.regions.from_space().object_addresses());
        others.extend(self.regions.metaspace().object_addresses());
        for object in others {
            update_fields(&mut self.regions, &self.types, &plan, object);
        }
        roots.enumerate_roots(&mut |slot| *slot = plan.relocated(&self.regions, *slot));
        self.references
            .rewrite_referents(|addr| plan.relocated(&self.regions, addr));

        let regions = &self.regions;
        self.remembered_set.relocate(|slot| {
            if !regions.old().contains(slot) {
                return Some(slot);
            }
            let container = plan.container_of(slot)?;
            let moved = plan.forwarding.get(&container).copied().unwrap_or(container);
            Some(moved.offset(slot.distance_from(container)))
        });

        // Phase 4: Compact
        let old = self.regions.old_mut();
        for &(addr, size) in &plan.live {
            let target = plan.forwarding.get(&addr).copied().unwrap_or(addr);
            if target != addr {
                old.move_within(addr, target, size);
            }
            let mut header = old.header(target);
            header.marked = false;
            old.set_header(target, &header);
        }
        let new_top = old.base().offset(plan.live_bytes);
        old.set_top(new_top);

        let pressure_after = self.regions.old().occupancy() > self.config.soft_pressure_threshold;
        self.references.set_memory_pressure(pressure_after);

        let report = GcCycleReport {
            cycle: self.stats.collections() + 1,
            generation: CollectionKind::Major,
            bytes_reclaimed: plan.reclaimed_bytes,
            objects_relocated: plan.forwarding.len(),
            objects_promoted: 0,
            bytes_promoted: 0,
            live_bytes: plan.live_bytes,
            references_processed,
            pause: start.elapsed(),
        };

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "gengc::gc",
            cycle = report.cycle,
            reclaimed = report.bytes_reclaimed,
            dead_objects = plan.reclaimed_objects,
            relocated = report.objects_relocated,
            live = report.live_bytes,
            memory_pressure = pressure_after,
            pause_us = report.pause.as_micros() as u64,
            "major GC complete"
        );

        Ok(self.finish_cycle(report))
    }
}
