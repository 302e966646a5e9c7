//! Heap verification
//!
//! Walks every region and checks the invariants the collectors rely on.
//! Run after each cycle when [`HeapConfig::verify_heap`] is set.
//!
//! [`HeapConfig::verify_heap`]: crate::config::HeapConfig::verify_heap

use rustc_hash::FxHashSet;

use crate::error::HeapCorruption;
use crate::heap::HeapManager;
use crate::object::{Address, HEADER_SIZE, OBJECT_ALIGNMENT};
use crate::region::{Region, RegionKind};

impl HeapManager {
    /// Check every heap invariant, stopping at the first violation
    pub fn verify(&self) -> Result<(), HeapCorruption> {
        // Phase 1: Headers and object extents
        let mut starts = FxHashSet::default();
        for region in self.regions.iter() {
            self.verify_extents(region, &mut starts)?;
        }

        // Phase 2: Reference fields and the remembered set
        for region in self.regions.iter() {
            let tenured = region.kind().is_tenured();
            for object in region.object_addresses() {
                let type_id = region.header(object).type_id;
                for &offset in self.types.references_of(type_id) {
                    let slot = object.field(offset);
                    let target = region.read_address(slot);
                    if target.is_null() {
                        continue;
                    }
                    if !starts.contains(&target) {
                        return Err(HeapCorruption::DanglingField {
                            object,
                            slot,
                            target,
                        });
                    }
                    if tenured
                        && self.regions.is_young(target)
                        && !self.remembered_set.contains(slot)
                    {
                        return Err(HeapCorruption::UnrememberedSlot { slot, target });
                    }
                }
            }
        }

        for slot in self.remembered_set.slots() {
            if !self.regions.old().contains_allocated(slot)
                && !self.regions.metaspace().contains_allocated(slot)
            {
                return Err(HeapCorruption::StrayRememberedSlot(slot));
            }
        }

        // Phase 3: Reference registrations
        for (handle, target) in self.references.referents() {
            if !starts.contains(&target) {
                return Err(HeapCorruption::DanglingReferent { handle, target });
            }
        }

        Ok(())
    }

    fn verify_extents(
        &self,
        region: &Region,
        starts: &mut FxHashSet<Address>,
    ) -> Result<(), HeapCorruption> {
        let malformed = |address, reason| HeapCorruption::MalformedHeader { address, reason };
        let used = region.used();
        let mut offset = 0;
        let mut last = region.base();

        while offset < used {
            let address = region.base().offset(offset);
            if used - offset < HEADER_SIZE {
                return Err(malformed(address, "header truncated by the free pointer"));
            }
            let header = region.header(address);
            let size = header.size();
            if size < HEADER_SIZE {
                return Err(malformed(address, "size smaller than a header"));
            }
            if size % OBJECT_ALIGNMENT != 0 {
                return Err(malformed(address, "size not aligned"));
            }
            let Some(descriptor) = self.types.get(header.type_id) else {
                return Err(malformed(address, "unknown type"));
            };
            if size < descriptor.min_object_size() {
                return Err(malformed(address, "too small for its type"));
            }
            if header.is_forwarded() {
                return Err(HeapCorruption::StaleForwarding {
                    address,
                    forwarding: header.forwarding,
                });
            }
            if header.marked {
                return Err(HeapCorruption::StaleMark(address));
            }

            starts.insert(address);
            last = address;
            offset += size;
        }

        if offset != used {
            if region.kind() == RegionKind::Old {
                return Err(HeapCorruption::OldGenerationGap {
                    walked: region.base().offset(offset),
                    top: region.top(),
                });
            }
            return Err(malformed(last, "object extends past the free pointer"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::{DescriptorId, ObjectHeader};
    use crate::reference::ReferenceKind;

    fn heap() -> (HeapManager, DescriptorId) {
        let mut heap = HeapManager::with_config(HeapConfig::small()).unwrap();
        let node = heap.register_type("Node", &[0]).unwrap();
        (heap, node)
    }

    #[test]
    fn test_consistent_heap_verifies() {
        let (mut heap, node) = heap();
        let old = heap.allocate(2048, node).unwrap();
        let young = heap.allocate(32, node).unwrap();
        heap.write_reference(old, 0, young).unwrap();
        heap.register_reference(ReferenceKind::Weak, young, None).unwrap();
        heap.verify().unwrap();
    }

    #[test]
    fn test_unremembered_old_to_young_pointer() {
        let (mut heap, node) = heap();
        let old = heap.allocate(2048, node).unwrap();
        let young = heap.allocate(32, node).unwrap();
        // Raw store, bypassing the barrier
        heap.regions.write_address(old.field(0), young);

        assert_eq!(
            heap.verify(),
            Err(HeapCorruption::UnrememberedSlot {
                slot: old.field(0),
                target: young
            })
        );
    }

    #[test]
    fn test_dangling_field() {
        let (mut heap, node) = heap();
        let a = heap.allocate(32, node).unwrap();
        let inside = a.offset(8);
        heap.regions.write_address(a.field(0), inside);

        assert!(matches!(
            heap.verify(),
            Err(HeapCorruption::DanglingField { target, .. }) if target == inside
        ));
    }

    #[test]
    fn test_stale_mark_and_forwarding() {
        let (mut heap, node) = heap();
        let a = heap.allocate(32, node).unwrap();

        let mut header = heap.regions.header(a);
        header.marked = true;
        heap.regions.set_header(a, &header);
        assert_eq!(heap.verify(), Err(HeapCorruption::StaleMark(a)));

        let mut header = ObjectHeader::new(32, node);
        header.forwarding = a;
        heap.regions.set_header(a, &header);
        assert!(matches!(
            heap.verify(),
            Err(HeapCorruption::StaleForwarding { .. })
        ));
    }

    #[test]
    fn test_stray_remembered_slot() {
        let (mut heap, _) = heap();
        let eden = heap.regions().eden().base();
        heap.remembered_set.add(eden);
        assert_eq!(heap.verify(), Err(HeapCorruption::StrayRememberedSlot(eden)));
    }

    #[test]
    fn test_old_generation_gap() {
        let (mut heap, node) = heap();
        let a = heap.allocate(2048, node).unwrap();
        heap.regions.set_header(a, &ObjectHeader::new(4096, node));
        assert!(matches!(
            heap.verify(),
            Err(HeapCorruption::OldGenerationGap { .. })
        ));
    }
}
