//! Bump allocation
//!
//! Small objects are bump-allocated in eden. Objects above the large object
//! threshold, or too big for eden altogether, are placed directly in the old
//! generation so their payload is never copied through the survivors.

use crate::config::HeapConfig;
use crate::error::{AllocationFailure, GcError, GcResult};
use crate::heap::HeapManager;
use crate::object::{Address, DescriptorId, HEADER_SIZE, ObjectHeader, align_object_size};
use crate::region::Region;

/// Where a new object is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Eden, the normal case
    Eden,
    /// Directly in the old generation
    Old,
}

/// Allocation placement policy
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    large_object_threshold: usize,
    eden_capacity: usize,
}

impl Allocator {
    /// Create the policy for a heap configuration
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            large_object_threshold: config.large_object_threshold,
            eden_capacity: config.eden_size,
        }
    }

    /// Placement of an object of `size` aligned bytes
    #[inline]
    pub fn placement(&self, size: usize) -> Placement {
        if size > self.large_object_threshold || size > self.eden_capacity {
            Placement::Old
        } else {
            Placement::Eden
        }
    }
}

/// Bump `size` bytes in `region` and write a fresh header there
fn place(region: &mut Region, size: usize, type_id: DescriptorId) -> Option<Address> {
    let addr = region.bump(size)?;
    region.set_header(addr, &ObjectHeader::new(size as u32, type_id));
    Some(addr)
}

impl HeapManager {
    /// Check the request against the type's layout and return the aligned size
    fn aligned_request(&self, size: usize, type_id: DescriptorId) -> GcResult<usize> {
        let descriptor = self.types.expect(type_id)?;
        let minimum = descriptor.min_object_size().max(HEADER_SIZE);
        if size < minimum || size > u32::MAX as usize {
            return Err(GcError::InvalidSize {
                size,
                minimum,
                type_id,
            });
        }
        Ok(align_object_size(size))
    }

    /// Allocate an object of `size` bytes, header included.
    ///
    /// This is the fast path only: it never collects. Exhaustion is
    /// reported as [`AllocationFailure::EdenFull`] or
    /// [`AllocationFailure::OldFull`]; see
    /// [`allocate_with_gc`](Self::allocate_with_gc) for the collecting path.
    /// The payload starts zeroed, so every reference field is null.
    pub fn allocate(&mut self, size: usize, type_id: DescriptorId) -> GcResult<Address> {
        let size = self.aligned_request(size, type_id)?;
        let addr = match self.allocator.placement(size) {
            Placement::Eden => place(self.regions.eden_mut(), size, type_id)
                .ok_or(AllocationFailure::EdenFull)?,
            Placement::Old => place(self.regions.old_mut(), size, type_id)
                .ok_or(AllocationFailure::OldFull)?,
        };
        self.stats.record_allocation(size);
        Ok(addr)
    }

    /// Allocate a permanent object in metaspace.
    ///
    /// Metaspace is never collected. Its reference fields are roots of
    /// every collection and its stores go through the write barrier.
    pub fn allocate_permanent(&mut self, size: usize, type_id: DescriptorId) -> GcResult<Address> {
        let size = self.aligned_request(size, type_id)?;
        let addr = place(self.regions.metaspace_mut(), size, type_id)
            .ok_or(AllocationFailure::OutOfMemory { requested: size })?;
        self.stats.record_allocation(size);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;

    fn heap(config: HeapConfig) -> (HeapManager, DescriptorId) {
        let mut heap = HeapManager::with_config(config).unwrap();
        let ty = heap.register_type("Blob", &[]).unwrap();
        (heap, ty)
    }

    #[test]
    fn test_bump_in_eden() {
        let (mut heap, ty) = heap(HeapConfig::small());
        let a = heap.allocate(100, ty).unwrap();
        let b = heap.allocate(100, ty).unwrap();

        assert_eq!(a, heap.regions().eden().base());
        assert_eq!(b, a.offset(100));
        assert_eq!(heap.regions().eden().used(), 200);
        assert_eq!(heap.header(b).unwrap().size, 100);
        assert_eq!(heap.stats().objects_allocated, 2);
    }

    #[test]
    fn test_sizes_are_aligned() {
        let (mut heap, ty) = heap(HeapConfig::small());
        let a = heap.allocate(17, ty).unwrap();
        assert_eq!(heap.header(a).unwrap().size, 20);
    }

    #[test]
    fn test_eden_full() {
        let (mut heap, ty) = heap(HeapConfig::small().with_eden_size(1000));
        for _ in 0..10 {
            heap.allocate(100, ty).unwrap();
        }
        assert_eq!(
            heap.allocate(100, ty),
            Err(GcError::Allocation(AllocationFailure::EdenFull))
        );
    }

    #[test]
    fn test_large_objects_go_to_old() {
        let (mut heap, ty) = heap(HeapConfig::small());
        let threshold = heap.config().large_object_threshold;
        let small = heap.allocate(threshold, ty).unwrap();
        let large = heap.allocate(threshold + 4, ty).unwrap();

        assert_eq!(heap.region_of(small), Some(RegionKind::Eden));
        assert_eq!(heap.region_of(large), Some(RegionKind::Old));
    }

    #[test]
    fn test_old_full() {
        let config = HeapConfig::small().with_old_size(2048);
        let (mut heap, ty) = heap(config);
        heap.allocate(2000, ty).unwrap();
        assert_eq!(
            heap.allocate(1100, ty),
            Err(GcError::Allocation(AllocationFailure::OldFull))
        );
    }

    #[test]
    fn test_invalid_requests() {
        let (mut heap, ty) = heap(HeapConfig::small());
        assert!(matches!(
            heap.allocate(8, ty),
            Err(GcError::InvalidSize { minimum: 16, .. })
        ));
        assert_eq!(
            heap.allocate(64, DescriptorId(42)),
            Err(GcError::UnknownType(DescriptorId(42)))
        );

        let pair = heap.register_type("Pair", &[0, 8]).unwrap();
        assert!(matches!(
            heap.allocate(24, pair),
            Err(GcError::InvalidSize { minimum: 32, .. })
        ));
    }

    #[test]
    fn test_permanent_allocation() {
        let (mut heap, ty) = heap(HeapConfig::small());
        let meta = heap.allocate_permanent(64, ty).unwrap();
        assert_eq!(heap.region_of(meta), Some(RegionKind::Metaspace));
        assert!(heap.allocate_permanent(2048, ty).unwrap_err().is_out_of_memory());
    }
}
