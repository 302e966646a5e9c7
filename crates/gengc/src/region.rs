//! Heap regions
//!
//! All regions live in one address space so an address alone identifies its
//! region. Layout, ascending: metaspace, eden, survivor A, survivor B, old.
//! Unmapped gaps separate neighbours and the space starts above zero, so
//! [`Address::NULL`] and one-past-the-end addresses never alias an object.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::HeapConfig;
use crate::object::{Address, HEADER_SIZE, ObjectHeader, REFERENCE_SIZE};

/// Start of the first region
const SPACE_BASE: u64 = 0x10_000;

/// Region bases are aligned to this and separated by one such gap
const REGION_GRANULE: u64 = 0x1000;

/// Kind of a heap region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// Where new objects are allocated
    Eden,
    /// First survivor region
    SurvivorA,
    /// Second survivor region
    SurvivorB,
    /// Tenured objects
    Old,
    /// Permanent objects, never collected
    Metaspace,
}

impl RegionKind {
    /// Whether objects in this region belong to the young generation
    pub const fn is_young(self) -> bool {
        matches!(
            self,
            RegionKind::Eden | RegionKind::SurvivorA | RegionKind::SurvivorB
        )
    }

    /// Whether stores from this region into young space must be remembered
    pub const fn is_tenured(self) -> bool {
        matches!(self, RegionKind::Old | RegionKind::Metaspace)
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionKind::Eden => "eden",
            RegionKind::SurvivorA => "survivor-a",
            RegionKind::SurvivorB => "survivor-b",
            RegionKind::Old => "old",
            RegionKind::Metaspace => "metaspace",
        };
        f.write_str(name)
    }
}

/// A contiguous bump-allocated region
pub struct Region {
    kind: RegionKind,
    base: Address,
    /// Backing memory
    memory: Vec<u8>,
    /// Free pointer, as an offset from `base`
    top: usize,
}

impl Region {
    /// Create an empty region
    pub fn new(kind: RegionKind, base: Address, capacity: usize) -> Self {
        Self {
            kind,
            base,
            memory: vec![0u8; capacity],
            top: 0,
        }
    }

    /// Region kind
    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// First address of the region
    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    /// One past the last address of the region
    #[inline]
    pub fn limit(&self) -> Address {
        self.base.offset(self.memory.len())
    }

    /// Current free pointer
    #[inline]
    pub fn top(&self) -> Address {
        self.base.offset(self.top)
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes in use
    #[inline]
    pub fn used(&self) -> usize {
        self.top
    }

    /// Bytes still available
    #[inline]
    pub fn free(&self) -> usize {
        self.memory.len() - self.top
    }

    /// Used fraction of the capacity
    pub fn occupancy(&self) -> f64 {
        if self.memory.is_empty() {
            return 0.0;
        }
        self.top as f64 / self.memory.len() as f64
    }

    /// Whether `addr` falls inside the region's address range
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.limit()
    }

    /// Whether `addr` falls inside the allocated prefix
    #[inline]
    pub fn contains_allocated(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.top()
    }

    /// Bump-allocate `size` bytes. Memory is already zeroed.
    pub fn bump(&mut self, size: usize) -> Option<Address> {
        if size > self.free() {
            return None;
        }
        let addr = self.top();
        self.top += size;
        Some(addr)
    }

    /// Move the free pointer, zeroing anything released above it
    pub fn set_top(&mut self, top: Address) {
        let new_top = top.distance_from(self.base);
        assert!(new_top <= self.memory.len(), "free pointer beyond {} limit", self.kind);
        if new_top < self.top {
            self.memory[new_top..self.top].fill(0);
        }
        self.top = new_top;
    }

    /// Release everything
    pub fn reset(&mut self) {
        self.memory[..self.top].fill(0);
        self.top = 0;
    }

    #[inline]
    fn index(&self, addr: Address, len: usize) -> std::ops::Range<usize> {
        let start = addr.distance_from(self.base);
        debug_assert!(start + len <= self.memory.len(), "{addr} out of {} bounds", self.kind);
        start..start + len
    }

    /// Bytes at `addr`
    #[inline]
    pub fn bytes(&self, addr: Address, len: usize) -> &[u8] {
        &self.memory[self.index(addr, len)]
    }

    /// Mutable bytes at `addr`
    #[inline]
    pub fn bytes_mut(&mut self, addr: Address, len: usize) -> &mut [u8] {
        let range = self.index(addr, len);
        &mut self.memory[range]
    }

    /// Read a reference slot
    #[inline]
    pub fn read_address(&self, slot: Address) -> Address {
        let mut word = [0u8; REFERENCE_SIZE];
        word.copy_from_slice(self.bytes(slot, REFERENCE_SIZE));
        Address::new(u64::from_le_bytes(word))
    }

    /// Write a reference slot
    #[inline]
    pub fn write_address(&mut self, slot: Address, value: Address) {
        self.bytes_mut(slot, REFERENCE_SIZE)
            .copy_from_slice(&value.as_u64().to_le_bytes());
    }

    /// Decode the header of the object at `addr`
    #[inline]
    pub fn header(&self, addr: Address) -> ObjectHeader {
        ObjectHeader::decode(self.bytes(addr, HEADER_SIZE))
    }

    /// Overwrite the header of the object at `addr`
    #[inline]
    pub fn set_header(&mut self, addr: Address, header: &ObjectHeader) {
        self.bytes_mut(addr, HEADER_SIZE)
            .copy_from_slice(&header.encode());
    }

    /// Slide `len` bytes from `from` down to `to` within this region
    pub fn move_within(&mut self, from: Address, to: Address, len: usize) {
        let src = from.distance_from(self.base);
        let dst = to.distance_from(self.base);
        self.memory.copy_within(src..src + len, dst);
    }

    /// Addresses of all objects in the allocated prefix, in address order.
    ///
    /// The walk relies on every extent starting with a header.
    pub fn object_addresses(&self) -> Vec<Address> {
        let mut objects = Vec::new();
        let mut offset = 0;
        while offset < self.top {
            let addr = self.base.offset(offset);
            let size = self.header(addr).size();
            assert!(size >= HEADER_SIZE, "zero-sized object at {addr} in {}", self.kind);
            objects.push(addr);
            offset += size;
        }
        objects
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("top", &self.top())
            .field("limit", &self.limit())
            .finish()
    }
}

/// The full set of regions with survivor role tracking
#[derive(Debug)]
pub struct Regions {
    metaspace: Region,
    eden: Region,
    survivors: [Region; 2],
    /// Index of the survivor holding the current survivors ("from")
    active: usize,
    old: Region,
}

impl Regions {
    /// Lay out all regions for `config`
    pub fn new(config: &HeapConfig) -> Self {
        let mut next = Address::new(SPACE_BASE);
        let mut carve = |kind: RegionKind, size: usize| {
            let region = Region::new(kind, next, size);
            let end = region.limit().as_u64();
            let aligned = end.div_ceil(REGION_GRANULE) * REGION_GRANULE;
            next = Address::new(aligned + REGION_GRANULE);
            region
        };

        let metaspace = carve(RegionKind::Metaspace, config.metaspace_size);
        let eden = carve(RegionKind::Eden, config.eden_size);
        let survivor_a = carve(RegionKind::SurvivorA, config.survivor_size);
        let survivor_b = carve(RegionKind::SurvivorB, config.survivor_size);
        let old = carve(RegionKind::Old, config.old_size);

        Self {
            metaspace,
            eden,
            survivors: [survivor_a, survivor_b],
            active: 0,
            old,
        }
    }

    /// Eden
    #[inline]
    pub fn eden(&self) -> &Region {
        &self.eden
    }

    /// Old generation
    #[inline]
    pub fn old(&self) -> &Region {
        &self.old
    }

    /// Metaspace
    #[inline]
    pub fn metaspace(&self) -> &Region {
        &self.metaspace
    }

    /// Survivor holding objects that survived the last minor collection
    #[inline]
    pub fn from_space(&self) -> &Region {
        &self.survivors[self.active]
    }

    /// Empty survivor that receives copies during the next minor collection
    #[inline]
    pub fn to_space(&self) -> &Region {
        &self.survivors[1 - self.active]
    }

    /// Exchange survivor roles after a minor collection
    pub fn swap_survivors(&mut self) {
        self.active = 1 - self.active;
    }

    /// Region by kind
    pub fn get(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::Eden => &self.eden,
            RegionKind::SurvivorA => &self.survivors[0],
            RegionKind::SurvivorB => &self.survivors[1],
            RegionKind::Old => &self.old,
            RegionKind::Metaspace => &self.metaspace,
        }
    }

    /// Mutable region by kind
    pub fn get_mut(&mut self, kind: RegionKind) -> &mut Region {
        match kind {
            RegionKind::Eden => &mut self.eden,
            RegionKind::SurvivorA => &mut self.survivors[0],
            RegionKind::SurvivorB => &mut self.survivors[1],
            RegionKind::Old => &mut self.old,
            RegionKind::Metaspace => &mut self.metaspace,
        }
    }

    /// All regions in address order
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        [
            &self.metaspace,
            &self.eden,
            &self.survivors[0],
            &self.survivors[1],
            &self.old,
        ]
        .into_iter()
    }

    /// Region whose address range contains `addr`
    pub fn locate(&self, addr: Address) -> Option<RegionKind> {
        self.iter().find(|r| r.contains(addr)).map(Region::kind)
    }

    /// Whether `addr` is in young space (eden or either survivor)
    #[inline]
    pub fn is_young(&self, addr: Address) -> bool {
        self.eden.contains(addr) || self.survivors.iter().any(|s| s.contains(addr))
    }

    /// Whether `addr` is in the space a minor collection evacuates
    #[inline]
    pub fn is_evacuated(&self, addr: Address) -> bool {
        self.eden.contains(addr) || self.from_space().contains(addr)
    }

    /// Whether `addr` is in old space or metaspace
    #[inline]
    pub fn is_tenured(&self, addr: Address) -> bool {
        self.old.contains(addr) || self.metaspace.contains(addr)
    }

    fn region_for(&self, addr: Address) -> &Region {
        match self.locate(addr) {
            Some(kind) => self.get(kind),
            None => panic!("{addr} is outside every heap region"),
        }
    }

    fn region_for_mut(&mut self, addr: Address) -> &mut Region {
        match self.locate(addr) {
            Some(kind) => self.get_mut(kind),
            None => panic!("{addr} is outside every heap region"),
        }
    }

    /// Decode the header at `addr`
    #[inline]
    pub fn header(&self, addr: Address) -> ObjectHeader {
        self.region_for(addr).header(addr)
    }

    /// Overwrite the header at `addr`
    #[inline]
    pub fn set_header(&mut self, addr: Address, header: &ObjectHeader) {
        self.region_for_mut(addr).set_header(addr, header);
    }

    /// Read a reference slot anywhere in the heap
    #[inline]
    pub fn read_address(&self, slot: Address) -> Address {
        self.region_for(slot).read_address(slot)
    }

    /// Write a reference slot anywhere in the heap
    #[inline]
    pub fn write_address(&mut self, slot: Address, value: Address) {
        self.region_for_mut(slot).write_address(slot, value);
    }

    /// Raw bytes anywhere in the heap
    #[inline]
    pub fn bytes(&self, addr: Address, len: usize) -> &[u8] {
        self.region_for(addr).bytes(addr, len)
    }

    /// Mutable raw bytes anywhere in the heap
    #[inline]
    pub fn bytes_mut(&mut self, addr: Address, len: usize) -> &mut [u8] {
        self.region_for_mut(addr).bytes_mut(addr, len)
    }

    /// Copy an object's bytes between regions
    pub fn copy_object(&mut self, from: Address, to: Address, size: usize) {
        let bytes = self.bytes(from, size).to_vec();
        self.bytes_mut(to, size).copy_from_slice(&bytes);
    }

    /// Mutable eden
    pub(crate) fn eden_mut(&mut self) -> &mut Region {
        &mut self.eden
    }

    /// Mutable old generation
    pub(crate) fn old_mut(&mut self) -> &mut Region {
        &mut self.old
    }

    /// Mutable metaspace
    pub(crate) fn metaspace_mut(&mut self) -> &mut Region {
        &mut self.metaspace
    }

    /// Mutable from-space
    pub(crate) fn from_space_mut(&mut self) -> &mut Region {
        &mut self.survivors[self.active]
    }

    /// Mutable to-space
    pub(crate) fn to_space_mut(&mut self) -> &mut Region {
        &mut self.survivors[1 - self.active]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::DescriptorId;

    fn regions() -> Regions {
        Regions::new(&HeapConfig::small())
    }

    #[test]
    fn test_layout_is_ascending_and_disjoint() {
        let regions = regions();
        let all: Vec<&Region> = regions.iter().collect();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[0].limit() < pair[1].base());
        }
        assert!(regions.locate(Address::NULL).is_none());
        assert!(regions.locate(regions.eden().limit()).is_none());
    }

    #[test]
    fn test_bump_allocation() {
        let mut region = Region::new(RegionKind::Eden, Address::new(0x1000), 64);
        let a = region.bump(32).unwrap();
        let b = region.bump(32).unwrap();
        assert_eq!(a, Address::new(0x1000));
        assert_eq!(b, Address::new(0x1020));
        assert!(region.bump(4).is_none());
        assert_eq!(region.free(), 0);

        region.reset();
        assert_eq!(region.used(), 0);
        assert_eq!(region.top(), region.base());
    }

    #[test]
    fn test_object_walk() {
        let mut region = Region::new(RegionKind::Old, Address::new(0x1000), 128);
        for size in [16u32, 40, 24] {
            let addr = region.bump(size as usize).unwrap();
            region.set_header(addr, &ObjectHeader::new(size, DescriptorId(0)));
        }
        let walked = region.object_addresses();
        assert_eq!(
            walked,
            vec![Address::new(0x1000), Address::new(0x1010), Address::new(0x1038)]
        );
    }

    #[test]
    fn test_survivor_roles_swap() {
        let mut regions = regions();
        let from = regions.from_space().kind();
        let to = regions.to_space().kind();
        regions.swap_survivors();
        assert_eq!(regions.from_space().kind(), to);
        assert_eq!(regions.to_space().kind(), from);
    }

    #[test]
    fn test_set_top_zeroes_tail() {
        let mut region = Region::new(RegionKind::Old, Address::new(0x1000), 64);
        let addr = region.bump(32).unwrap();
        region.write_address(addr.offset(16), Address::new(0xdead));
        region.set_top(addr.offset(16));
        assert_eq!(region.used(), 16);
        assert_eq!(region.read_address(addr.offset(16)), Address::NULL);
    }
}
