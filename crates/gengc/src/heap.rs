//! Heap manager
//!
//! [`HeapManager`] is the context object every operation goes through. It
//! owns the regions, the type table, the remembered set and the reference
//! registrations. There is no global heap; several managers can coexist.
//!
//! Mutual exclusion between mutator work and collection is expressed by
//! `&mut self`: a collection borrows the whole manager, so no mutator
//! operation can interleave with it. [`crate::shared::SharedHeap`] adds the
//! multi-threaded safepoint protocol on top.

use crate::allocator::Allocator;
use crate::barrier::{RememberedSet, generational_barrier};
use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::layout::{TypeDescriptor, TypeRegistry};
use crate::object::{Address, DescriptorId, HEADER_SIZE, ObjectHeader};
use crate::reference::{
    Notification, QueueId, QueuePolicy, RefHandle, RefState, ReferenceKind, ReferenceManager,
};
use crate::region::{RegionKind, Regions};
use crate::stats::{GcCycleReport, GcStats};
use crate::tenuring::TenuringPolicy;

/// Generational heap manager
pub struct HeapManager {
    pub(crate) config: HeapConfig,
    pub(crate) allocator: Allocator,
    pub(crate) regions: Regions,
    pub(crate) types: TypeRegistry,
    pub(crate) remembered_set: RememberedSet,
    pub(crate) references: ReferenceManager,
    pub(crate) tenuring: TenuringPolicy,
    pub(crate) stats: GcStats,
}

impl HeapManager {
    /// Create a heap with the default configuration
    pub fn new() -> Self {
        Self::build(HeapConfig::default())
    }

    /// Create a heap with a custom configuration
    pub fn with_config(config: HeapConfig) -> GcResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: HeapConfig) -> Self {
        Self {
            allocator: Allocator::new(&config),
            regions: Regions::new(&config),
            types: TypeRegistry::new(),
            remembered_set: RememberedSet::new(),
            references: ReferenceManager::new(),
            tenuring: TenuringPolicy::new(config.tenuring_threshold),
            stats: GcStats::new(),
            config,
        }
    }

    /// Get config
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Region layout
    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    /// Remembered set
    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered_set
    }

    /// Tenuring policy
    pub fn tenuring(&self) -> &TenuringPolicy {
        &self.tenuring
    }

    /// Cumulative statistics, including the last cycle report
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Verify the heap if configured, then record the cycle
    pub(crate) fn finish_cycle(&mut self, report: GcCycleReport) -> GcCycleReport {
        let verified = if self.config.verify_heap {
            self.verify()
        } else {
            Ok(())
        };
        if let Err(corruption) = verified {
            panic!(
                "heap corrupted after {:?} collection #{}: {corruption}",
                report.generation, report.cycle
            );
        }
        self.stats.record_cycle(report.clone());
        report
    }

    // =========================================================================
    // Types
    // =========================================================================

    /// Register an object type with the payload offsets of its reference fields
    pub fn register_type(&mut self, name: &str, reference_offsets: &[u32]) -> GcResult<DescriptorId> {
        self.types.register(name, reference_offsets)
    }

    /// Reference field offsets of a type
    pub fn object_layout(&self, type_id: DescriptorId) -> Option<&[u32]> {
        self.types.object_layout(type_id)
    }

    /// Type table
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Region holding `addr`
    pub fn region_of(&self, addr: Address) -> Option<RegionKind> {
        self.regions.locate(addr)
    }

    /// Whether `addr` is in young space
    pub fn is_young(&self, addr: Address) -> bool {
        self.regions.is_young(addr)
    }

    /// Check that `addr` looks like a live object and decode its header.
    ///
    /// Normally a cheap plausibility check. With `verify_heap` set the region
    /// is walked as well, so interior addresses are rejected.
    fn checked(&self, addr: Address) -> GcResult<(ObjectHeader, &TypeDescriptor)> {
        let kind = self.regions.locate(addr).ok_or(GcError::NotAnObject(addr))?;
        let region = self.regions.get(kind);
        if addr.distance_from(region.base()) + HEADER_SIZE > region.used() {
            return Err(GcError::NotAnObject(addr));
        }
        let header = region.header(addr);
        if header.size() < HEADER_SIZE
            || header.is_forwarded()
            || addr.offset(header.size()) > region.top()
        {
            return Err(GcError::NotAnObject(addr));
        }
        let descriptor = self.types.get(header.type_id).ok_or(GcError::NotAnObject(addr))?;
        if self.config.verify_heap && region.object_addresses().binary_search(&addr).is_err() {
            return Err(GcError::NotAnObject(addr));
        }
        Ok((header, descriptor))
    }

    /// Header of the object at `addr`
    pub fn header(&self, addr: Address) -> GcResult<ObjectHeader> {
        self.checked(addr).map(|(header, _)| header)
    }

    /// Read a reference field
    pub fn read_reference(&self, object: Address, offset: u32) -> GcResult<Address> {
        let (_, descriptor) = self.checked(object)?;
        if !descriptor.is_reference_offset(offset) {
            return Err(GcError::NotAReferenceField { object, offset });
        }
        Ok(self.regions.read_address(object.field(offset)))
    }

    /// Store a reference field through the write barrier
    pub fn write_reference(&mut self, object: Address, offset: u32, value: Address) -> GcResult<()> {
        let (_, descriptor) = self.checked(object)?;
        if !descriptor.is_reference_offset(offset) {
            return Err(GcError::NotAReferenceField { object, offset });
        }
        if !value.is_null() {
            self.checked(value)?;
        }
        self.write_barrier(object, object.field(offset), value);
        Ok(())
    }

    /// Store `value` into `slot` of `source` and record the slot if the store
    /// creates a tenured-to-young edge.
    ///
    /// The caller vouches that `slot` is a reference field of `source`;
    /// [`write_reference`](Self::write_reference) is the checked entry point.
    /// Whether the slot is remembered depends on where `slot` lives.
    pub fn write_barrier(&mut self, source: Address, slot: Address, value: Address) {
        debug_assert_eq!(
            self.regions.locate(source),
            self.regions.locate(slot),
            "slot {slot} outside the region of {source}"
        );
        self.regions.write_address(slot, value);
        generational_barrier(&self.regions, &mut self.remembered_set, slot, value);
    }

    fn data_range(&self, object: Address, offset: usize, len: usize) -> GcResult<()> {
        let (header, descriptor) = self.checked(object)?;
        let end = offset
            .checked_add(len)
            .ok_or(GcError::FieldOutOfBounds { object, offset, end: usize::MAX })?;
        if end > header.payload_size() || descriptor.overlaps_reference(offset, end) {
            return Err(GcError::FieldOutOfBounds { object, offset, end });
        }
        Ok(())
    }

    /// Read non-reference payload bytes
    pub fn read_data(&self, object: Address, offset: usize, len: usize) -> GcResult<&[u8]> {
        self.data_range(object, offset, len)?;
        Ok(self.regions.bytes(object.offset(HEADER_SIZE + offset), len))
    }

    /// Write non-reference payload bytes
    pub fn write_data(&mut self, object: Address, offset: usize, data: &[u8]) -> GcResult<()> {
        self.data_range(object, offset, data.len())?;
        self.regions
            .bytes_mut(object.offset(HEADER_SIZE + offset), data.len())
            .copy_from_slice(data);
        Ok(())
    }

    /// Read a little-endian `u64` from the payload
    pub fn read_u64(&self, object: Address, offset: usize) -> GcResult<u64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.read_data(object, offset, 8)?);
        Ok(u64::from_le_bytes(word))
    }

    /// Write a little-endian `u64` into the payload
    pub fn write_u64(&mut self, object: Address, offset: usize, value: u64) -> GcResult<()> {
        self.write_data(object, offset, &value.to_le_bytes())
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Create a notification queue
    pub fn create_queue(&mut self, policy: QueuePolicy) -> QueueId {
        self.references.create_queue(policy)
    }

    /// Register a reference to `referent`, notifying `queue` (or the default queue)
    pub fn register_reference(
        &mut self,
        kind: ReferenceKind,
        referent: Address,
        queue: Option<QueueId>,
    ) -> GcResult<RefHandle> {
        if referent.is_null() {
            return Err(GcError::NullReferent);
        }
        self.checked(referent)?;
        self.references.register(kind, referent, queue)
    }

    /// Current referent; `None` once cleared and always for phantom references
    pub fn get_reference(&self, handle: RefHandle) -> GcResult<Option<Address>> {
        self.references.get(handle)
    }

    /// Clear a reference
    pub fn clear_reference(&mut self, handle: RefHandle) -> GcResult<()> {
        self.references.clear(handle)
    }

    /// Drop a registration
    pub fn unregister_reference(&mut self, handle: RefHandle) -> GcResult<()> {
        self.references.unregister(handle)
    }

    /// Lifecycle state of a reference
    pub fn reference_state(&self, handle: RefHandle) -> GcResult<RefState> {
        self.references.state(handle)
    }

    /// Take the oldest notification from a queue
    pub fn poll_queue(&mut self, queue: QueueId) -> GcResult<Option<Notification>> {
        self.references.poll(queue)
    }

    /// Reference registrations
    pub fn references(&self) -> &ReferenceManager {
        &self.references
    }

    /// Signal or withdraw memory pressure for soft references
    pub fn set_memory_pressure(&mut self, pressure: bool) {
        self.references.set_memory_pressure(pressure);
    }

    /// Whether soft references will be cleared by the next cycle
    pub fn memory_pressure(&self) -> bool {
        self.references.memory_pressure()
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapManager")
            .field("eden_used", &self.regions.eden().used())
            .field("survivor_used", &self.regions.from_space().used())
            .field("old_used", &self.regions.old().used())
            .field("remembered", &self.remembered_set.len())
            .field("references", &self.references.len())
            .finish()
    }
}
