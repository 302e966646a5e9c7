//! Generational write barrier and remembered set
//!
//! Minor collections never scan the old generation. Instead, every store of
//! a young address into an old (or metaspace) object records the slot here,
//! and the recorded slots act as extra roots for the next minor collection.

use rustc_hash::FxHashSet;

use crate::object::Address;
use crate::region::Regions;

/// Remembered set of tenured slots that may hold young addresses
///
/// Entries are slot addresses, not object addresses, so a minor collection
/// can rewrite the exact field. Stale entries (slot no longer pointing into
/// young space) are tolerated and pruned by the collectors.
#[derive(Debug, Default)]
pub struct RememberedSet {
    slots: FxHashSet<Address>,
}

impl RememberedSet {
    /// Create a new remembered set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a slot. Duplicate inserts are harmless.
    #[inline]
    pub fn add(&mut self, slot: Address) {
        self.slots.insert(slot);
    }

    /// Forget a slot
    pub fn remove(&mut self, slot: Address) {
        self.slots.remove(&slot);
    }

    /// Check if a slot is recorded
    pub fn contains(&self, slot: Address) -> bool {
        self.slots.contains(&slot)
    }

    /// All recorded slots, in address order
    pub fn slots(&self) -> Vec<Address> {
        let mut slots: Vec<Address> = self.slots.iter().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// Keep only slots for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(Address) -> bool) {
        self.slots.retain(|&slot| keep(slot));
    }

    /// Replace every slot with the result of `relocate`, dropping `None`s
    pub fn relocate(&mut self, mut relocate: impl FnMut(Address) -> Option<Address>) {
        self.slots = self.slots.iter().filter_map(|&slot| relocate(slot)).collect();
    }

    /// Clear the set
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Generational barrier
///
/// Called after `value` was stored into `slot`. Records the slot when the
/// store creates a tenured-to-young edge. Stores into young slots and stores
/// of null or tenured values take the fast path.
#[inline]
pub fn generational_barrier(
    regions: &Regions,
    remembered_set: &mut RememberedSet,
    slot: Address,
    value: Address,
) -> bool {
    if value.is_null() || !regions.is_young(value) {
        return false;
    }
    if !regions.is_tenured(slot) {
        return false;
    }
    remembered_set.add(slot);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    #[test]
    fn test_remembered_set_is_idempotent() {
        let mut rs = RememberedSet::new();
        let slot = Address::new(0x4010);

        rs.add(slot);
        rs.add(slot);
        assert_eq!(rs.len(), 1);
        assert!(rs.contains(slot));

        rs.remove(slot);
        assert!(rs.is_empty());
    }

    #[test]
    fn test_relocate_and_retain() {
        let mut rs = RememberedSet::new();
        rs.add(Address::new(0x100));
        rs.add(Address::new(0x200));
        rs.add(Address::new(0x300));

        rs.relocate(|slot| (slot != Address::new(0x200)).then(|| slot.offset(8)));
        assert_eq!(rs.slots(), vec![Address::new(0x108), Address::new(0x308)]);

        rs.retain(|slot| slot < Address::new(0x200));
        assert_eq!(rs.slots(), vec![Address::new(0x108)]);
    }

    #[test]
    fn test_barrier_records_only_tenured_to_young() {
        let regions = Regions::new(&HeapConfig::small());
        let mut rs = RememberedSet::new();
        let old = regions.old().base();
        let meta = regions.metaspace().base();
        let eden = regions.eden().base();
        let survivor = regions.from_space().base();

        // Old -> young is recorded
        assert!(generational_barrier(&regions, &mut rs, old.field(0), eden));
        // Metaspace -> survivor is recorded
        assert!(generational_barrier(&regions, &mut rs, meta.field(8), survivor));
        // Young -> anything is not
        assert!(!generational_barrier(&regions, &mut rs, eden.field(0), old));
        assert!(!generational_barrier(&regions, &mut rs, eden.field(0), survivor));
        // Old -> old and null stores are not
        assert!(!generational_barrier(&regions, &mut rs, old.field(8), old));
        assert!(!generational_barrier(&regions, &mut rs, old.field(8), Address::NULL));

        assert_eq!(rs.slots(), vec![meta.field(8), old.field(0)]);
    }
}
