//! Type descriptor table
//!
//! The collector never guesses which payload words are references. Every
//! type is registered up front with the payload offsets of its reference
//! fields, and scanning reads them from here.

use crate::error::{GcError, GcResult};
use crate::object::{DescriptorId, HEADER_SIZE, REFERENCE_SIZE};

/// Layout of one object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Descriptor id stored in object headers
    pub id: DescriptorId,
    /// Human readable name, for diagnostics
    pub name: String,
    /// Payload offsets of reference fields, ascending
    pub reference_offsets: Vec<u32>,
}

impl TypeDescriptor {
    /// Smallest object size that holds a header plus all reference fields
    pub fn min_object_size(&self) -> usize {
        HEADER_SIZE
            + self
                .reference_offsets
                .last()
                .map_or(0, |&last| last as usize + REFERENCE_SIZE)
    }

    /// Whether `offset` starts a reference field
    pub fn is_reference_offset(&self, offset: u32) -> bool {
        self.reference_offsets.binary_search(&offset).is_ok()
    }

    /// Whether the payload range overlaps any reference field
    pub fn overlaps_reference(&self, start: usize, end: usize) -> bool {
        self.reference_offsets.iter().any(|&offset| {
            let field_start = offset as usize;
            field_start < end && start < field_start + REFERENCE_SIZE
        })
    }
}

/// Registry of type descriptors, indexed by id
#[derive(Debug, Default)]
pub struct TypeRegistry {
    descriptors: Vec<TypeDescriptor>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type.
    ///
    /// Offsets must be ascending and at least a reference apart.
    pub fn register(&mut self, name: &str, reference_offsets: &[u32]) -> GcResult<DescriptorId> {
        for pair in reference_offsets.windows(2) {
            if pair[1] < pair[0] + REFERENCE_SIZE as u32 {
                return Err(GcError::invalid_layout(
                    name,
                    format!("offsets {} and {} overlap or are unsorted", pair[0], pair[1]),
                ));
            }
        }
        let end = reference_offsets
            .last()
            .map_or(0, |&last| last as usize + REFERENCE_SIZE);
        if end + HEADER_SIZE > u32::MAX as usize {
            return Err(GcError::invalid_layout(name, "offset exceeds object size limit"));
        }

        let id = u16::try_from(self.descriptors.len())
            .map(DescriptorId)
            .map_err(|_| GcError::invalid_layout(name, "type table is full"))?;
        self.descriptors.push(TypeDescriptor {
            id,
            name: name.to_string(),
            reference_offsets: reference_offsets.to_vec(),
        });
        Ok(id)
    }

    /// Look up a descriptor
    #[inline]
    pub fn get(&self, id: DescriptorId) -> Option<&TypeDescriptor> {
        self.descriptors.get(id.0 as usize)
    }

    /// Look up a descriptor or fail with `UnknownType`
    pub fn expect(&self, id: DescriptorId) -> GcResult<&TypeDescriptor> {
        self.get(id).ok_or(GcError::UnknownType(id))
    }

    /// Reference field offsets for a type
    #[inline]
    pub fn object_layout(&self, id: DescriptorId) -> Option<&[u32]> {
        self.get(id).map(|d| d.reference_offsets.as_slice())
    }

    /// Reference offsets of a type known to be registered.
    ///
    /// Headers in the heap only carry registered ids, so a miss here is
    /// heap corruption.
    pub(crate) fn references_of(&self, id: DescriptorId) -> &[u32] {
        match self.object_layout(id) {
            Some(offsets) => offsets,
            None => panic!("heap object carries unregistered type descriptor {id}"),
        }
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no type is registered
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut types = TypeRegistry::new();
        let leaf = types.register("Leaf", &[]).unwrap();
        let pair = types.register("Pair", &[0, 8]).unwrap();

        assert_ne!(leaf, pair);
        assert_eq!(types.object_layout(leaf), Some(&[][..]));
        assert_eq!(types.object_layout(pair), Some(&[0, 8][..]));
        assert_eq!(types.get(pair).unwrap().min_object_size(), HEADER_SIZE + 16);
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn test_overlapping_offsets_rejected() {
        let mut types = TypeRegistry::new();
        assert!(matches!(
            types.register("Bad", &[0, 4]),
            Err(GcError::InvalidLayout { .. })
        ));
        assert!(matches!(
            types.register("Unsorted", &[16, 0]),
            Err(GcError::InvalidLayout { .. })
        ));
        assert!(types.is_empty());
    }

    #[test]
    fn test_reference_overlap_queries() {
        let mut types = TypeRegistry::new();
        let id = types.register("Node", &[8]).unwrap();
        let node = types.get(id).unwrap();

        assert!(node.is_reference_offset(8));
        assert!(!node.is_reference_offset(0));
        assert!(!node.overlaps_reference(0, 8));
        assert!(node.overlaps_reference(4, 12));
        assert!(node.overlaps_reference(15, 20));
        assert!(!node.overlaps_reference(16, 24));
    }

    #[test]
    fn test_unknown_type() {
        let types = TypeRegistry::new();
        assert_eq!(
            types.expect(DescriptorId(3)).unwrap_err(),
            GcError::UnknownType(DescriptorId(3))
        );
    }
}
