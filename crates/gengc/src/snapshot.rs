//! Heap snapshots
//!
//! A snapshot lists every object in every region with its reference field
//! values. It serializes to JSON for offline inspection.

use serde::{Deserialize, Serialize};

use crate::heap::HeapManager;
use crate::object::{Address, DescriptorId};
use crate::region::RegionKind;

/// One reference field of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    /// Payload offset of the field
    pub offset: u32,
    /// Stored address, null included
    pub value: Address,
}

/// One object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object address
    pub address: Address,
    /// Total size including the header
    pub size: usize,
    /// Type
    pub type_id: DescriptorId,
    /// Region holding the object
    pub region: RegionKind,
    /// Minor collections survived
    pub age: u8,
    /// Reference fields in offset order
    pub fields: Vec<FieldValue>,
}

/// Every object in the heap, ordered by address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSnapshot {
    /// Object records
    pub records: Vec<ObjectRecord>,
}

impl HeapSnapshot {
    /// Number of objects
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the heap held no objects
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record of the object at `address`
    pub fn get(&self, address: Address) -> Option<&ObjectRecord> {
        self.records
            .binary_search_by_key(&address, |r| r.address)
            .ok()
            .map(|index| &self.records[index])
    }

    /// Objects in one region
    pub fn in_region(&self, region: RegionKind) -> impl Iterator<Item = &ObjectRecord> {
        self.records.iter().filter(move |r| r.region == region)
    }

    /// Bytes occupied by objects in one region
    pub fn bytes_in(&self, region: RegionKind) -> usize {
        self.in_region(region).map(|r| r.size).sum()
    }

    /// Every non-null reference edge as `(source, target)`
    pub fn edges(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.records.iter().flat_map(|r| {
            r.fields
                .iter()
                .filter(|f| !f.value.is_null())
                .map(move |f| (r.address, f.value))
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a snapshot from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl HeapManager {
    /// Take a snapshot of every object
    pub fn snapshot(&self) -> HeapSnapshot {
        let mut records = Vec::new();
        // Regions are laid out in ascending address order
        for region in self.regions.iter() {
            for address in region.object_addresses() {
                let header = region.header(address);
                let fields = self
                    .types
                    .references_of(header.type_id)
                    .iter()
                    .map(|&offset| FieldValue {
                        offset,
                        value: region.read_address(address.field(offset)),
                    })
                    .collect();
                records.push(ObjectRecord {
                    address,
                    size: header.size(),
                    type_id: header.type_id,
                    region: region.kind(),
                    age: header.age,
                    fields,
                });
            }
        }
        HeapSnapshot { records }
    }
}
