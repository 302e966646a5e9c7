//! Object layout
//!
//! Every object starts with a 16-byte header stored in-band at its address:
//!
//! ```text
//! 0..4   size      total extent in bytes, header included
//! 4..6   type id   descriptor registered in the type registry
//! 6      flags     bit 0 = mark
//! 7      age       minor collections survived in young space
//! 8..16  forward   relocated address, 0 when not forwarded
//! ```
//!
//! The payload follows the header. Reference fields are 8-byte
//! little-endian addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Size of a reference field in bytes
pub const REFERENCE_SIZE: usize = 8;

/// Object extents are rounded up to this many bytes
pub const OBJECT_ALIGNMENT: usize = 4;

const MARK_BIT: u8 = 0b0000_0001;

/// Round `size` up to the object alignment
#[inline]
pub const fn align_object_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// A byte address in the heap's address space
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// The null reference. Never inside a region.
    pub const NULL: Address = Address(0);

    /// Create an address from its raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes as u64)
    }

    /// Distance in bytes from `base` to this address
    #[inline]
    pub const fn distance_from(self, base: Address) -> usize {
        (self.0 - base.0) as usize
    }

    /// Address of the payload slot at `offset`, for an object at this address
    #[inline]
    pub const fn field(self, offset: u32) -> Address {
        self.offset(HEADER_SIZE + offset as usize)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a registered type descriptor
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DescriptorId(pub u16);

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Decoded object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Total extent in bytes, header included
    pub size: u32,
    /// Type descriptor
    pub type_id: DescriptorId,
    /// Mark bit used by the major collector
    pub marked: bool,
    /// Minor collections survived while young
    pub age: u8,
    /// Relocated address while a collection is running
    pub forwarding: Address,
}

impl ObjectHeader {
    /// Header for a freshly allocated object
    pub const fn new(size: u32, type_id: DescriptorId) -> Self {
        Self {
            size,
            type_id,
            marked: false,
            age: 0,
            forwarding: Address::NULL,
        }
    }

    /// Extent in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// Payload size in bytes
    #[inline]
    pub const fn payload_size(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    /// Whether a forwarding pointer is installed
    #[inline]
    pub const fn is_forwarded(&self) -> bool {
        !self.forwarding.is_null()
    }

    /// Encode into the in-band representation
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.size.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.type_id.0.to_le_bytes());
        bytes[6] = if self.marked { MARK_BIT } else { 0 };
        bytes[7] = self.age;
        bytes[8..16].copy_from_slice(&self.forwarding.as_u64().to_le_bytes());
        bytes
    }

    /// Decode from the in-band representation.
    ///
    /// `bytes` must hold at least [`HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Self {
        let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let type_id = u16::from_le_bytes([bytes[4], bytes[5]]);
        let mut forwarding = [0u8; 8];
        forwarding.copy_from_slice(&bytes[8..16]);
        Self {
            size,
            type_id: DescriptorId(type_id),
            marked: bytes[6] & MARK_BIT != 0,
            age: bytes[7],
            forwarding: Address(u64::from_le_bytes(forwarding)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        let mut header = ObjectHeader::new(100, DescriptorId(7));
        header.marked = true;
        header.age = 3;
        header.forwarding = Address::new(0x2_0040);

        let decoded = ObjectHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_size(), 84);
        assert!(decoded.is_forwarded());
    }

    #[test]
    fn test_fresh_header_is_clean() {
        let header = ObjectHeader::decode(&ObjectHeader::new(32, DescriptorId(1)).encode());
        assert!(!header.marked);
        assert_eq!(header.age, 0);
        assert!(!header.is_forwarded());
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_object_size(16), 16);
        assert_eq!(align_object_size(17), 20);
        assert_eq!(align_object_size(100), 100);
    }

    #[test]
    fn test_field_address() {
        let object = Address::new(0x1000);
        assert_eq!(object.field(0), Address::new(0x1010));
        assert_eq!(object.field(8).distance_from(object), 24);
        assert!(Address::NULL.is_null());
    }
}
