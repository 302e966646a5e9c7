//! Error types for the heap manager

use thiserror::Error;

use crate::config::ConfigError;
use crate::object::{Address, DescriptorId};
use crate::reference::{QueueId, RefHandle};

/// Why an allocation request could not be satisfied.
///
/// `EdenFull` and `OldFull` are resolved by the scheduler with a collection
/// and a single retry. `OutOfMemory` is final for the request that produced
/// it; the heap stays usable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationFailure {
    /// Eden has no room left for the request
    #[error("eden space exhausted")]
    EdenFull,

    /// The old generation has no room left for the request
    #[error("old generation exhausted")]
    OldFull,

    /// Collection did not free enough memory
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Requested object size in bytes
        requested: usize,
    },
}

/// Heap manager errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcError {
    /// Allocation failure
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),

    /// Invalid heap configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Type descriptor was never registered
    #[error("unknown type descriptor {0}")]
    UnknownType(DescriptorId),

    /// Layout offsets are unsorted, overlapping or too large
    #[error("invalid layout for type {name}: {reason}")]
    InvalidLayout {
        /// Type name
        name: String,
        /// What is wrong with the layout
        reason: String,
    },

    /// Requested object size cannot hold a header or the type's reference fields
    #[error("invalid object size {size} for type {type_id} (minimum {minimum})")]
    InvalidSize {
        /// Requested size
        size: usize,
        /// Smallest size that fits the header and reference fields
        minimum: usize,
        /// Type of the object
        type_id: DescriptorId,
    },

    /// Address does not designate a live object
    #[error("{0} is not an object address")]
    NotAnObject(Address),

    /// Offset is not one of the type's reference fields
    #[error("offset {offset} is not a reference field of {object}")]
    NotAReferenceField {
        /// Object being accessed
        object: Address,
        /// Payload offset
        offset: u32,
    },

    /// Payload range lies outside the object or overlaps a reference field
    #[error("payload range {offset}..{end} is not accessible as data in {object}")]
    FieldOutOfBounds {
        /// Object being accessed
        object: Address,
        /// Start of the payload range
        offset: usize,
        /// End of the payload range
        end: usize,
    },

    /// Reference handle is not registered
    #[error("unknown reference handle {0:?}")]
    UnknownHandle(RefHandle),

    /// Reference queue does not exist
    #[error("unknown reference queue {0:?}")]
    UnknownQueue(QueueId),

    /// Weak, soft and phantom references need a referent
    #[error("cannot register a reference to null")]
    NullReferent,

    /// A minor collection could not reserve space in the old generation.
    /// Nothing was moved when this is returned.
    #[error("promotion failed: {needed} bytes needed, {available} available in old generation")]
    PromotionFailed {
        /// Size of the object that could not be promoted
        needed: usize,
        /// Space left in the old generation at that point
        available: usize,
    },
}

impl GcError {
    /// The allocation failure carried by this error, if any
    pub fn allocation_failure(&self) -> Option<AllocationFailure> {
        match self {
            GcError::Allocation(failure) => Some(*failure),
            _ => None,
        }
    }

    /// Whether this error reports an exhausted heap
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            GcError::Allocation(AllocationFailure::OutOfMemory { .. })
        )
    }

    /// Create an invalid layout error
    pub fn invalid_layout(name: impl Into<String>, reason: impl Into<String>) -> Self {
        GcError::InvalidLayout {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for heap operations
pub type GcResult<T> = Result<T, GcError>;

/// A heap invariant that verification found broken
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapCorruption {
    /// Header could not describe a valid object
    #[error("malformed header at {address}: {reason}")]
    MalformedHeader {
        /// Object address
        address: Address,
        /// What is wrong
        reason: &'static str,
    },

    /// A forwarding pointer survived past a collection
    #[error("object at {address} still carries forwarding pointer to {forwarding}")]
    StaleForwarding {
        /// Object address
        address: Address,
        /// Forwarding target
        forwarding: Address,
    },

    /// A mark bit survived past a collection
    #[error("object at {0} is still marked")]
    StaleMark(Address),

    /// A reference field points somewhere other than an object start
    #[error("field {slot} of {object} points at {target}, which is not an object")]
    DanglingField {
        /// Containing object
        object: Address,
        /// Slot address
        slot: Address,
        /// Bad target
        target: Address,
    },

    /// An old-to-young pointer is missing from the remembered set
    #[error("slot {slot} points into young space at {target} but is not remembered")]
    UnrememberedSlot {
        /// Slot address
        slot: Address,
        /// Young target
        target: Address,
    },

    /// A remembered slot is outside the tenured spaces
    #[error("remembered slot {0} lies outside old and metaspace objects")]
    StrayRememberedSlot(Address),

    /// A reference record points somewhere other than an object start
    #[error("reference {handle:?} points at {target}, which is not an object")]
    DanglingReferent {
        /// Record handle
        handle: RefHandle,
        /// Bad target
        target: Address,
    },

    /// Old generation extents do not form a gapless prefix
    #[error("old generation walk ended at {walked} but free pointer is {top}")]
    OldGenerationGap {
        /// Where the object walk stopped
        walked: Address,
        /// Region free pointer
        top: Address,
    },
}
