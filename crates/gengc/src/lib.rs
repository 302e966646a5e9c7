//! # Generational GC heap manager
//!
//! Managed heap with a copying young generation and a compacting old
//! generation.
//!
//! ## Design
//!
//! - **Young generation**: Bump allocation in eden, copying collection into
//!   alternating survivor regions
//! - **Old generation**: Promotion by age, mark-sweep-compact when full
//! - **Large objects**: Allocated directly in the old generation
//! - **Write barrier**: Remembered set of tenured slots pointing into young space
//! - **References**: Weak, soft and phantom registrations with pull-based queues
//! - **Threads**: Stop-the-world safepoints through [`SharedHeap`]
//!
//! Objects live in a simulated address space: an [`Address`] is a byte
//! offset, never a host pointer, and all heap memory is owned by the
//! [`HeapManager`].

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod barrier;
pub mod config;
pub mod error;
pub mod heap;
pub mod layout;
pub mod major;
pub mod minor;
pub mod object;
pub mod reference;
pub mod region;
pub mod roots;
pub mod safepoint;
pub mod scheduler;
pub mod shared;
pub mod snapshot;
pub mod stats;
pub mod tenuring;
pub mod verify;

pub use allocator::{Allocator, Placement};
pub use barrier::RememberedSet;
pub use config::{ConfigError, HeapConfig};
pub use error::{AllocationFailure, GcError, GcResult, HeapCorruption};
pub use heap::HeapManager;
pub use layout::{TypeDescriptor, TypeRegistry};
pub use object::{Address, DescriptorId, HEADER_SIZE, ObjectHeader};
pub use reference::{Notification, QueueId, QueuePolicy, RefHandle, RefState, ReferenceKind};
pub use region::{Region, RegionKind, Regions};
pub use roots::{MutatorId, NoRoots, RootProvider, RootSlot, RootStack};
pub use safepoint::{Safepoint, SafepointGuard};
pub use scheduler::Generation;
pub use shared::{Mutator, SharedHeap};
pub use snapshot::{FieldValue, HeapSnapshot, ObjectRecord};
pub use stats::{CollectionKind, GcCycleReport, GcStats};
pub use tenuring::{Destination, TenuringPolicy};
