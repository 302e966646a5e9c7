//! Collection scheduling
//!
//! Decides which collection runs when the fast allocation path fails or a
//! collection is requested explicitly:
//!
//! - Eden exhausted: minor collection, then retry.
//! - Minor collection cannot promote: major collection, then minor again.
//! - Old occupancy above the high watermark after a minor: major collection.
//! - Old exhausted: major collection, then retry.
//! - Still no room: one last major collection with soft references forced
//!   clear, then [`AllocationFailure::OutOfMemory`].

use serde::{Deserialize, Serialize};

use crate::error::{AllocationFailure, GcError, GcResult};
use crate::heap::HeapManager;
use crate::object::{Address, DescriptorId, align_object_size};
use crate::roots::RootProvider;
use crate::stats::GcCycleReport;

/// Generation selector for explicit collection requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Generation {
    /// Minor collection, plus a major one if the minor could not promote
    Young,
    /// Major collection of the old generation
    Old,
    /// Minor followed by major
    Full,
}

impl HeapManager {
    /// Allocate, collecting as needed.
    ///
    /// `roots` must enumerate every live reference the mutator holds; the
    /// slots are rewritten if objects move. Only
    /// [`AllocationFailure::OutOfMemory`] escapes as an allocation error.
    pub fn allocate_with_gc(
        &mut self,
        size: usize,
        type_id: DescriptorId,
        roots: &mut dyn RootProvider,
    ) -> GcResult<Address> {
        let failure = match self.allocate(size, type_id) {
            Err(GcError::Allocation(failure)) => failure,
            other => return other,
        };

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "gengc::gc", size, ?failure, "allocation slow path");

        let failure = match failure {
            AllocationFailure::EdenFull => {
                self.collect_young(roots)?;
                match self.allocate(size, type_id) {
                    Err(GcError::Allocation(failure)) => failure,
                    other => return other,
                }
            }
            other => other,
        };

        let mut pressured = false;
        if failure == AllocationFailure::OldFull {
            pressured = self.references.memory_pressure();
            self.collect_major(roots)?;
            match self.allocate(size, type_id) {
                Err(GcError::Allocation(_)) => {}
                other => return other,
            }
        }

        // Last resort: reclaim softly reachable data too, unless the cycle
        // above already did or there is none
        let result = if pressured || !self.references.has_active_soft() {
            self.allocate(size, type_id)
        } else {
            self.collect_major_under_pressure(roots)?;
            self.allocate(size, type_id)
        };
        match result {
            Err(GcError::Allocation(_)) => {
                let requested = align_object_size(size);
                self.stats.out_of_memory += 1;

                #[cfg(feature = "gc_logging")]
                tracing::warn!(
                    target: "gengc::gc",
                    requested,
                    eden_used = self.regions.eden().used(),
                    old_used = self.regions.old().used(),
                    "out of memory"
                );

                Err(AllocationFailure::OutOfMemory { requested }.into())
            }
            other => other,
        }
    }

    /// Minor collection with promotion-failure fallback and the watermark check.
    ///
    /// Returns the report of the minor cycle.
    pub fn collect_young(&mut self, roots: &mut dyn RootProvider) -> GcResult<GcCycleReport> {
        let report = match self.collect_minor(roots) {
            Ok(report) => report,
            Err(err @ GcError::PromotionFailed { .. }) => {
                #[cfg(feature = "gc_logging")]
                tracing::info!(
                    target: "gengc::gc",
                    error = %err,
                    "collecting old generation before retrying minor"
                );
                #[cfg(not(feature = "gc_logging"))]
                let _ = err;

                self.collect_major(roots)?;
                match self.collect_minor(roots) {
                    Ok(report) => report,
                    Err(GcError::PromotionFailed { needed, .. }) => {
                        self.stats.out_of_memory += 1;
                        return Err(AllocationFailure::OutOfMemory { requested: needed }.into());
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        if self.regions.old().occupancy() > self.config.old_high_watermark {
            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "gengc::gc",
                occupancy = self.regions.old().occupancy(),
                watermark = self.config.old_high_watermark,
                "old generation above watermark"
            );
            self.collect_major(roots)?;
        }

        Ok(report)
    }

    /// Run a collection of the requested generation.
    ///
    /// Returns the report of the last cycle that ran.
    pub fn request_collection(
        &mut self,
        generation: Generation,
        roots: &mut dyn RootProvider,
    ) -> GcResult<GcCycleReport> {
        match generation {
            Generation::Young => self.collect_young(roots),
            Generation::Old => self.collect_major(roots),
            Generation::Full => {
                self.collect_young(roots)?;
                self.collect_major(roots)
            }
        }
    }
}
