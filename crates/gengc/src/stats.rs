//! Collection statistics
//!
//! Diagnostic only. Nothing in the collectors reads these back.

use std::time::Duration;

use serde::Serialize;

/// Which collector ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CollectionKind {
    /// Copying collection of eden and the from-survivor
    Minor,
    /// Mark-sweep-compact of the old generation
    Major,
}

/// Report of one collection cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcCycleReport {
    /// Sequence number, starting at 1
    pub cycle: u64,
    /// Generation collected
    pub generation: CollectionKind,
    /// Bytes no longer occupied after the cycle
    pub bytes_reclaimed: usize,
    /// Objects whose address changed
    pub objects_relocated: usize,
    /// Objects moved from young to old space
    pub objects_promoted: usize,
    /// Bytes moved from young to old space
    pub bytes_promoted: usize,
    /// Bytes still live in the collected space
    pub live_bytes: usize,
    /// Weak, soft and phantom references cleared or enqueued
    pub references_processed: usize,
    /// Stop-the-world pause
    pub pause: Duration,
}

/// Cumulative collection statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcStats {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Bytes allocated since the heap was created
    pub bytes_allocated: u64,
    /// Objects allocated since the heap was created
    pub objects_allocated: u64,

    // =========================================================================
    // Collections
    // =========================================================================
    /// Minor collections run
    pub minor_collections: u64,
    /// Major collections run
    pub major_collections: u64,
    /// Total bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Total bytes promoted
    pub bytes_promoted: u64,
    /// Allocation requests that ended in OutOfMemory
    pub out_of_memory: u64,

    // =========================================================================
    // Pauses
    // =========================================================================
    /// Sum of all pauses
    pub total_pause: Duration,
    /// Longest pause
    pub max_pause: Duration,
    /// Most recent cycle
    pub last: Option<GcCycleReport>,
}

impl GcStats {
    /// Create new empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    #[inline]
    pub fn record_allocation(&mut self, size: usize) {
        self.bytes_allocated += size as u64;
        self.objects_allocated += 1;
    }

    /// Record a finished cycle
    pub fn record_cycle(&mut self, report: GcCycleReport) {
        match report.generation {
            CollectionKind::Minor => self.minor_collections += 1,
            CollectionKind::Major => self.major_collections += 1,
        }
        self.bytes_reclaimed += report.bytes_reclaimed as u64;
        self.bytes_promoted += report.bytes_promoted as u64;
        self.total_pause += report.pause;
        self.max_pause = self.max_pause.max(report.pause);
        self.last = Some(report);
    }

    /// Number of cycles run so far
    pub fn collections(&self) -> u64 {
        self.minor_collections + self.major_collections
    }

    /// Duration of the most recent pause
    pub fn last_pause(&self) -> Duration {
        self.last.as_ref().map_or(Duration::ZERO, |r| r.pause)
    }

    /// Average pause across all cycles
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections();
        if count == 0 {
            return Duration::ZERO;
        }
        self.total_pause / count as u32
    }
}
