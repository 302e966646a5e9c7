//! Heap configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::{HEADER_SIZE, OBJECT_ALIGNMENT};

/// Highest tenuring threshold an age counter can express
pub const MAX_TENURING_THRESHOLD: u8 = 15;

/// Heap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    // =========================================================================
    // Region sizes
    // =========================================================================
    /// Eden capacity in bytes (default: 1MB)
    pub eden_size: usize,
    /// Capacity of each survivor region in bytes (default: 128KB)
    pub survivor_size: usize,
    /// Old generation capacity in bytes (default: 16MB)
    pub old_size: usize,
    /// Metaspace capacity in bytes (default: 256KB)
    pub metaspace_size: usize,

    // =========================================================================
    // Allocation policy
    // =========================================================================
    /// Objects larger than this go straight to the old generation (default: 8KB)
    pub large_object_threshold: usize,

    // =========================================================================
    // Collection policy
    // =========================================================================
    /// Minor collections survived before promotion (default: 15)
    pub tenuring_threshold: u8,
    /// Old occupancy ratio that triggers a major collection after a minor one (default: 0.75)
    pub old_high_watermark: f64,
    /// Old occupancy ratio after a major collection above which soft references clear (default: 0.9)
    pub soft_pressure_threshold: f64,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Verify the whole heap after every collection (default: on in debug builds)
    pub verify_heap: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            eden_size: 1024 * 1024,           // 1MB
            survivor_size: 128 * 1024,        // 128KB
            old_size: 16 * 1024 * 1024,       // 16MB
            metaspace_size: 256 * 1024,       // 256KB
            large_object_threshold: 8 * 1024, // 8KB
            tenuring_threshold: MAX_TENURING_THRESHOLD,
            old_high_watermark: 0.75,
            soft_pressure_threshold: 0.9,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl HeapConfig {
    /// Small heap for tests and embedding experiments
    pub fn small() -> Self {
        Self {
            eden_size: 4 * 1024,
            survivor_size: 2 * 1024,
            old_size: 16 * 1024,
            metaspace_size: 1024,
            large_object_threshold: 1024,
            verify_heap: true,
            ..Self::default()
        }
    }

    /// Set the eden size
    pub fn with_eden_size(mut self, bytes: usize) -> Self {
        self.eden_size = bytes;
        self
    }

    /// Set the size of each survivor region
    pub fn with_survivor_size(mut self, bytes: usize) -> Self {
        self.survivor_size = bytes;
        self
    }

    /// Set the old generation size
    pub fn with_old_size(mut self, bytes: usize) -> Self {
        self.old_size = bytes;
        self
    }

    /// Set the metaspace size
    pub fn with_metaspace_size(mut self, bytes: usize) -> Self {
        self.metaspace_size = bytes;
        self
    }

    /// Set the large object threshold
    pub fn with_large_object_threshold(mut self, bytes: usize) -> Self {
        self.large_object_threshold = bytes;
        self
    }

    /// Set the tenuring threshold
    pub fn with_tenuring_threshold(mut self, threshold: u8) -> Self {
        self.tenuring_threshold = threshold;
        self
    }

    /// Set the old generation high watermark
    pub fn with_old_high_watermark(mut self, ratio: f64) -> Self {
        self.old_high_watermark = ratio;
        self
    }

    /// Set the soft reference pressure threshold
    pub fn with_soft_pressure_threshold(mut self, ratio: f64) -> Self {
        self.soft_pressure_threshold = ratio;
        self
    }

    /// Enable or disable post-collection verification
    pub fn with_verify_heap(mut self, verify: bool) -> Self {
        self.verify_heap = verify;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: HeapConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, size) in [
            ("eden_size", self.eden_size),
            ("survivor_size", self.survivor_size),
            ("old_size", self.old_size),
        ] {
            if size < HEADER_SIZE {
                return Err(ConfigError::RegionTooSmall { region: name, size });
            }
        }
        for (name, size) in [
            ("eden_size", self.eden_size),
            ("survivor_size", self.survivor_size),
            ("old_size", self.old_size),
            ("metaspace_size", self.metaspace_size),
        ] {
            if size % OBJECT_ALIGNMENT != 0 {
                return Err(ConfigError::Misaligned { region: name, size });
            }
            if size > u32::MAX as usize {
                return Err(ConfigError::RegionTooLarge { region: name, size });
            }
        }

        if self.large_object_threshold < HEADER_SIZE {
            return Err(ConfigError::InvalidLargeObjectThreshold(
                self.large_object_threshold,
            ));
        }

        if self.tenuring_threshold == 0 || self.tenuring_threshold > MAX_TENURING_THRESHOLD {
            return Err(ConfigError::InvalidTenuringThreshold(self.tenuring_threshold));
        }

        for (name, ratio) in [
            ("old_high_watermark", self.old_high_watermark),
            ("soft_pressure_threshold", self.soft_pressure_threshold),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::InvalidRatio { name, ratio });
            }
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Region cannot hold even one object header
    #[error("{region} of {size} bytes cannot hold an object")]
    RegionTooSmall {
        /// Field name
        region: &'static str,
        /// Configured size
        size: usize,
    },

    /// Region size is not a multiple of the object alignment
    #[error("{region} of {size} bytes is not a multiple of the object alignment")]
    Misaligned {
        /// Field name
        region: &'static str,
        /// Configured size
        size: usize,
    },

    /// Region exceeds what an object header can describe
    #[error("{region} of {size} bytes exceeds the 4GB region limit")]
    RegionTooLarge {
        /// Field name
        region: &'static str,
        /// Configured size
        size: usize,
    },

    /// Large object threshold below the header size
    #[error("large object threshold {0} is smaller than an object header")]
    InvalidLargeObjectThreshold(usize),

    /// Tenuring threshold outside 1..=15
    #[error("tenuring threshold {0} must be between 1 and 15")]
    InvalidTenuringThreshold(u8),

    /// Ratio outside (0, 1]
    #[error("{name} = {ratio} must be in (0, 1]")]
    InvalidRatio {
        /// Field name
        name: &'static str,
        /// Configured ratio
        ratio: f64,
    },

    /// JSON could not be parsed
    #[error("invalid heap configuration: {0}")]
    Parse(String),
}
