//! Collector configuration.
//!
//! [`GcConfig`] carries every tunable the relocation engine reads. It can be
//! built in code, starting from [`GcConfig::default`], or loaded from JSON.
//!
//! # Examples
//!
//! ```
//! use gc_core::GcConfig;
//!
//! let config = GcConfig::from_json_str(r#"{ "young_workers": 4, "fragmentation_limit": 10.0 }"#).unwrap();
//! assert_eq!(config.young_workers, 4);
//! assert_eq!(config.old_workers, GcConfig::default().old_workers);
//! ```

use gc_types::{GcError, GcResult, GRANULE_SIZE, MAX_SURVIVOR_AGE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Worker threads in the young generation pool
    pub young_workers: usize,
    /// Worker threads in the old generation pool
    pub old_workers: usize,
    /// Whether the active worker count may change between and within tasks
    pub dynamic_workers: bool,
    /// Minimum garbage, in percent of region size, for a region to be evacuated
    pub fragmentation_limit: f64,
    /// Survivor age at which young objects are promoted
    pub tenuring_threshold: u8,
    /// Size of a medium region in bytes (a multiple of the granule size)
    pub medium_region_size: usize,
    /// Total heap address space in bytes (a multiple of the granule size)
    pub heap_capacity: usize,
    /// Empty regions handed back to the allocator per batch
    pub free_bulk: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            young_workers: 2,
            old_workers: 2,
            dynamic_workers: true,
            fragmentation_limit: 25.0,
            tenuring_threshold: 4,
            medium_region_size: 16 * GRANULE_SIZE,
            heap_capacity: 1024 * GRANULE_SIZE,
            free_bulk: 64,
        }
    }
}

impl GcConfig {
    /// Parses a configuration from JSON and validates it.
    ///
    /// Missing fields take their default values.
    pub fn from_json_str(json: &str) -> GcResult<Self> {
        let config: GcConfig =
            serde_json::from_str(json).map_err(|e| GcError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> GcResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serializes the configuration as pretty-printed JSON.
    pub fn to_json_string(&self) -> GcResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| GcError::InvalidConfig(e.to_string()))
    }

    /// Checks that every value is in range.
    pub fn validate(&self) -> GcResult<()> {
        if self.young_workers == 0 {
            return Err(invalid("young_workers must be at least 1"));
        }
        if self.old_workers == 0 {
            return Err(invalid("old_workers must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.fragmentation_limit) {
            return Err(invalid(format!(
                "fragmentation_limit must be within 0..=100, got {}",
                self.fragmentation_limit
            )));
        }
        if self.tenuring_threshold > MAX_SURVIVOR_AGE {
            return Err(invalid(format!(
                "tenuring_threshold must be at most {}, got {}",
                MAX_SURVIVOR_AGE, self.tenuring_threshold
            )));
        }
        if self.medium_region_size <= GRANULE_SIZE || self.medium_region_size % GRANULE_SIZE != 0 {
            return Err(invalid(format!(
                "medium_region_size must be a multiple of {} larger than one granule",
                GRANULE_SIZE
            )));
        }
        if self.heap_capacity % GRANULE_SIZE != 0 || self.heap_capacity < 2 * self.medium_region_size {
            return Err(invalid(format!(
                "heap_capacity must be a multiple of {} holding at least two medium regions",
                GRANULE_SIZE
            )));
        }
        if self.free_bulk == 0 {
            return Err(invalid("free_bulk must be at least 1"));
        }
        Ok(())
    }

    /// Worker count for a generation's pool.
    pub fn workers_for(&self, generation: gc_types::GenerationId) -> usize {
        match generation {
            gc_types::GenerationId::Young => self.young_workers,
            gc_types::GenerationId::Old => self.old_workers,
        }
    }

    /// Largest object placed in a small region.
    pub fn small_object_limit(&self) -> usize {
        GRANULE_SIZE / 8
    }

    /// Largest object placed in a medium region. Anything bigger gets a large region.
    pub fn medium_object_limit(&self) -> usize {
        self.medium_region_size / 8
    }
}

fn invalid(msg: impl Into<String>) -> GcError {
    GcError::InvalidConfig(msg.into())
}
