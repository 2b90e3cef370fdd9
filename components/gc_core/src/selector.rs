//! Relocation set selection.
//!
//! After marking, the selector sorts a generation's regions into:
//! - `empty`: nothing live, freed without relocation
//! - `small` / `medium`: enough garbage to be worth evacuating
//! - `flip`: young regions that stay where they are and only age
//!
//! It also computes the exact forwarding-entry budget the relocation set
//! arena is sized for. Large regions are never relocated.

use crate::config::GcConfig;
use crate::forwarding::Forwarding;
use gc_types::{GenerationId, Region, SizeClass};
use log::debug;
use std::sync::Arc;

/// Output of one selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Small regions to relocate
    pub small: Vec<Arc<Region>>,
    /// Medium regions to relocate
    pub medium: Vec<Arc<Region>>,
    /// Young regions aged in place
    pub flip: Vec<Arc<Region>>,
    /// Regions without live objects
    pub empty: Vec<Arc<Region>>,
    /// Promote every young survivor to old
    pub promote_all: bool,
    /// Survivor age at which objects are promoted
    pub tenuring_threshold: u8,
    /// Entries needed by all forwarding records together
    pub forwarding_entries: usize,
}

impl Selection {
    /// Creates a selection of relocation candidates with an explicit entry budget.
    pub fn new(small: Vec<Arc<Region>>, medium: Vec<Arc<Region>>, forwarding_entries: usize) -> Self {
        Selection {
            small,
            medium,
            forwarding_entries,
            ..Selection::default()
        }
    }

    /// Number of forwarding records the selection needs.
    pub fn nforwardings(&self) -> usize {
        self.small.len() + self.medium.len()
    }

    /// Bytes of live data in the relocation candidates.
    pub fn live_bytes(&self) -> usize {
        self.small
            .iter()
            .chain(self.medium.iter())
            .map(|r| r.live_bytes())
            .sum()
    }
}

/// Picks relocation candidates from per-region liveness.
#[derive(Debug, Clone)]
pub struct RelocationSetSelector {
    fragmentation_limit: f64,
    tenuring_threshold: u8,
}

impl RelocationSetSelector {
    /// Creates a selector using the configured limits.
    pub fn new(config: &GcConfig) -> Self {
        RelocationSetSelector {
            fragmentation_limit: config.fragmentation_limit,
            tenuring_threshold: config.tenuring_threshold,
        }
    }

    /// True if `region` has enough garbage to be evacuated.
    fn is_candidate(&self, region: &Region) -> bool {
        let garbage = region.size().saturating_sub(region.live_bytes());
        garbage as f64 * 100.0 >= region.size() as f64 * self.fragmentation_limit
    }

    /// Selects among the regions of `generation`.
    ///
    /// Regions of other generations are ignored.
    pub fn select(&self, regions: &[Arc<Region>], generation: GenerationId, promote_all: bool) -> Selection {
        let mut selection = Selection {
            promote_all,
            tenuring_threshold: self.tenuring_threshold,
            ..Selection::default()
        };

        for region in regions.iter().filter(|r| r.generation() == generation) {
            if region.live_objects() == 0 {
                selection.empty.push(Arc::clone(region));
                continue;
            }

            let candidate = region.size_class() != SizeClass::Large && self.is_candidate(region);
            match (candidate, region.size_class()) {
                (true, SizeClass::Small) => selection.small.push(Arc::clone(region)),
                (true, SizeClass::Medium) => selection.medium.push(Arc::clone(region)),
                _ if generation == GenerationId::Young => selection.flip.push(Arc::clone(region)),
                _ => {}
            }
        }

        // Sparsest regions first
        selection.small.sort_by_key(|r| r.live_bytes());
        selection.medium.sort_by_key(|r| r.live_bytes());

        selection.forwarding_entries = selection
            .small
            .iter()
            .chain(selection.medium.iter())
            .map(|r| Forwarding::nentries_for(r.live_objects()))
            .sum();

        debug!(
            "{} selection: {} small, {} medium, {} flip, {} empty, {} entries{}",
            generation,
            selection.small.len(),
            selection.medium.len(),
            selection.flip.len(),
            selection.empty.len(),
            selection.forwarding_entries,
            if promote_all { " (promote all)" } else { "" }
        );
        selection
    }
}
