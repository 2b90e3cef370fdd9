//! Granule-indexed lookup from addresses to forwarding records.
//!
//! Every granule covered by a region in the relocation set maps to that
//! region's record. An address in any other granule has no forwarding, which
//! is the barrier's fast path.

use crate::forwarding::ForwardingRef;
use gc_types::Address;
use log::trace;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Map from granule index to forwarding record.
#[derive(Default)]
pub struct ForwardingTable {
    map: RwLock<HashMap<usize, ForwardingRef>>,
}

impl ForwardingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record covering `addr`, if its region is being relocated.
    pub fn get(&self, addr: Address) -> Option<ForwardingRef> {
        self.map.read().get(&addr.granule()).cloned()
    }

    /// Registers a record for every granule of its region.
    ///
    /// # Panics
    ///
    /// Panics if one of the granules already has a record.
    pub fn insert(&self, forwarding: &ForwardingRef) {
        let region = forwarding.region();
        let mut map = self.map.write();
        for granule in region.start().granule()..region.end().granule() {
            let previous = map.insert(granule, forwarding.clone());
            assert!(
                previous.is_none(),
                "granule {} already has a forwarding record",
                granule
            );
        }
        trace!("forwarding table: added {}", region.id());
    }

    /// Removes the record of a region.
    pub fn remove(&self, forwarding: &ForwardingRef) {
        let region = forwarding.region();
        let mut map = self.map.write();
        for granule in region.start().granule()..region.end().granule() {
            if let Some(existing) = map.get(&granule) {
                if existing.same(forwarding) {
                    map.remove(&granule);
                }
            }
        }
    }

    /// Removes every record.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Number of granules with a record.
    pub fn ngranules(&self) -> usize {
        self.map.read().len()
    }

    /// True if no granule has a record.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
