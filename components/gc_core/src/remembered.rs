//! Remembered set of old objects that reference young ones.
//!
//! Young marking does not trace through the old generation. Instead the old
//! objects recorded here serve as extra roots: their young references are
//! pushed when young marking starts.
//!
//! The set is double buffered. Young mark start flips it; the marker drains
//! the previous half while stores and promotions keep recording into the
//! current half.

use gc_types::Address;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Old objects holding references into young.
///
/// Lock order is current before previous.
#[derive(Debug, Default)]
pub struct RememberedSet {
    current: Mutex<HashSet<Address>>,
    previous: Mutex<HashSet<Address>>,
}

impl RememberedSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `addr`. Returns false if it was already recorded since the
    /// last flip.
    pub fn remember(&self, addr: Address) -> bool {
        self.current.lock().insert(addr)
    }

    /// Moves the current records to the previous half and returns how many
    /// wait to be scanned.
    ///
    /// Records of a previous half nobody drained are kept.
    pub fn flip(&self) -> usize {
        let mut current = self.current.lock();
        let mut previous = self.previous.lock();
        previous.extend(current.drain());
        previous.len()
    }

    /// Drains the previous half, lowest address first.
    pub fn take_previous(&self) -> Vec<Address> {
        let mut entries: Vec<Address> = self.previous.lock().drain().collect();
        entries.sort_unstable();
        entries
    }

    /// True if `addr` is recorded in either half.
    pub fn contains(&self, addr: Address) -> bool {
        let current = self.current.lock();
        current.contains(&addr) || self.previous.lock().contains(&addr)
    }

    /// Number of distinct recorded objects.
    pub fn len(&self) -> usize {
        let current = self.current.lock();
        let previous = self.previous.lock();
        current.len() + previous.iter().filter(|addr| !current.contains(addr)).count()
    }

    /// True if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites every record through `remap`.
    pub fn remap(&self, remap: &dyn Fn(Address) -> Address) {
        let mut current = self.current.lock();
        let mut previous = self.previous.lock();
        for half in [&mut *current, &mut *previous] {
            let healed: HashSet<Address> = half.drain().map(remap).collect();
            *half = healed;
        }
    }

    /// Keeps the records `keep` accepts. Returns how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(Address) -> bool) -> usize {
        let mut current = self.current.lock();
        let mut previous = self.previous.lock();
        let before = current.len() + previous.len();
        current.retain(|&addr| keep(addr));
        previous.retain(|&addr| keep(addr));
        before - current.len() - previous.len()
    }

    /// Drops every record.
    pub fn clear(&self) {
        self.current.lock().clear();
        self.previous.lock().clear();
    }
}
