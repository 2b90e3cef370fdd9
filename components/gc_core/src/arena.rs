//! Arena backing one relocation set.
//!
//! The arena is sized once per cycle and made of two tables:
//! - the slot table, holding the forwarding record of each selected region
//!   in place
//! - the entry storage shared by the entry tables of all records
//!
//! Entry tables are carved out with an atomic bump pointer, so parallel
//! installers never contend on a lock. Nothing is freed individually: the
//! whole arena goes away when the relocation set is reset.

use crate::forwarding::Forwarding;
use std::mem;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Arena holding every forwarding record of a cycle.
pub struct ForwardingArena {
    /// Forwarding records, installed at most once each
    slots: Box<[OnceLock<Forwarding>]>,
    /// Entry storage shared by all records
    entries: Box<[AtomicU64]>,
    /// Bump pointer into `entries`
    entries_top: AtomicUsize,
}

impl ForwardingArena {
    /// Creates an arena for `nforwardings` records and `nentries` entries.
    pub fn new(nforwardings: usize, nentries: usize) -> Self {
        ForwardingArena {
            slots: (0..nforwardings).map(|_| OnceLock::new()).collect(),
            entries: (0..nentries).map(|_| AtomicU64::new(0)).collect(),
            entries_top: AtomicUsize::new(0),
        }
    }

    /// Bytes reserved by the two tables.
    pub fn size_bytes(&self) -> usize {
        mem::size_of_val(&*self.slots) + mem::size_of_val(&*self.entries)
    }

    /// Reserves `n` consecutive entries.
    ///
    /// # Panics
    ///
    /// Panics if the reservation exceeds the entry budget the arena was
    /// sized for.
    pub fn alloc_entries(&self, n: usize) -> Range<usize> {
        let start = self.entries_top.fetch_add(n, Ordering::Relaxed);
        assert!(
            start + n <= self.entries.len(),
            "forwarding entry budget exceeded: {} + {} > {}",
            start,
            n,
            self.entries.len()
        );
        start..start + n
    }

    /// Stores a forwarding record in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range or already installed.
    pub fn install(&self, slot: usize, forwarding: Forwarding) {
        assert!(slot < self.slots.len(), "Invalid index {}", slot);
        if self.slots[slot].set(forwarding).is_err() {
            panic!("forwarding slot {} installed twice", slot);
        }
    }

    /// Returns the record in `slot`, if installed.
    pub fn slot(&self, slot: usize) -> Option<&Forwarding> {
        self.slots.get(slot).and_then(OnceLock::get)
    }

    /// Returns entry `index`.
    pub fn entry(&self, index: usize) -> &AtomicU64 {
        &self.entries[index]
    }

    /// Number of forwarding slots.
    pub fn nforwardings(&self) -> usize {
        self.slots.len()
    }

    /// Number of installed slots.
    pub fn ninstalled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }

    /// Entry capacity of the arena.
    pub fn entries_capacity(&self) -> usize {
        self.entries.len()
    }

    /// Entries handed out so far.
    pub fn entries_used(&self) -> usize {
        self.entries_top.load(Ordering::Relaxed)
    }

    /// True once every slot is installed and the entry budget is used up.
    pub fn is_full(&self) -> bool {
        self.entries_used() == self.entries_capacity() && self.ninstalled() == self.nforwardings()
    }
}
