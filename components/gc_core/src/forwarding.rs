//! Forwarding records.
//!
//! A [`Forwarding`] maps the live objects of one region being relocated to
//! their new addresses. Its entry table lives in the relocation set's
//! [`ForwardingArena`] and is open-addressed with linear probing. Entries are
//! published with a compare-and-swap, so a relocation worker and a mutator
//! barrier racing on the same object agree on one winner.
//!
//! Entry layout (64 bits):
//!
//! | bits   | field                                     |
//! |--------|-------------------------------------------|
//! | 0      | populated                                 |
//! | 1-24   | from index (object offset / alignment)    |
//! | 25-63  | to address / alignment                    |

use crate::arena::ForwardingArena;
use gc_types::{Address, Region, RegionAge, OBJECT_ALIGNMENT};
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const POPULATED: u64 = 1;
const FROM_INDEX_SHIFT: u32 = 1;
const FROM_INDEX_BITS: u32 = 24;
const FROM_INDEX_MASK: u64 = (1 << FROM_INDEX_BITS) - 1;
const TO_SHIFT: u32 = FROM_INDEX_SHIFT + FROM_INDEX_BITS;

fn encode(from_index: u64, to: Address) -> u64 {
    debug_assert!(from_index <= FROM_INDEX_MASK);
    POPULATED | (from_index << FROM_INDEX_SHIFT) | (((to.0 / OBJECT_ALIGNMENT) as u64) << TO_SHIFT)
}

fn is_populated(entry: u64) -> bool {
    entry & POPULATED != 0
}

fn from_index_of(entry: u64) -> u64 {
    (entry >> FROM_INDEX_SHIFT) & FROM_INDEX_MASK
}

fn to_of(entry: u64) -> Address {
    Address((entry >> TO_SHIFT) as usize * OBJECT_ALIGNMENT)
}

fn hash(from_index: u64) -> usize {
    let h = from_index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h ^ (h >> 29)) as usize
}

/// Relocation bookkeeping for one region.
pub struct Forwarding {
    region: Arc<Region>,
    from_age: RegionAge,
    to_age: RegionAge,
    entries: Range<usize>,
    claimed: AtomicBool,
    done: AtomicBool,
    in_place: AtomicBool,
    relocated_bytes: AtomicUsize,
}

impl Forwarding {
    /// Number of entries needed for a region with `live_objects` live objects.
    pub fn nentries_for(live_objects: usize) -> usize {
        (live_objects * 2).max(1).next_power_of_two()
    }

    /// Creates a record for `region` using the arena entries in `entries`.
    pub fn new(region: Arc<Region>, to_age: RegionAge, entries: Range<usize>) -> Self {
        assert!(
            entries.len().is_power_of_two(),
            "entry table size {} is not a power of two",
            entries.len()
        );
        Forwarding {
            from_age: region.age(),
            region,
            to_age,
            entries,
            claimed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            in_place: AtomicBool::new(false),
            relocated_bytes: AtomicUsize::new(0),
        }
    }

    /// Region being relocated.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Age of the region when the record was created.
    pub fn from_age(&self) -> RegionAge {
        self.from_age
    }

    /// Age of the region's objects after relocation.
    pub fn to_age(&self) -> RegionAge {
        self.to_age
    }

    /// True when relocation promotes the region's objects to old.
    pub fn is_promotion(&self) -> bool {
        self.from_age.is_young() && !self.to_age.is_young()
    }

    /// Size of the entry table.
    pub fn nentries(&self) -> usize {
        self.entries.len()
    }

    /// Claims the record for relocation. Only the first caller succeeds.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// True once a worker claimed the record.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Marks every live object as relocated.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// True once every live object has been relocated.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Switches the record to in-place relocation.
    pub fn set_in_place(&self) {
        self.in_place.store(true, Ordering::Release);
    }

    /// True if relocation ran out of target space and kept objects in place.
    pub fn in_place(&self) -> bool {
        self.in_place.load(Ordering::Acquire)
    }

    /// Records bytes copied out of the region.
    pub fn add_relocated(&self, bytes: usize) {
        self.relocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes copied out of the region so far.
    pub fn relocated_bytes(&self) -> usize {
        self.relocated_bytes.load(Ordering::Relaxed)
    }

    fn from_index(&self, from: Address) -> u64 {
        (self.region.offset_of(from) / OBJECT_ALIGNMENT) as u64
    }
}

impl fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarding")
            .field("region", &self.region.id())
            .field("from_age", &self.from_age)
            .field("to_age", &self.to_age)
            .field("nentries", &self.nentries())
            .field("claimed", &self.is_claimed())
            .field("done", &self.is_done())
            .field("in_place", &self.in_place())
            .finish()
    }
}

/// Shared handle to a forwarding record installed in an arena.
///
/// The handle keeps the arena alive, so a barrier holding one can keep using
/// the record even after the relocation set was reset.
#[derive(Clone)]
pub struct ForwardingRef {
    arena: Arc<ForwardingArena>,
    slot: usize,
}

impl ForwardingRef {
    /// Creates a handle to an installed slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not installed.
    pub fn new(arena: Arc<ForwardingArena>, slot: usize) -> Self {
        assert!(arena.slot(slot).is_some(), "forwarding slot {} is not installed", slot);
        ForwardingRef { arena, slot }
    }

    /// Slot index in the relocation set.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// True if both handles refer to the same record.
    pub fn same(&self, other: &ForwardingRef) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.slot == other.slot
    }

    /// Looks up the new address of the object at `from`.
    pub fn find(&self, from: Address) -> Option<Address> {
        let from_index = self.from_index(from);
        let mask = self.nentries() - 1;
        let mut cursor = hash(from_index) & mask;

        for _ in 0..self.nentries() {
            let entry = self.entry(cursor).load(Ordering::Acquire);
            if !is_populated(entry) {
                return None;
            }
            if from_index_of(entry) == from_index {
                return Some(to_of(entry));
            }
            cursor = (cursor + 1) & mask;
        }
        None
    }

    /// Publishes `from -> to` unless another thread already forwarded `from`.
    ///
    /// Returns the address that won.
    ///
    /// # Panics
    ///
    /// Panics if the entry table is full.
    pub fn insert(&self, from: Address, to: Address) -> Address {
        let from_index = self.from_index(from);
        let new_entry = encode(from_index, to);
        let mask = self.nentries() - 1;
        let mut cursor = hash(from_index) & mask;

        for _ in 0..self.nentries() {
            let slot = self.entry(cursor);
            let mut entry = slot.load(Ordering::Acquire);
            if !is_populated(entry) {
                match slot.compare_exchange(0, new_entry, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return to,
                    Err(current) => entry = current,
                }
            }
            if from_index_of(entry) == from_index {
                return to_of(entry);
            }
            cursor = (cursor + 1) & mask;
        }
        panic!(
            "forwarding table for region {} is full ({} entries)",
            self.region().id(),
            self.nentries()
        );
    }

    fn entry(&self, index: usize) -> &std::sync::atomic::AtomicU64 {
        self.arena.entry(self.entries.start + index)
    }
}

impl Deref for ForwardingRef {
    type Target = Forwarding;

    fn deref(&self) -> &Forwarding {
        match self.arena.slot(self.slot) {
            Some(forwarding) => forwarding,
            None => unreachable!("forwarding slot {} vanished", self.slot),
        }
    }
}

impl fmt::Debug for ForwardingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForwardingRef").field(&self.slot).field(&**self).finish()
    }
}
