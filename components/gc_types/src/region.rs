//! Heap regions.
//!
//! A region is a contiguous extent of the heap with a size class and an age
//! tag. Regions are created by the allocator, marked by the mark engine, and
//! either evacuated or retagged by the relocation engine.
//!
//! A `Region` value is a *descriptor*: promoting a region in place produces a
//! fresh descriptor over the same extent, and the stale descriptor is destroyed
//! once no concurrent reader can observe it.

use crate::{Address, GenerationId, OBJECT_ALIGNMENT};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Highest survivor age. One more survival makes a region old.
pub const MAX_SURVIVOR_AGE: u8 = 14;

const AGE_EDEN: u8 = 0;
const AGE_OLD: u8 = MAX_SURVIVOR_AGE + 1;

/// Stable identity of a region's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Region size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// One granule, holds small objects
    Small,
    /// Several granules, holds medium objects
    Medium,
    /// Exactly one large object; never relocated
    Large,
}

/// Age tag of a region.
///
/// # Examples
///
/// ```
/// use gc_types::{GenerationId, RegionAge};
///
/// assert_eq!(RegionAge::Eden.generation(), GenerationId::Young);
/// assert_eq!(RegionAge::Survivor(3).generation(), GenerationId::Young);
/// assert_eq!(RegionAge::Old.generation(), GenerationId::Old);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionAge {
    /// Freshly allocated young region
    Eden,
    /// Young region that survived `n` collections (1..=MAX_SURVIVOR_AGE)
    Survivor(u8),
    /// Old generation region
    Old,
}

impl RegionAge {
    /// Returns the generation the age belongs to.
    pub fn generation(self) -> GenerationId {
        match self {
            RegionAge::Old => GenerationId::Old,
            _ => GenerationId::Young,
        }
    }

    /// Returns true for eden and survivor ages.
    pub fn is_young(self) -> bool {
        self.generation() == GenerationId::Young
    }

    fn encode(self) -> u8 {
        match self {
            RegionAge::Eden => AGE_EDEN,
            RegionAge::Survivor(n) => {
                assert!(
                    (1..=MAX_SURVIVOR_AGE).contains(&n),
                    "invalid survivor age {}",
                    n
                );
                n
            }
            RegionAge::Old => AGE_OLD,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            AGE_EDEN => RegionAge::Eden,
            AGE_OLD => RegionAge::Old,
            n => RegionAge::Survivor(n),
        }
    }
}

impl fmt::Display for RegionAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionAge::Eden => f.write_str("eden"),
            RegionAge::Survivor(n) => write!(f, "survivor{}", n),
            RegionAge::Old => f.write_str("old"),
        }
    }
}

/// An object located in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveObject {
    /// Start address of the object
    pub addr: Address,
    /// Size in bytes, object-aligned
    pub size: usize,
}

/// A contiguous heap extent.
pub struct Region {
    id: RegionId,
    size_class: SizeClass,
    start: Address,
    size: usize,
    age: AtomicU8,
    /// Bump offset of the next allocation
    top: AtomicUsize,
    /// Every object allocated in the region, in allocation order
    objects: Mutex<Vec<LiveObject>>,
    /// Objects marked live in the current cycle, keyed by offset
    live: Mutex<BTreeMap<usize, usize>>,
    live_objects: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl Region {
    /// Creates an empty region descriptor.
    pub fn new(id: RegionId, size_class: SizeClass, start: Address, size: usize, age: RegionAge) -> Self {
        debug_assert!(start.is_aligned());
        Region {
            id,
            size_class,
            start,
            size,
            age: AtomicU8::new(age.encode()),
            top: AtomicUsize::new(0),
            objects: Mutex::new(Vec::new()),
            live: Mutex::new(BTreeMap::new()),
            live_objects: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Creates a new descriptor for the same extent with a different age.
    ///
    /// Allocation state and liveness are carried over, so the new descriptor
    /// is indistinguishable from the old one apart from its age.
    pub fn clone_with_age(&self, age: RegionAge) -> Region {
        let live = self.live.lock().clone();
        Region {
            id: self.id,
            size_class: self.size_class,
            start: self.start,
            size: self.size,
            age: AtomicU8::new(age.encode()),
            top: AtomicUsize::new(self.top.load(Ordering::Acquire)),
            objects: Mutex::new(self.objects.lock().clone()),
            live: Mutex::new(live),
            live_objects: AtomicUsize::new(self.live_objects.load(Ordering::Relaxed)),
            live_bytes: AtomicUsize::new(self.live_bytes.load(Ordering::Relaxed)),
        }
    }

    /// Returns the region id.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Returns the size class.
    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// Returns the first address of the extent.
    pub fn start(&self) -> Address {
        self.start
    }

    /// Returns the address one past the extent.
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    /// Returns the extent size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if `addr` lies inside the extent.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Returns the current age tag.
    pub fn age(&self) -> RegionAge {
        RegionAge::decode(self.age.load(Ordering::Acquire))
    }

    /// Retags the region in place.
    pub fn set_age(&self, age: RegionAge) {
        self.age.store(age.encode(), Ordering::Release);
    }

    /// Returns the generation implied by the age tag.
    pub fn generation(&self) -> GenerationId {
        self.age().generation()
    }

    /// Returns the byte offset of `addr` within the region.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the region.
    pub fn offset_of(&self, addr: Address) -> usize {
        assert!(self.contains(addr), "{} is not in region {}", addr, self.id);
        addr.0 - self.start.0
    }

    /// Bytes handed out by bump allocation so far.
    pub fn used(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Allocates an object by bumping the top pointer.
    ///
    /// Returns `None` if the region cannot fit the object.
    pub fn alloc_object(&self, size: usize) -> Option<Address> {
        let size = Address::align_size(size.max(OBJECT_ALIGNMENT));
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top.checked_add(size)?;
            if new_top > self.size {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => top = current,
            }
        }

        let addr = self.start.offset(top);
        self.objects.lock().push(LiveObject { addr, size });
        Some(addr)
    }

    /// Undoes the most recent allocation if it is still the last one.
    ///
    /// Returns false if another allocation happened in between; the space is
    /// then left as garbage.
    pub fn undo_alloc_object(&self, addr: Address, size: usize) -> bool {
        let size = Address::align_size(size.max(OBJECT_ALIGNMENT));
        let offset = self.offset_of(addr);
        let undone = self
            .top
            .compare_exchange(offset + size, offset, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        let mut objects = self.objects.lock();
        if let Some(pos) = objects.iter().rposition(|o| o.addr == addr) {
            objects.remove(pos);
        }
        undone
    }

    /// Returns every object allocated in the region.
    pub fn objects(&self) -> Vec<LiveObject> {
        self.objects.lock().clone()
    }

    /// Returns the size of the allocated object starting at `addr`.
    pub fn object_size(&self, addr: Address) -> Option<usize> {
        self.objects
            .lock()
            .iter()
            .find(|o| o.addr == addr)
            .map(|o| o.size)
    }

    /// Clears the live map at the start of a marking cycle.
    pub fn clear_live(&self) {
        let mut live = self.live.lock();
        live.clear();
        self.live_objects.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Marks an object live. Returns false if it was already marked.
    pub fn mark_live(&self, addr: Address, size: usize) -> bool {
        let offset = self.offset_of(addr);
        let size = Address::align_size(size);
        let mut live = self.live.lock();
        if live.insert(offset, size).is_some() {
            return false;
        }
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Returns true if the object at `addr` is marked live.
    pub fn is_live(&self, addr: Address) -> bool {
        self.contains(addr) && self.live.lock().contains_key(&self.offset_of(addr))
    }

    /// Returns the size of the marked object starting at `addr`.
    pub fn live_size(&self, addr: Address) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        self.live.lock().get(&self.offset_of(addr)).copied()
    }

    /// Returns the marked objects in address order.
    pub fn live_map(&self) -> Vec<LiveObject> {
        self.live
            .lock()
            .iter()
            .map(|(&offset, &size)| LiveObject {
                addr: self.start.offset(offset),
                size,
            })
            .collect()
    }

    /// Number of live objects found by the last mark.
    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    /// Number of live bytes found by the last mark.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Allocated bytes not reachable according to the last mark.
    pub fn garbage_bytes(&self) -> usize {
        self.used().saturating_sub(self.live_bytes())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("size_class", &self.size_class)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("age", &self.age())
            .field("used", &self.used())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}
