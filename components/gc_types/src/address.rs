//! Heap addresses and granule arithmetic.

use std::fmt;

/// Log2 of the granule size. Small regions are exactly one granule.
pub const GRANULE_SHIFT: usize = 21;

/// Size of one granule in bytes (2 MiB).
pub const GRANULE_SIZE: usize = 1 << GRANULE_SHIFT;

/// Alignment of every object start address.
pub const OBJECT_ALIGNMENT: usize = 8;

/// A heap address.
///
/// Addresses are plain offsets into the collector's address space. The zero
/// address is never handed out by an allocator and doubles as "null".
///
/// # Examples
///
/// ```
/// use gc_types::{Address, GRANULE_SIZE};
///
/// let addr = Address(3 * GRANULE_SIZE + 16);
/// assert_eq!(addr.granule(), 3);
/// assert_eq!(addr.offset(8), Address(3 * GRANULE_SIZE + 24));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Returns true if this is the null address.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the granule index this address falls into.
    pub fn granule(self) -> usize {
        self.0 >> GRANULE_SHIFT
    }

    /// Returns the address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// Returns true if the address is object-aligned.
    pub fn is_aligned(self) -> bool {
        self.0 % OBJECT_ALIGNMENT == 0
    }

    /// Rounds `size` up to the object alignment.
    pub fn align_size(size: usize) -> usize {
        (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
