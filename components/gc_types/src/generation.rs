//! Generation identifiers.

use std::fmt;

/// Identifies one of the two generations.
///
/// Each generation runs its own collector phase state machine; the two
/// machines are independent and may interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationId {
    /// Young generation (eden and survivor regions)
    Young,
    /// Old generation
    Old,
}

impl GenerationId {
    /// Returns a human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            GenerationId::Young => "Young",
            GenerationId::Old => "Old",
        }
    }

    /// Returns the prefix used for worker thread names.
    pub fn worker_prefix(self) -> &'static str {
        match self {
            GenerationId::Young => "gc-worker-young",
            GenerationId::Old => "gc-worker-old",
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
