pub mod allocator;

use std::fmt;

/// A contiguous span `[base, base + length)` handed out by a [`RangeAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange {
    pub base: u64,
    pub length: u64,
}

impl AddressRange {
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// One past the last address of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}, 0x{:x})", self.base, self.end())
    }
}

// Re-export the allocator for easy access
pub use allocator::RangeAllocator;
