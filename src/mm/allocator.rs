use super::AddressRange;
use crate::error::{InstmemError, InstmemResult};
use log::error;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Free-list bookkeeping. Both maps are keyed by start address and store lengths.
#[derive(Debug, Default)]
struct FreeList {
    free: BTreeMap<u64, u64>,
    allocated: BTreeMap<u64, u64>,
}

impl FreeList {
    /// Returns `[base, base + len)` to the free list, merging it with its neighbours.
    fn insert_free(&mut self, mut base: u64, mut len: u64) {
        if let Some((&prev_base, &prev_len)) = self.free.range(..base).next_back()
            && prev_base + prev_len == base
        {
            self.free.remove(&prev_base);
            base = prev_base;
            len += prev_len;
        }

        if let Some(next_len) = self.free.remove(&(base + len)) {
            len += next_len;
        }

        self.free.insert(base, len);
    }
}

/// First-fit allocator over a linear address space.
///
/// Used for the on-chip instance heap and for the IOMMU virtual space. Every
/// reservation is rounded to the allocator's granularity, and the free list is
/// coalesced on release so alternating allocate/free patterns do not fragment it.
/// All operations take an internal lock and may block.
#[derive(Debug)]
pub struct RangeAllocator {
    name: &'static str,
    base: u64,
    length: u64,
    granularity: u64,
    inner: Mutex<FreeList>,
}

impl RangeAllocator {
    /// Creates an allocator managing `[base, base + length)`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the space is empty, overflows `u64`, is not
    /// aligned to `granularity`, or if `granularity` is not a power of two.
    pub fn new(name: &'static str, base: u64, length: u64, granularity: u64) -> InstmemResult<Self> {
        if length == 0 {
            return Err(InstmemError::InvalidArgument(format!(
                "{name}: empty address space"
            )));
        }
        if !granularity.is_power_of_two() {
            return Err(InstmemError::InvalidArgument(format!(
                "{name}: granularity 0x{granularity:x} is not a power of two"
            )));
        }
        if base.checked_add(length).is_none() {
            return Err(InstmemError::InvalidArgument(format!(
                "{name}: space 0x{base:x}+0x{length:x} overflows"
            )));
        }
        if base % granularity != 0 || length % granularity != 0 {
            return Err(InstmemError::InvalidArgument(format!(
                "{name}: space 0x{base:x}+0x{length:x} not aligned to 0x{granularity:x}"
            )));
        }

        let mut list = FreeList::default();
        list.free.insert(base, length);

        Ok(Self {
            name,
            base,
            length,
            granularity,
            inner: Mutex::new(list),
        })
    }

    // Every critical section leaves both maps consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, FreeList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves `size` bytes aligned to `align` from the first free range that fits.
    ///
    /// `align` of 0 means "granularity"; it need not divide `size`.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or a non power-of-two alignment,
    /// `OutOfAddressSpace` when no free range can hold the request.
    pub fn reserve(&self, size: u64, align: u64) -> InstmemResult<AddressRange> {
        if size == 0 {
            return Err(InstmemError::InvalidArgument(format!(
                "{}: zero-sized reservation",
                self.name
            )));
        }
        let align = align.max(self.granularity);
        if !align.is_power_of_two() {
            return Err(InstmemError::InvalidArgument(format!(
                "{}: alignment 0x{align:x} is not a power of two",
                self.name
            )));
        }
        let size = size
            .checked_next_multiple_of(self.granularity)
            .ok_or(InstmemError::OutOfAddressSpace { size, align })?;

        let mut list = self.lock();

        let found = list.free.iter().find_map(|(&free_base, &free_len)| {
            let start = free_base.checked_next_multiple_of(align)?;
            let end = start.checked_add(size)?;
            (end <= free_base + free_len).then_some((free_base, free_len, start))
        });

        let Some((free_base, free_len, start)) = found else {
            return Err(InstmemError::OutOfAddressSpace { size, align });
        };

        // Split the hole: keep the alignment padding and the tail on the free list.
        list.free.remove(&free_base);
        if start > free_base {
            list.free.insert(free_base, start - free_base);
        }
        let end = start + size;
        let free_end = free_base + free_len;
        if free_end > end {
            list.free.insert(end, free_end - end);
        }
        list.allocated.insert(start, size);

        Ok(AddressRange::new(start, size))
    }

    /// Returns a range obtained from [`reserve`](Self::reserve).
    ///
    /// Releasing a range that is not an exact outstanding reservation is logged and ignored.
    pub fn release(&self, range: AddressRange) {
        let mut list = self.lock();

        if list.allocated.get(&range.base) != Some(&range.length) {
            drop(list);
            error!("{}: tried to release untracked range {range}", self.name);
            return;
        }

        list.allocated.remove(&range.base);
        list.insert_free(range.base, range.length);
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The managed space.
    #[must_use]
    pub const fn bounds(&self) -> AddressRange {
        AddressRange::new(self.base, self.length)
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Snapshot of the free list in address order.
    #[must_use]
    pub fn free_ranges(&self) -> Vec<AddressRange> {
        self.lock()
            .free
            .iter()
            .map(|(&base, &len)| AddressRange::new(base, len))
            .collect()
    }

    /// Snapshot of the outstanding reservations in address order.
    #[must_use]
    pub fn allocated_ranges(&self) -> Vec<AddressRange> {
        self.lock()
            .allocated
            .iter()
            .map(|(&base, &len)| AddressRange::new(base, len))
            .collect()
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.lock().free.values().sum()
    }

    /// True when nothing is reserved.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().allocated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(length: u64) -> RangeAllocator {
        RangeAllocator::new("test", 0, length, 0x1000).unwrap()
    }

    #[test]
    fn new_fails_size_zero() {
        assert!(RangeAllocator::new("t", 0x1000, 0, 0x1000).is_err());
    }

    #[test]
    fn new_fails_overflow() {
        assert!(RangeAllocator::new("t", u64::MAX - 0xfff, 0x2000, 0x1000).is_err());
    }

    #[test]
    fn new_fails_granularity_non_power_of_two() {
        assert!(RangeAllocator::new("t", 0, 0x3000, 0x3000).is_err());
    }

    #[test]
    fn new_fails_unaligned_space() {
        assert!(RangeAllocator::new("t", 0x800, 0x1000, 0x1000).is_err());
    }

    #[test]
    fn reserve_is_first_fit_and_sequential() {
        let mm = heap(0x40000);
        assert_eq!(mm.reserve(0x10000, 0).unwrap(), AddressRange::new(0, 0x10000));
        assert_eq!(
            mm.reserve(0x8000, 0).unwrap(),
            AddressRange::new(0x10000, 0x8000)
        );
        assert_eq!(
            mm.reserve(0x8000, 0).unwrap(),
            AddressRange::new(0x18000, 0x8000)
        );
        assert_eq!(mm.free_ranges(), vec![AddressRange::new(0x20000, 0x20000)]);
    }

    #[test]
    fn reserve_rounds_to_granularity() {
        let mm = heap(0x10000);
        let r = mm.reserve(0x10, 0).unwrap();
        assert_eq!(r.length, 0x1000);
    }

    #[test]
    fn reserve_honors_alignment_independent_of_size() {
        let mm = heap(0x100000);
        mm.reserve(0x1000, 0).unwrap();
        let r = mm.reserve(0x3000, 0x10000).unwrap();
        assert_eq!(r.base, 0x10000);
        // The alignment padding stays allocatable.
        assert_eq!(mm.reserve(0x1000, 0).unwrap().base, 0x1000);
    }

    #[test]
    fn reserve_fails_not_enough_space() {
        let mm = heap(0x4000);
        mm.reserve(0x2000, 0).unwrap();
        assert_eq!(
            mm.reserve(0x3000, 0),
            Err(InstmemError::OutOfAddressSpace {
                size: 0x3000,
                align: 0x1000
            })
        );
        assert!(mm.reserve(0x2000, 0).is_ok());
    }

    #[test]
    fn reserve_rejects_bad_arguments() {
        let mm = heap(0x4000);
        assert!(matches!(
            mm.reserve(0, 0),
            Err(InstmemError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm.reserve(0x1000, 0x3000),
            Err(InstmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mm = heap(0x10000);
        let a = mm.reserve(0x1000, 0).unwrap();
        let b = mm.reserve(0x1000, 0).unwrap();
        let c = mm.reserve(0x1000, 0).unwrap();

        mm.release(a);
        mm.release(c);
        assert_eq!(mm.free_ranges().len(), 2);

        mm.release(b);
        assert_eq!(mm.free_ranges(), vec![AddressRange::new(0, 0x10000)]);
        assert!(mm.is_idle());
    }

    #[test]
    fn release_untracked_is_ignored() {
        let mm = heap(0x10000);
        let a = mm.reserve(0x2000, 0).unwrap();
        mm.release(AddressRange::new(a.base, 0x1000));
        mm.release(AddressRange::new(0x8000, 0x1000));
        assert_eq!(mm.allocated_ranges(), vec![a]);

        mm.release(a);
        mm.release(a);
        assert_eq!(mm.free_bytes(), 0x10000);
    }

    #[test]
    fn nonzero_base_space() {
        let mm = RangeAllocator::new("iova", 0x10_0000, 0x10_0000, 0x1000).unwrap();
        let r = mm.reserve(0x1000, 0x4_0000).unwrap();
        assert_eq!(r.base, 0x10_0000);
        assert!(mm.bounds().contains(r.base));
    }
}
