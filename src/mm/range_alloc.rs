// Free virtual-range tracking for one address space.
//
// The free set is an ordered map keyed by range start. Invariant: entries
// are disjoint and maximally coalesced, so adjacency checks against the
// two neighbors are enough on deallocation.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{align_up, VirtRange, PAGE_SIZE};
use crate::err::*;

pub struct RangeAllocator {
    total: VirtRange,
    free: BTreeMap<u64, u64>, // start -> size
}

impl RangeAllocator {
    pub fn new(total: VirtRange) -> Self {
        let mut free = BTreeMap::new();
        free.insert(total.start, total.size);
        Self { total, free }
    }

    pub fn total_range(&self) -> VirtRange {
        self.total
    }

    /// First fit with alignment. `alignment` must be a power of two
    /// multiple of the page size.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<VirtRange, ErrorCode> {
        debug_assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE);
        debug_assert_eq!(size & (PAGE_SIZE - 1), 0);
        debug_assert_ne!(size, 0);

        let mut found: Option<(u64, u64, u64)> = None; // (run start, run size, alloc start)
        for (&start, &run_size) in self.free.iter() {
            let aligned = align_up(start, alignment);
            if aligned + size <= start + run_size {
                found = Some((start, run_size, aligned));
                break;
            }
        }

        let Some((run_start, run_size, alloc_start)) = found else {
            log::warn!(
                "RangeAllocator: no free range of size 0x{:x} (align 0x{:x})",
                size,
                alignment
            );
            return Err(E_OUT_OF_MEMORY);
        };

        let range = VirtRange::new(alloc_start, size);
        self.carve(run_start, run_size, range);
        Ok(range)
    }

    /// Reserves exactly `range`; fails unless it lies wholly within one
    /// free run.
    pub fn allocate_specific(&mut self, range: VirtRange) -> Result<(), ErrorCode> {
        debug_assert!(!range.is_empty());

        let run = self
            .free
            .range(..=range.start)
            .next_back()
            .map(|(&start, &size)| (start, size));

        match run {
            Some((run_start, run_size))
                if VirtRange::new(run_start, run_size).contains_range(&range) =>
            {
                self.carve(run_start, run_size, range);
                Ok(())
            }
            _ => Err(E_OUT_OF_MEMORY),
        }
    }

    /// Uniformly picks one of the free runs that can hold the allocation,
    /// then an aligned position inside it. This is what makes mmap()
    /// placement unpredictable.
    pub fn allocate_randomized(&mut self, size: u64, alignment: u64) -> Result<VirtRange, ErrorCode> {
        debug_assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE);
        debug_assert_ne!(size, 0);

        let candidates: Vec<(u64, u64)> = self
            .free
            .iter()
            .filter(|(&start, &run_size)| align_up(start, alignment) + size <= start + run_size)
            .map(|(&start, &size)| (start, size))
            .collect();

        if candidates.is_empty() {
            log::warn!("RangeAllocator: randomized alloc of 0x{:x} bytes: OOM", size);
            return Err(E_OUT_OF_MEMORY);
        }

        let (run_start, run_size) =
            candidates[(crate::util::prng(0) as usize) % candidates.len()];

        let first = align_up(run_start, alignment);
        let last = run_start + run_size - size; // >= first by the filter above
        let slots = (last - first) / alignment + 1;
        let alloc_start = first + ((crate::util::prng(0) as u64) % slots) * alignment;

        let range = VirtRange::new(alloc_start, size);
        self.carve(run_start, run_size, range);
        Ok(range)
    }

    /// Returns `range` to the free pool, coalescing with both neighbors.
    pub fn deallocate(&mut self, range: VirtRange) {
        debug_assert!(!range.is_empty());
        debug_assert!(self.total.contains_range(&range));

        let mut start = range.start;
        let mut end = range.end();

        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            assert!(prev_start + prev_size <= start); // Double free is corruption.
            if prev_start + prev_size == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }

        if let Some((&next_start, &next_size)) = self.free.range(range.start..).next() {
            assert!(next_start >= end);
            if next_start == end {
                self.free.remove(&next_start);
                end = next_start + next_size;
            }
        }

        self.free.insert(start, end - start);
    }

    fn carve(&mut self, run_start: u64, run_size: u64, alloc: VirtRange) {
        self.free.remove(&run_start);

        if alloc.start > run_start {
            self.free.insert(run_start, alloc.start - run_start);
        }
        let run_end = run_start + run_size;
        if alloc.end() < run_end {
            self.free.insert(alloc.end(), run_end - alloc.end());
        }
    }

    #[cfg(test)]
    fn free_runs(&self) -> Vec<VirtRange> {
        self.free
            .iter()
            .map(|(&start, &size)| VirtRange::new(start, size))
            .collect()
    }
}
