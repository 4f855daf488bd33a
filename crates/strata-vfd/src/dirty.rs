//! Dirty-region tracking for the memory driver's backing store.
//!
//! Written ranges are widened to whole pages (clipped at EOF) and kept in a
//! map keyed by start address. Every insert merges with overlapping or
//! touching neighbors, so the set is always non-overlapping and
//! non-adjacent: for consecutive regions `a` and `b`, `b.start > a.end + 1`.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::ops::Bound::{Excluded, Included};

use crate::error::{VfdError, VfdResult};
use crate::types::Addr;

/// An inclusive byte range awaiting write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    pub start: Addr,
    pub end: Addr,
}

impl DirtyRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, addr: Addr) -> bool {
        (self.start..=self.end).contains(&addr)
    }
}

/// Ordered, self-coalescing set of dirty regions.
#[derive(Debug, Clone)]
pub struct DirtyRegionTracker {
    page_size: NonZeroU64,
    regions: BTreeMap<Addr, Addr>,
}

impl DirtyRegionTracker {
    pub fn new(page_size: NonZeroU64) -> Self {
        Self {
            page_size,
            regions: BTreeMap::new(),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size.get()
    }

    /// Record `[start, end]` as dirty in a file that currently ends at `eof`.
    pub fn insert(&mut self, start: Addr, end: Addr, eof: Addr) -> VfdResult<()> {
        if start > end {
            return Err(VfdError::bad_value(format!(
                "dirty region start {start} past end {end}"
            )));
        }
        if end >= eof {
            return Err(VfdError::bad_range(format!(
                "dirty region end {end} at or past eof {eof}"
            )));
        }

        let page = self.page_size.get();
        let mut start = start - start % page;
        let mut end = end;
        if end % page != page - 1 {
            end = (end / page + 1)
                .saturating_mul(page)
                .saturating_sub(1)
                .min(eof - 1);
        }

        // Fold into a predecessor that overlaps or touches
        if let Some((&prev_start, &prev_end)) = self.regions.range(..=start).next_back() {
            if prev_end.saturating_add(1) >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        // Swallow every later region that starts inside or right after us
        let absorbed: Vec<Addr> = self
            .regions
            .range((Excluded(start), Included(end.saturating_add(1))))
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.regions.remove(&s) {
                end = end.max(e);
            }
        }

        let slot = self.regions.entry(start).or_insert(end);
        *slot = (*slot).max(end);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = DirtyRegion> + '_ {
        self.regions
            .iter()
            .map(|(&start, &end)| DirtyRegion { start, end })
    }

    /// Remove and return the lowest region.
    pub fn pop_first(&mut self) -> Option<DirtyRegion> {
        self.regions
            .pop_first()
            .map(|(start, end)| DirtyRegion { start, end })
    }

    pub fn is_dirty(&self, addr: Addr) -> bool {
        self.regions
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &end)| addr <= end)
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(page: u64) -> DirtyRegionTracker {
        DirtyRegionTracker::new(NonZeroU64::new(page).unwrap())
    }

    fn spans(t: &DirtyRegionTracker) -> Vec<(Addr, Addr)> {
        t.regions().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_rounds_to_pages() {
        let mut t = tracker(4096);
        t.insert(10, 19, 8192).unwrap();
        assert_eq!(spans(&t), vec![(0, 4095)]);
    }

    #[test]
    fn test_clips_to_eof() {
        let mut t = tracker(4096);
        t.insert(5000, 5009, 6000).unwrap();
        assert_eq!(spans(&t), vec![(4096, 5999)]);
    }

    #[test]
    fn test_adjacent_pages_merge() {
        let mut t = tracker(4096);
        t.insert(0, 9, 8192).unwrap();
        t.insert(5000, 5009, 8192).unwrap();
        assert_eq!(spans(&t), vec![(0, 8191)]);
    }

    #[test]
    fn test_gap_keeps_regions_apart() {
        let mut t = tracker(100);
        t.insert(0, 0, 1000).unwrap();
        t.insert(300, 300, 1000).unwrap();
        assert_eq!(spans(&t), vec![(0, 99), (300, 399)]);

        // Filling the hole joins all three
        t.insert(150, 250, 1000).unwrap();
        assert_eq!(spans(&t), vec![(0, 399)]);
    }

    #[test]
    fn test_swallows_many_successors() {
        let mut t = tracker(10);
        for start in [20, 40, 60, 80] {
            t.insert(start, start, 1000).unwrap();
        }
        assert_eq!(t.len(), 4);
        t.insert(15, 75, 1000).unwrap();
        assert_eq!(spans(&t), vec![(10, 89)]);
    }

    #[test]
    fn test_contained_insert_is_noop() {
        let mut t = tracker(10);
        t.insert(0, 99, 1000).unwrap();
        t.insert(40, 45, 1000).unwrap();
        assert_eq!(spans(&t), vec![(0, 99)]);
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let mut t = tracker(10);
        assert!(matches!(t.insert(5, 4, 100), Err(VfdError::BadValue(_))));
        assert!(matches!(t.insert(0, 100, 100), Err(VfdError::BadRange(_))));
    }

    #[test]
    fn test_pop_first_in_order() {
        let mut t = tracker(10);
        t.insert(50, 50, 100).unwrap();
        t.insert(0, 0, 100).unwrap();
        assert!(t.is_dirty(55));
        assert!(!t.is_dirty(25));
        assert_eq!(t.pop_first(), Some(DirtyRegion { start: 0, end: 9 }));
        assert_eq!(t.pop_first(), Some(DirtyRegion { start: 50, end: 59 }));
        assert!(t.is_empty());
    }
}
