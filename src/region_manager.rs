//! Owns the region array and the free/old/humongous sets.
//!
//! Sets are modeled as intrusive linked lists threaded through
//! `Region::prev`/`Region::next` (index-based, not owned-node pointers) per
//! the design note on avoiding a graph of owned nodes: the region array is
//! the sole owner of every `Region`, and every other structure refers to
//! regions only by `RegionId`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::addr::Addr;
use crate::error::GcError;
use crate::region::{ContainingSet, Region, RegionId, RegionKind};

/// An index-ordered intrusive doubly-linked list over a subset of regions.
/// `head`/`tail` are `RegionId`s; `Region::prev`/`next` fields (u32::MAX =
/// no link) form the chain. All mutation happens under the owning
/// `RegionManager`'s set-specific mutex.
struct LinkedSet {
    head: Option<RegionId>,
    tail: Option<RegionId>,
    len: usize,
}

impl LinkedSet {
    fn new() -> Self {
        LinkedSet { head: None, tail: None, len: 0 }
    }

    fn push_back(&mut self, regions: &[Region], id: RegionId) {
        regions[id.index()].prev.store(self.tail.map_or(u32::MAX, |t| t.0), Ordering::Release);
        regions[id.index()].next.store(u32::MAX, Ordering::Release);
        if let Some(tail) = self.tail {
            regions[tail.index()].next.store(id.0, Ordering::Release);
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
        self.len += 1;
    }

    fn pop_front(&mut self, regions: &[Region]) -> Option<RegionId> {
        let head = self.head?;
        let next = regions[head.index()].next.load(Ordering::Acquire);
        self.head = if next == u32::MAX { None } else { Some(RegionId(next)) };
        if let Some(new_head) = self.head {
            regions[new_head.index()].prev.store(u32::MAX, Ordering::Release);
        } else {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    fn remove(&mut self, regions: &[Region], id: RegionId) {
        let prev = regions[id.index()].prev.load(Ordering::Acquire);
        let next = regions[id.index()].next.load(Ordering::Acquire);
        if prev == u32::MAX {
            self.head = if next == u32::MAX { None } else { Some(RegionId(next)) };
        } else {
            regions[prev as usize].next.store(next, Ordering::Release);
        }
        if next == u32::MAX {
            self.tail = if prev == u32::MAX { None } else { Some(RegionId(prev)) };
        } else {
            regions[next as usize].prev.store(prev, Ordering::Release);
        }
        self.len -= 1;
    }

    /// Inserts `id` keeping the list in index-ascending order, regardless of
    /// where `id` falls relative to what's already linked. The free set
    /// relies on this order for `remove_starting_at`'s contiguous-run scan.
    fn add_ordered(&mut self, regions: &[Region], id: RegionId) {
        let mut cur = self.head;
        let mut prev: Option<RegionId> = None;
        while let Some(c) = cur {
            if c.0 > id.0 {
                break;
            }
            prev = Some(c);
            let next = regions[c.index()].next.load(Ordering::Acquire);
            cur = if next == u32::MAX { None } else { Some(RegionId(next)) };
        }

        regions[id.index()].prev.store(prev.map_or(u32::MAX, |p| p.0), Ordering::Release);
        regions[id.index()].next.store(cur.map_or(u32::MAX, |c| c.0), Ordering::Release);

        match prev {
            Some(p) => regions[p.index()].next.store(id.0, Ordering::Release),
            None => self.head = Some(id),
        }
        match cur {
            Some(c) => regions[c.index()].prev.store(id.0, Ordering::Release),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Removes a contiguous run of `count` regions starting at `start`,
    /// which must already be linked in index-ascending order (the
    /// invariant `add_ordered`/`push_back` maintain). Used by the
    /// humongous allocator, which always claims a contiguous index range.
    fn remove_starting_at(&mut self, regions: &[Region], start: RegionId, count: usize) {
        for i in 0..count {
            self.remove(regions, RegionId(start.0 + i as u32));
        }
    }

    /// Removes `id` if it is linked, searching forward from the head for at
    /// most `max_search_depth` hops before giving up. Returns whether `id`
    /// was found and removed. Bounding the search keeps an old-set removal
    /// from degrading into an unbounded list walk if `id` is not actually a
    /// member (a caller passes this defensively rather than asserting).
    fn remove_with_node_index(&mut self, regions: &[Region], id: RegionId, max_search_depth: usize) -> bool {
        let mut cur = self.head;
        let mut depth = 0usize;
        while let Some(c) = cur {
            if c == id {
                self.remove(regions, id);
                return true;
            }
            if depth >= max_search_depth {
                return false;
            }
            let next = regions[c.index()].next.load(Ordering::Acquire);
            cur = if next == u32::MAX { None } else { Some(RegionId(next)) };
            depth += 1;
        }
        false
    }

    fn iter<'a>(&self, regions: &'a [Region]) -> LinkedSetIter<'a> {
        LinkedSetIter { regions, cur: self.head }
    }
}

struct LinkedSetIter<'a> {
    regions: &'a [Region],
    cur: Option<RegionId>,
}

impl<'a> Iterator for LinkedSetIter<'a> {
    type Item = RegionId;
    fn next(&mut self) -> Option<RegionId> {
        let cur = self.cur?;
        let next = self.regions[cur.index()].next.load(Ordering::Acquire);
        self.cur = if next == u32::MAX { None } else { Some(RegionId(next)) };
        Some(cur)
    }
}

pub struct RegionManager {
    pub heap_start: Addr,
    pub grain_words: usize,
    regions: Box<[Region]>,
    committed: AtomicUsize,
    free_set: Mutex<LinkedSet>,
    old_set: Mutex<LinkedSet>,
    humongous_starts: Mutex<Vec<RegionId>>,
    claim_cursor: AtomicUsize,
}

impl RegionManager {
    pub fn new(heap_start: Addr, grain_words: usize, max_regions: usize) -> Self {
        debug_assert!(grain_words.is_power_of_two());
        let grain_bytes = grain_words * crate::addr::BYTES_IN_WORD;
        let mut regions = Vec::with_capacity(max_regions);
        for i in 0..max_regions {
            let bottom = heap_start + i * grain_bytes;
            let end = bottom + grain_bytes;
            regions.push(Region::new(RegionId(i as u32), bottom, end));
        }
        let mut free_set = LinkedSet::new();
        for r in &regions {
            r.set_containing_set(ContainingSet::Free);
            free_set.push_back(&regions, r.id);
        }
        RegionManager {
            heap_start,
            grain_words,
            regions: regions.into_boxed_slice(),
            committed: AtomicUsize::new(max_regions),
            free_set: Mutex::new(free_set),
            old_set: Mutex::new(LinkedSet::new()),
            humongous_starts: Mutex::new(Vec::new()),
            claim_cursor: AtomicUsize::new(0),
        }
    }

    pub fn grain_bytes(&self) -> usize {
        self.grain_words * crate::addr::BYTES_IN_WORD
    }

    pub fn region_count(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.index()]
    }

    pub fn all_regions(&self) -> &[Region] {
        &self.regions[..self.region_count()]
    }

    #[inline]
    pub fn addr_to_region(&self, addr: Addr) -> RegionId {
        let offset = addr - self.heap_start;
        RegionId((offset / self.grain_bytes()) as u32)
    }

    pub fn free_count(&self) -> usize {
        self.free_set.lock().unwrap().len
    }

    pub fn old_count(&self) -> usize {
        self.old_set.lock().unwrap().len
    }

    pub fn humongous_count(&self) -> usize {
        self.humongous_starts.lock().unwrap().len()
    }

    /// Pops one region from the free set and promotes it to `kind`.
    pub fn allocate_region(&self, kind: RegionKind) -> Result<RegionId, GcError> {
        let mut free = self.free_set.lock().unwrap();
        let id = free.pop_front(&self.regions).ok_or(GcError::AllocationExhausted {
            words_requested: self.grain_words,
        })?;
        drop(free);
        let region = self.region(id);
        region.set_kind(kind);
        region.set_containing_set(ContainingSet::None);
        Ok(id)
    }

    /// Reserves `ceil(word_size / grain_words)` contiguous free regions for
    /// a humongous object, marking the first `StartsHumongous` and the rest
    /// `ContinuesHumongous`. This simplified allocator scans the free list
    /// for a contiguous run rather than maintaining a separate
    /// free-by-contiguous-run index, which is adequate for a heap with a
    /// modest region count.
    pub fn allocate_humongous(&self, word_size: usize) -> Result<RegionId, GcError> {
        let n = word_size.div_ceil(self.grain_words).max(1);
        let mut free = self.free_set.lock().unwrap();
        let ids: Vec<RegionId> = free.iter(&self.regions).collect();
        let run = ids
            .windows(n)
            .find(|w| w.windows(2).all(|p| p[1].0 == p[0].0 + 1))
            .ok_or(GcError::AllocationExhausted { words_requested: word_size })?
            .to_vec();
        free.remove_starting_at(&self.regions, run[0], run.len());
        drop(free);
        for (i, id) in run.iter().enumerate() {
            let region = self.region(*id);
            region.set_kind(if i == 0 {
                RegionKind::StartsHumongous
            } else {
                RegionKind::ContinuesHumongous
            });
            region.set_containing_set(ContainingSet::Humongous);
        }
        self.humongous_starts.lock().unwrap().push(run[0]);
        Ok(run[0])
    }

    /// Returns a region to the free set, keeping the free set's
    /// index-ascending order invariant regardless of which region is freed.
    pub fn free_region(&self, id: RegionId) {
        let region = self.region(id);
        region.reset_for_reuse();
        region.set_containing_set(ContainingSet::Free);
        self.free_set.lock().unwrap().add_ordered(&self.regions, id);
    }

    /// Frees a humongous object's regions, starting at `start`.
    pub fn free_humongous_region(&self, start: RegionId) {
        let mut starts = self.humongous_starts.lock().unwrap();
        starts.retain(|&id| id != start);
        drop(starts);
        let mut id = start.index();
        loop {
            let region = &self.regions[id];
            let is_continuation = id != start.index() && region.kind() == RegionKind::ContinuesHumongous;
            if id != start.index() && !is_continuation {
                break;
            }
            self.free_region(RegionId(id as u32));
            id += 1;
            if id >= self.region_count() || self.regions[id].kind() != RegionKind::ContinuesHumongous {
                break;
            }
        }
    }

    pub fn add_to_old_set(&self, id: RegionId) {
        let region = self.region(id);
        region.set_containing_set(ContainingSet::Old);
        self.old_set.lock().unwrap().push_back(&self.regions, id);
    }

    pub fn remove_from_old_set(&self, id: RegionId) {
        self.old_set.lock().unwrap().remove(&self.regions, id);
    }

    /// As `remove_from_old_set`, but tolerant of `id` not actually being
    /// linked (or the search taking too long): searches at most
    /// `max_search_depth` hops from the head and reports whether it found
    /// and removed `id`, rather than assuming membership.
    pub fn try_remove_from_old_set(&self, id: RegionId, max_search_depth: usize) -> bool {
        self.old_set.lock().unwrap().remove_with_node_index(&self.regions, id, max_search_depth)
    }

    pub fn old_regions(&self) -> Vec<RegionId> {
        self.old_set.lock().unwrap().iter(&self.regions).collect()
    }

    /// Merges a batch of freed region ids into the free set in one pass,
    /// regardless of the order `other_free` arrives in.
    pub fn merge_free_sets(&self, other_free: Vec<RegionId>) {
        let mut free = self.free_set.lock().unwrap();
        for id in other_free {
            free.add_ordered(&self.regions, id);
        }
    }

    /// Resets the parallel-iteration claim cursor. Call once per pause
    /// before workers start claiming stripes.
    pub fn reset_claim_cursor(&self) {
        self.claim_cursor.store(0, Ordering::Relaxed);
    }

    /// Claims a contiguous stripe of up to `stripe_len` indices out of
    /// `total`; returns `None` once every index is claimed. The general
    /// form behind `claim_stripe`, usable over any index space sharing this
    /// manager's claim cursor (e.g. a slice of `old_regions` rather than
    /// every committed region) without needing a second cursor.
    pub fn claim_stripe_over(&self, total: usize, stripe_len: usize) -> Option<std::ops::Range<usize>> {
        let start = self.claim_cursor.fetch_add(stripe_len, Ordering::Relaxed);
        if start >= total {
            return None;
        }
        Some(start..(start + stripe_len).min(total))
    }

    /// Claims a contiguous stripe of up to `stripe_len` region indices for
    /// parallel iteration over every committed region; returns `None` once
    /// all regions are claimed.
    pub fn claim_stripe(&self, stripe_len: usize) -> Option<std::ops::Range<usize>> {
        self.claim_stripe_over(self.region_count(), stripe_len)
    }

    /// Sequential iteration helper, mostly used by tests and single-threaded
    /// consistency checks.
    pub fn iterate(&self, mut f: impl FnMut(&Region)) {
        for r in self.all_regions() {
            f(r);
        }
    }

    /// A per-kind region tally, logged at the end of every pause for
    /// observability (spec §0.1/§6.6).
    pub fn counts_by_kind(&self) -> enum_map::EnumMap<RegionKind, usize> {
        let mut counts = enum_map::EnumMap::default();
        for r in self.all_regions() {
            counts[r.kind()] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> RegionManager {
        RegionManager::new(Addr::from_usize(0x10_0000), 1 << 10, n)
    }

    #[test]
    fn allocate_and_free_round_trips() {
        let mgr = manager(4);
        assert_eq!(mgr.free_count(), 4);
        let id = mgr.allocate_region(RegionKind::Eden).unwrap();
        assert_eq!(mgr.free_count(), 3);
        assert_eq!(mgr.region(id).kind(), RegionKind::Eden);
        mgr.free_region(id);
        assert_eq!(mgr.free_count(), 4);
        assert_eq!(mgr.region(id).kind(), RegionKind::Free);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mgr = manager(1);
        mgr.allocate_region(RegionKind::Eden).unwrap();
        assert!(matches!(
            mgr.allocate_region(RegionKind::Eden),
            Err(GcError::AllocationExhausted { .. })
        ));
    }

    #[test]
    fn humongous_allocation_spans_contiguous_regions() {
        let mgr = manager(4);
        let grain_words = mgr.grain_words;
        let start = mgr.allocate_humongous(grain_words * 2 + 1).unwrap();
        assert_eq!(mgr.region(start).kind(), RegionKind::StartsHumongous);
        assert_eq!(mgr.region(RegionId(start.0 + 1)).kind(), RegionKind::ContinuesHumongous);
        assert_eq!(mgr.region(RegionId(start.0 + 2)).kind(), RegionKind::ContinuesHumongous);
        assert_eq!(mgr.free_count(), 1);
        mgr.free_humongous_region(start);
        assert_eq!(mgr.free_count(), 4);
    }

    #[test]
    fn addr_to_region_maps_back() {
        let mgr = manager(4);
        let id = mgr.allocate_region(RegionKind::Eden).unwrap();
        let r = mgr.region(id);
        assert_eq!(mgr.addr_to_region(r.bottom), id);
        assert_eq!(mgr.addr_to_region(r.bottom + 4), id);
    }

    #[test]
    fn claim_stripe_covers_every_region_once() {
        let mgr = manager(10);
        mgr.reset_claim_cursor();
        let mut seen = vec![false; 10];
        while let Some(range) = mgr.claim_stripe(3) {
            for i in range {
                assert!(!seen[i]);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn claim_stripe_over_covers_a_smaller_index_space() {
        let mgr = manager(10);
        mgr.reset_claim_cursor();
        let mut seen = vec![false; 6];
        while let Some(range) = mgr.claim_stripe_over(6, 4) {
            for i in range {
                assert!(!seen[i]);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn free_region_keeps_free_set_index_ascending() {
        let mgr = manager(4);
        let a = mgr.allocate_region(RegionKind::Eden).unwrap();
        let b = mgr.allocate_region(RegionKind::Eden).unwrap();
        let c = mgr.allocate_region(RegionKind::Eden).unwrap();
        // free out of index order; the free set must still hand regions back
        // out starting from the lowest index.
        mgr.free_region(c);
        mgr.free_region(a);
        mgr.free_region(b);
        let mut reallocated = Vec::new();
        while let Ok(id) = mgr.allocate_region(RegionKind::Eden) {
            reallocated.push(id);
        }
        assert_eq!(reallocated, vec![RegionId(0), a, b, c].into_iter().skip(1).collect::<Vec<_>>());
    }

    #[test]
    fn merge_free_sets_accepts_any_arrival_order() {
        let mgr = manager(5);
        let ids: Vec<RegionId> = (0..5).map(|_| mgr.allocate_region(RegionKind::Old).unwrap()).collect();
        assert_eq!(mgr.free_count(), 0);
        for id in &ids {
            mgr.region(*id).reset_for_reuse();
            mgr.region(*id).set_containing_set(ContainingSet::None);
        }
        mgr.merge_free_sets(vec![ids[3], ids[0], ids[4], ids[1], ids[2]]);
        assert_eq!(mgr.free_count(), 5);
        let mut reallocated = Vec::new();
        while let Ok(id) = mgr.allocate_region(RegionKind::Old) {
            reallocated.push(id);
        }
        assert_eq!(reallocated, ids);
    }

    #[test]
    fn try_remove_from_old_set_reports_absence_within_bound() {
        let mgr = manager(4);
        let a = mgr.allocate_region(RegionKind::Old).unwrap();
        let b = mgr.allocate_region(RegionKind::Old).unwrap();
        mgr.add_to_old_set(a);
        assert!(mgr.try_remove_from_old_set(a, 10));
        assert_eq!(mgr.old_count(), 0);
        assert!(!mgr.try_remove_from_old_set(b, 10));
    }
}
