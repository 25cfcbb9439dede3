//! Per-region side tables: the region-attribute byte table, and the
//! TAMS / live-bytes / top-at-rebuild-start arrays.
//!
//! These are plain region-indexed arrays rather than packed bit-offset
//! metadata (contrast the teacher's generalized side-metadata system, which
//! supports arbitrary multi-space layouts this crate does not need) — one
//! engine, one region array, one index space.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::region::RegionId;

/// Packed into one byte per region; read on every reference scanned during
/// evacuation, so it must stay a single relaxed/acquire load. Plain `u8`
/// bit constants rather than a `bitflags`-generated type, matching the
/// teacher's own preference for hand-rolled bit constants over that crate.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct RegionAttrs(u8);

impl RegionAttrs {
    pub const IN_CSET: RegionAttrs = RegionAttrs(0b0000_0001);
    pub const YOUNG: RegionAttrs = RegionAttrs(0b0000_0010);
    pub const OLD: RegionAttrs = RegionAttrs(0b0000_0100);
    pub const HUMONGOUS_CAND: RegionAttrs = RegionAttrs(0b0000_1000);
    pub const REMSET_TRACKED: RegionAttrs = RegionAttrs(0b0001_0000);
    pub const PINNED: RegionAttrs = RegionAttrs(0b0010_0000);
    pub const NEW_SURVIVOR: RegionAttrs = RegionAttrs(0b0100_0000);

    #[inline(always)]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub fn from_bits_truncate(bits: u8) -> Self {
        RegionAttrs(bits)
    }

    #[inline(always)]
    pub fn contains(self, other: RegionAttrs) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for RegionAttrs {
    type Output = RegionAttrs;
    fn bitor(self, rhs: RegionAttrs) -> RegionAttrs {
        RegionAttrs(self.0 | rhs.0)
    }
}

/// A region-indexed attribute byte table, used as the fast classifier on
/// the evacuation hot path: "is this reference's target region in the
/// collection set?" must be a single array load, not a chase through the
/// region manager's sets.
pub struct RegionAttrTable {
    bytes: Box<[AtomicU8]>,
}

impl RegionAttrTable {
    pub fn new(max_regions: usize) -> Self {
        RegionAttrTable {
            bytes: (0..max_regions).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn get(&self, id: RegionId) -> RegionAttrs {
        RegionAttrs::from_bits_truncate(self.bytes[id.index()].load(Ordering::Acquire))
    }

    pub fn set(&self, id: RegionId, attrs: RegionAttrs) {
        self.bytes[id.index()].store(attrs.bits(), Ordering::Release);
    }

    pub fn insert(&self, id: RegionId, flag: RegionAttrs) {
        self.bytes[id.index()].fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, id: RegionId, flag: RegionAttrs) {
        self.bytes[id.index()].fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn in_cset(&self, id: RegionId) -> bool {
        self.get(id).contains(RegionAttrs::IN_CSET)
    }

    pub fn clear_all(&self) {
        for b in self.bytes.iter() {
            b.store(0, Ordering::Relaxed);
        }
    }
}

/// A region-indexed `usize` array, used for the top-at-rebuild-start table
/// (and anywhere else a plain per-region scalar side table is needed).
pub struct RegionScalarTable {
    values: Box<[AtomicUsize]>,
}

impl RegionScalarTable {
    pub fn new(max_regions: usize) -> Self {
        RegionScalarTable {
            values: (0..max_regions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn get(&self, id: RegionId) -> usize {
        self.values[id.index()].load(Ordering::Acquire)
    }

    pub fn set(&self, id: RegionId, v: usize) {
        self.values[id.index()].store(v, Ordering::Release);
    }

    pub fn fetch_add(&self, id: RegionId, delta: usize) -> usize {
        self.values[id.index()].fetch_add(delta, Ordering::AcqRel)
    }
}

/// One byte per fixed-size card, tracking dirty/clean/young state for the
/// post-write barrier.
pub const CARD_BYTES: usize = 512;
pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 1;
pub const CARD_YOUNG: u8 = 2;

pub struct CardTable {
    heap_start: crate::addr::Addr,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(heap_start: crate::addr::Addr, heap_bytes: usize) -> Self {
        let n = heap_bytes.div_ceil(CARD_BYTES);
        CardTable {
            heap_start,
            cards: (0..n).map(|_| AtomicU8::new(CARD_CLEAN)).collect(),
        }
    }

    #[inline(always)]
    pub(crate) fn index_of(&self, addr: crate::addr::Addr) -> usize {
        (addr - self.heap_start) / CARD_BYTES
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    /// The address of the first byte covered by card `idx`. The inverse of
    /// `index_of`.
    pub fn addr_of(&self, idx: usize) -> crate::addr::Addr {
        self.heap_start + idx * CARD_BYTES
    }

    pub fn is_dirty_idx(&self, idx: usize) -> bool {
        self.cards[idx].load(Ordering::Acquire) == CARD_DIRTY
    }

    pub fn clear_idx(&self, idx: usize) {
        self.cards[idx].store(CARD_CLEAN, Ordering::Release);
    }

    /// The card-index range covering `[bottom, top)`, used by the
    /// remembered-set refinement pass to walk one region's cards without
    /// going through per-address lookups.
    pub fn card_range_of(&self, bottom: crate::addr::Addr, top: crate::addr::Addr) -> std::ops::Range<usize> {
        self.index_of(bottom)..self.index_of(top).min(self.cards.len())
    }

    /// The mutator's post-write barrier: dirty the card covering `addr`.
    pub fn dirty(&self, addr: crate::addr::Addr) {
        self.cards[self.index_of(addr)].store(CARD_DIRTY, Ordering::Release);
    }

    pub fn mark_young(&self, addr: crate::addr::Addr) {
        self.cards[self.index_of(addr)].store(CARD_YOUNG, Ordering::Release);
    }

    pub fn is_dirty(&self, addr: crate::addr::Addr) -> bool {
        self.cards[self.index_of(addr)].load(Ordering::Acquire) == CARD_DIRTY
    }

    pub fn clear(&self, addr: crate::addr::Addr) {
        self.cards[self.index_of(addr)].store(CARD_CLEAN, Ordering::Release);
    }

    /// Iterates dirty card indices in `[from, to)` card-index space. Used by
    /// the remembered-set merge step to find roots into the collection set.
    pub fn iter_dirty_in_range(&self, from: usize, to: usize) -> impl Iterator<Item = usize> + '_ {
        (from..to.min(self.cards.len())).filter(move |&i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
    }
}

/// A region's incoming remembered set: the set of (other regions') card
/// indices known to hold a pointer into this region, recorded by refinement
/// and consumed once per pause by the "merge cards" step (spec §4.5 step 3).
/// Indexed by target region, one lock-guarded card-index set per region so
/// concurrent refinement of different target regions never contends.
pub struct CardSet {
    per_region: Box<[Mutex<HashSet<usize>>]>,
}

impl CardSet {
    pub fn new(max_regions: usize) -> Self {
        CardSet {
            per_region: (0..max_regions).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    /// Records that card `card_index` (in whichever region actually holds
    /// the pointer) contains a reference into `target`.
    pub fn record_reference(&self, target: RegionId, card_index: usize) {
        self.per_region[target.index()].lock().unwrap().insert(card_index);
    }

    /// Visits every recorded card index for `target` without clearing them;
    /// callers that are done with a region's remembered set call `clear`
    /// afterwards.
    pub fn iterate_for_merge(&self, target: RegionId, mut f: impl FnMut(usize)) {
        for &card in self.per_region[target.index()].lock().unwrap().iter() {
            f(card);
        }
    }

    pub fn clear(&self, target: RegionId) {
        self.per_region[target.index()].lock().unwrap().clear();
    }

    pub fn card_count(&self, target: RegionId) -> usize {
        self.per_region[target.index()].lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    #[test]
    fn region_attrs_roundtrip() {
        let t = RegionAttrTable::new(4);
        let id = RegionId(1);
        t.insert(id, RegionAttrs::IN_CSET | RegionAttrs::OLD);
        assert!(t.in_cset(id));
        assert!(t.get(id).contains(RegionAttrs::OLD));
        t.remove(id, RegionAttrs::IN_CSET);
        assert!(!t.in_cset(id));
    }

    #[test]
    fn card_table_dirty_and_clear() {
        let ct = CardTable::new(Addr::from_usize(0x1000), 4096);
        let a = Addr::from_usize(0x1200);
        assert!(!ct.is_dirty(a));
        ct.dirty(a);
        assert!(ct.is_dirty(a));
        ct.clear(a);
        assert!(!ct.is_dirty(a));
    }

    #[test]
    fn card_set_records_and_clears_per_target_region() {
        let cs = CardSet::new(4);
        let target = RegionId(2);
        cs.record_reference(target, 5);
        cs.record_reference(target, 9);
        cs.record_reference(RegionId(0), 1);
        assert_eq!(cs.card_count(target), 2);
        let mut seen = Vec::new();
        cs.iterate_for_merge(target, |c| seen.push(c));
        seen.sort();
        assert_eq!(seen, vec![5, 9]);
        cs.clear(target);
        assert_eq!(cs.card_count(target), 0);
        assert_eq!(cs.card_count(RegionId(0)), 1);
    }
}
