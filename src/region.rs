//! The heap region: the unit of allocation, collection, and reclamation.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::addr::Addr;

/// Opaque handle to a region, valid for the lifetime of the owning
/// `RegionManager`. Regions never move once created, so a `RegionId` is
/// stable for the whole run; this is the only way code outside the region
/// manager refers to a region, which sidesteps the cyclic-ownership problem
/// a `&Region` back-reference graph would create.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegionId(pub u32);

impl std::fmt::Debug for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl RegionId {
    pub const INVALID: RegionId = RegionId(u32::MAX);

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a region currently holds.
#[derive(Copy, Clone, Eq, PartialEq, Debug, enum_map::Enum)]
pub enum RegionKind {
    Free,
    Eden,
    Survivor,
    Old,
    StartsHumongous,
    ContinuesHumongous,
    Archive,
}

impl RegionKind {
    pub fn is_young(self) -> bool {
        matches!(self, RegionKind::Eden | RegionKind::Survivor)
    }

    pub fn is_humongous(self) -> bool {
        matches!(self, RegionKind::StartsHumongous | RegionKind::ContinuesHumongous)
    }
}

/// Whether this region's remembered set reflects all cross-region
/// references into it yet. Only `Complete` regions may be cset candidates
/// (spec invariant: an `Untracked` old/humongous region must never be
/// evacuated).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RemSetState {
    Untracked,
    Updating,
    Complete,
}

/// Which top-level set a region currently belongs to, for O(1)
/// classification without walking the containing list.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ContainingSet {
    None,
    Free,
    Old,
    Humongous,
}

/// A fixed-size slice of the heap.
///
/// `bottom`/`end` are fixed for the region's lifetime. `top` is the
/// allocation watermark; `tams` ("top at mark start") is frozen at the
/// start of a concurrent-mark cycle. The invariant `bottom <= tams <= top
/// <= end` must hold at every safepoint.
pub struct Region {
    pub id: RegionId,
    pub bottom: Addr,
    pub end: Addr,
    kind: AtomicU32,
    top: AtomicUsize,
    tams: AtomicUsize,
    pub live_bytes: AtomicUsize,
    pub pinned_count: AtomicU32,
    remset_state: AtomicU32,
    containing_set: AtomicU32,
    /// Intrusive doubly-linked-list-by-index node, used by whichever set
    /// currently owns this region (see `region_manager::LinkedSet`). `u32::MAX`
    /// means "no link".
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
}

fn kind_to_u32(k: RegionKind) -> u32 {
    k as u32
}

fn u32_to_kind(v: u32) -> RegionKind {
    match v {
        0 => RegionKind::Free,
        1 => RegionKind::Eden,
        2 => RegionKind::Survivor,
        3 => RegionKind::Old,
        4 => RegionKind::StartsHumongous,
        5 => RegionKind::ContinuesHumongous,
        6 => RegionKind::Archive,
        _ => unreachable!("corrupt region kind tag"),
    }
}

impl Region {
    pub fn new(id: RegionId, bottom: Addr, end: Addr) -> Self {
        Region {
            id,
            bottom,
            end,
            kind: AtomicU32::new(kind_to_u32(RegionKind::Free)),
            top: AtomicUsize::new(bottom.as_usize()),
            tams: AtomicUsize::new(bottom.as_usize()),
            live_bytes: AtomicUsize::new(0),
            pinned_count: AtomicU32::new(0),
            remset_state: AtomicU32::new(0),
            containing_set: AtomicU32::new(ContainingSet::None as u32),
            prev: AtomicU32::new(u32::MAX),
            next: AtomicU32::new(u32::MAX),
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> RegionKind {
        u32_to_kind(self.kind.load(Ordering::Acquire))
    }

    /// Sets the region's kind. Release ordering: callers must ensure this
    /// happens-before the region is surfaced in any list a reader might
    /// observe the new kind through.
    pub fn set_kind(&self, k: RegionKind) {
        self.kind.store(kind_to_u32(k), Ordering::Release);
    }

    #[inline(always)]
    pub fn top(&self) -> Addr {
        Addr::from_usize(self.top.load(Ordering::Acquire))
    }

    pub fn set_top(&self, a: Addr) {
        debug_assert!(a >= self.bottom && a <= self.end);
        self.top.store(a.as_usize(), Ordering::Release);
    }

    /// Atomically bumps `top` by `bytes`, returning the pre-bump value if
    /// the whole allocation fits before `end`, else `None`. This is the
    /// region's bump-pointer allocation primitive, used by the promotion
    /// lab and by the compaction phase's in-place fills.
    pub fn try_bump(&self, bytes: usize) -> Option<Addr> {
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            let new = cur.checked_add(bytes)?;
            if new > self.end.as_usize() {
                return None;
            }
            match self.top.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some(Addr::from_usize(prev)),
                Err(actual) => cur = actual,
            }
        }
    }

    #[inline(always)]
    pub fn tams(&self) -> Addr {
        Addr::from_usize(self.tams.load(Ordering::Acquire))
    }

    /// Freezes `tams` at the current `top`. Called once per region at
    /// initial-mark for every region that is a concurrent-mark root.
    pub fn snapshot_tams(&self) {
        let top = self.top.load(Ordering::Acquire);
        self.tams.store(top, Ordering::Release);
    }

    pub fn reset_tams_to_bottom(&self) {
        self.tams.store(self.bottom.as_usize(), Ordering::Release);
    }

    #[inline(always)]
    pub fn remset_state(&self) -> RemSetState {
        match self.remset_state.load(Ordering::Acquire) {
            0 => RemSetState::Untracked,
            1 => RemSetState::Updating,
            _ => RemSetState::Complete,
        }
    }

    pub fn set_remset_state(&self, s: RemSetState) {
        self.remset_state.store(s as u32, Ordering::Release);
    }

    pub fn containing_set(&self) -> ContainingSet {
        match self.containing_set.load(Ordering::Acquire) {
            1 => ContainingSet::Free,
            2 => ContainingSet::Old,
            3 => ContainingSet::Humongous,
            _ => ContainingSet::None,
        }
    }

    pub fn set_containing_set(&self, s: ContainingSet) {
        self.containing_set.store(s as u32, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_count.load(Ordering::Acquire) > 0
    }

    pub fn words(&self) -> usize {
        self.bottom.words_to(self.end)
    }

    pub fn used_bytes(&self) -> usize {
        self.bottom.words_to(self.top()) * crate::addr::BYTES_IN_WORD
    }

    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Resets a reclaimed region back to its Free state. Does not touch the
    /// intrusive list links; the caller (region manager) re-threads those.
    pub fn reset_for_reuse(&self) {
        self.set_kind(RegionKind::Free);
        self.set_top(self.bottom);
        self.reset_tams_to_bottom();
        self.live_bytes.store(0, Ordering::Release);
        self.set_remset_state(RemSetState::Untracked);
        debug_assert_eq!(self.pinned_count.load(Ordering::Acquire), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(RegionId(0), Addr::from_usize(0x1000), Addr::from_usize(0x2000))
    }

    #[test]
    fn bump_allocation_respects_end() {
        let r = region();
        assert_eq!(r.try_bump(0x800).unwrap(), Addr::from_usize(0x1000));
        assert_eq!(r.top(), Addr::from_usize(0x1800));
        assert_eq!(r.try_bump(0x900), None);
        assert_eq!(r.try_bump(0x800).unwrap(), Addr::from_usize(0x1800));
        assert_eq!(r.top(), r.end);
    }

    #[test]
    fn tams_invariant_holds_through_snapshot() {
        let r = region();
        r.try_bump(0x100).unwrap();
        r.snapshot_tams();
        assert_eq!(r.tams(), Addr::from_usize(0x1100));
        r.try_bump(0x100).unwrap();
        assert!(r.bottom <= r.tams() && r.tams() <= r.top() && r.top() <= r.end);
    }

    #[test]
    fn reset_for_reuse_clears_state() {
        let r = region();
        r.set_kind(RegionKind::Old);
        r.try_bump(0x100).unwrap();
        r.live_bytes.store(64, Ordering::Relaxed);
        r.set_remset_state(RemSetState::Complete);
        r.reset_for_reuse();
        assert_eq!(r.kind(), RegionKind::Free);
        assert_eq!(r.top(), r.bottom);
        assert_eq!(r.live_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(r.remset_state(), RemSetState::Untracked);
    }
}
