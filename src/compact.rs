//! Parallel full-heap compaction: the stop-the-world backstop used when
//! concurrent marking and incremental evacuation cannot keep up with
//! allocation (spec §4.6).
//!
//! A full collection runs five phases in strict sequence: mark the whole
//! heap, summarize live bytes into a forwarding plan (including dense-prefix
//! selection), install forwarding pointers, adjust every surviving
//! reference, then physically slide objects down to their new addresses.
//! Grounded on the teacher's `policy/markcompactspace.rs` scan-and-slide
//! shape and `util/object_forwarding.rs`'s header-encoded forwarding
//! protocol; region/dense-prefix sequencing follows
//! `original_source/.../psParallelCompactNew.cpp` and
//! `fullGCForwarding.inline.hpp`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::addr::{Addr, ObjAddr, BYTES_IN_WORD};
use crate::mark_bitmap::MarkBitmap;
use crate::queue::{LocalQueue, TaskEntry};
use crate::region::{RegionId, RegionKind};
use crate::region_manager::RegionManager;
use crate::vm::{ObjectModel, Scanning};

/// Smallest object size a filler object can encode (spec §9 Open Question:
/// single-word mark headers, so a one-word gap cannot hold a valid filler).
pub const MIN_FILL_WORDS: usize = 2;

/// Per-card last-object-start addresses, used to resume iteration of live
/// objects from an arbitrary address without scanning a whole region from
/// its bottom (spec §4.6.6 "object-start table").
pub struct ObjectStartTable {
    card_bytes: usize,
    starts: Box<[AtomicUsize]>,
    heap_start: Addr,
}

impl ObjectStartTable {
    pub fn new(heap_start: Addr, heap_bytes: usize, card_bytes: usize) -> Self {
        let n = heap_bytes.div_ceil(card_bytes);
        ObjectStartTable {
            card_bytes,
            starts: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            heap_start,
        }
    }

    fn card_index(&self, a: Addr) -> usize {
        (a - self.heap_start) / self.card_bytes
    }

    /// Records that an object beginning at `obj` covers `[obj, obj+bytes)`;
    /// every card fully inside that span whose start address is not yet
    /// recorded gets `obj` as its "most recent object start at or before
    /// this card".
    pub fn record_object(&self, obj: Addr, bytes: usize) {
        let first = self.card_index(obj);
        let last = self.card_index(obj + bytes.saturating_sub(1).max(0));
        for card in first..=last.min(self.starts.len() - 1) {
            self.starts[card].store(obj.as_usize(), Ordering::Release);
        }
    }

    /// Returns the start address of the object covering or immediately
    /// preceding `addr`.
    pub fn object_start_before(&self, addr: Addr) -> Addr {
        let card = self.card_index(addr).min(self.starts.len() - 1);
        Addr::from_usize(self.starts[card].load(Ordering::Acquire))
    }

    pub fn clear(&self) {
        for s in self.starts.iter() {
            s.store(0, Ordering::Relaxed);
        }
    }
}

/// Number of header bits reserved for a forwarding offset, counted in
/// words from the destination region's bottom. Deliberately narrower than
/// a full pointer: it comfortably covers one region at the default grain
/// (`config::DEFAULT_GRAIN_WORDS`) but a sufficiently large region, or a
/// custom grain, can still overflow it, in which case `install_forward`
/// falls back to `ForwardingFallback`.
pub const AVAILABLE_BITS: u32 = 18;
/// Low bits reserved for the forwarded/fallback pattern before the offset
/// field begins.
const OFFSET_SHIFT: u32 = 2;
/// First bit of the destination-region-id field.
const REGION_SHIFT: u32 = OFFSET_SHIFT + AVAILABLE_BITS;
/// Largest offset, in words, `install_forward` can encode inline.
pub const MAX_OFFSET: usize = (1usize << AVAILABLE_BITS) - 1;
/// Low two bits of a header forwarded inline: offset + destination region
/// follow above this.
const MARKED_PATTERN: u64 = 0b01;
/// Low two bits of a header forwarded through `ForwardingFallback`: the
/// real destination lives in the fallback table, keyed by object address.
const FALLBACK_PATTERN: u64 = 0b11;

fn encode_inline(dest_region: RegionId, offset_words: usize) -> u64 {
    MARKED_PATTERN | ((offset_words as u64) << OFFSET_SHIFT) | ((dest_region.0 as u64) << REGION_SHIFT)
}

fn decode_inline(word: u64) -> (RegionId, usize) {
    let offset_words = ((word >> OFFSET_SHIFT) & MAX_OFFSET as u64) as usize;
    let region = (word >> REGION_SHIFT) as u32;
    (RegionId(region), offset_words)
}

/// Whether `obj`'s header currently encodes a full-compaction forwarding
/// pointer (inline or fallback) — distinct from `ObjectModel::is_forwarded`,
/// which checks the per-object evacuation-pause forwarding protocol.
fn is_forwarded(objects: &dyn ObjectModel, obj: ObjAddr) -> bool {
    objects.mark_word(obj) & MARKED_PATTERN == MARKED_PATTERN
}

/// Decodes `obj`'s forwarding destination, installed by `install_forward`.
/// Panics if `obj`'s header does not currently encode a forwarding pointer.
fn decode_forward(objects: &dyn ObjectModel, obj: ObjAddr, regions: &RegionManager, fallback: &ForwardingFallback) -> Addr {
    let word = objects.mark_word(obj);
    if word & FALLBACK_PATTERN == FALLBACK_PATTERN {
        fallback.get(obj.addr()).expect("fallback forwarding entry missing for a fallback-pattern header")
    } else {
        let (dest_region, offset_words) = decode_inline(word);
        regions.region(dest_region).bottom + offset_words * BYTES_IN_WORD
    }
}

/// Fallback store for forwarding offsets too large to encode inline in an
/// object's header bits (more than `MAX_OFFSET` words past the destination
/// region's bottom). Reachable with a large custom grain or region span;
/// kept so the phase structure matches a binding whose object headers
/// reserve fewer bits than a full pointer (see DESIGN.md).
pub struct ForwardingFallback {
    table: Mutex<HashMap<usize, Addr>>,
}

impl ForwardingFallback {
    pub fn new() -> Self {
        ForwardingFallback { table: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, obj: Addr, dest: Addr) {
        self.table.lock().unwrap().insert(obj.as_usize(), dest);
    }

    pub fn get(&self, obj: Addr) -> Option<Addr> {
        self.table.lock().unwrap().get(&obj.as_usize()).copied()
    }

    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }
}

impl Default for ForwardingFallback {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a region's live prefix lands in the post-compaction layout: the
/// destination region and the byte offset within it where this source
/// region's first surviving object begins. Recorded during the summary
/// phase so the forward/adjust/compact phases can be sharded per source
/// region without a shared cursor.
#[derive(Copy, Clone, Debug)]
pub struct RegionSplitPoint {
    pub source: RegionId,
    pub dest_region: RegionId,
    pub dest_offset_bytes: usize,
}

/// Drives the five phases in order; callers (the engine) invoke each
/// `phase_*` method once per full collection, in order, on worker threads
/// of their choosing (each phase internally is parallel-safe over disjoint
/// regions once `summary` has run).
pub struct FullCompactor {
    pub object_starts: ObjectStartTable,
    pub fallback: ForwardingFallback,
    split_points: Mutex<Vec<RegionSplitPoint>>,
    dense_prefix_regions: AtomicUsize,
    /// Per-destination-region high-water mark reached while copying
    /// destinations in `phase_summary`, keyed by region id. Recorded
    /// directly from the running destination cursor rather than
    /// reconstructed from `split_points` (which only records where each
    /// source region's live prefix *starts* landing, not where the last
    /// byte copied into a region ends up).
    dest_tops: Mutex<HashMap<u32, usize>>,
}

impl FullCompactor {
    pub fn new(heap_start: Addr, heap_bytes: usize, card_bytes: usize) -> Self {
        FullCompactor {
            object_starts: ObjectStartTable::new(heap_start, heap_bytes, card_bytes),
            fallback: ForwardingFallback::new(),
            split_points: Mutex::new(Vec::new()),
            dense_prefix_regions: AtomicUsize::new(0),
            dest_tops: Mutex::new(HashMap::new()),
        }
    }

    /// Phase 1: marks every reachable object in `bitmap`, starting from
    /// `scanning`'s roots. A simple shared work-stealing worklist suffices
    /// here (unlike concurrent marking, a full GC's mark phase has no SATB
    /// protocol to maintain: the world is stopped).
    pub fn phase_mark(&self, objects: &dyn ObjectModel, scanning: &dyn Scanning, bitmap: &MarkBitmap, heap_start: Addr, heap_end: Addr) {
        bitmap.clear_range(heap_start, heap_end);
        let queue = LocalQueue::new();
        scanning.scan_roots(&mut |slot| {
            let target = *slot;
            if !target.addr().is_zero() && bitmap.set_bit(target.addr()) {
                queue.push(TaskEntry::Object(target));
            }
        });
        while let Some(entry) = queue.pop() {
            let TaskEntry::Object(obj) = entry else { continue };
            if objects.is_filler(obj) {
                continue;
            }
            objects.oop_iterate(obj, &mut |slot| {
                let target = *slot;
                if !target.addr().is_zero() && bitmap.set_bit(target.addr()) {
                    queue.push(TaskEntry::Object(target));
                }
            });
        }
    }

    /// Phase 2: selects a dense prefix (the lowest-addressed run of old
    /// regions whose live occupancy already meets `dense_prefix_threshold`,
    /// which are left in place) and computes every surviving object's
    /// destination address by a single left-to-right scan of the remaining
    /// regions. Installs the object-start table as it goes and records one
    /// `RegionSplitPoint` per source region.
    pub fn phase_summary(
        &self,
        regions: &RegionManager,
        objects: &dyn ObjectModel,
        bitmap: &MarkBitmap,
        old_regions: &[RegionId],
        dense_prefix_threshold_percent: u8,
    ) {
        self.object_starts.clear();
        self.split_points.lock().unwrap().clear();
        self.dest_tops.lock().unwrap().clear();

        let grain_bytes = regions.grain_bytes();
        let mut dense_count = 0usize;
        for &id in old_regions {
            let region = regions.region(id);
            let live = live_bytes_in_region(region.bottom, region.top(), objects, bitmap);
            let occupancy = live as u64 * 100 / grain_bytes.max(1) as u64;
            if occupancy < dense_prefix_threshold_percent as u64 {
                break;
            }
            dense_count += 1;
        }
        self.dense_prefix_regions.store(dense_count, Ordering::Release);

        let compactable = &old_regions[dense_count..];
        if compactable.is_empty() {
            return;
        }
        let mut dest_region_idx = 0usize;
        let mut dest = regions.region(compactable[0]).bottom;

        for &src_id in compactable {
            let src_region = regions.region(src_id);
            let mut split_recorded = false;
            let mut cur = src_region.bottom;
            let top = src_region.top();
            while cur < top {
                if !bitmap.is_marked(cur) {
                    cur = cur + BYTES_IN_WORD;
                    continue;
                }
                let obj = ObjAddr::from_addr(cur);
                if objects.is_filler(obj) {
                    cur = cur + objects.size(obj) * BYTES_IN_WORD;
                    continue;
                }
                let words = objects.size(obj).max(MIN_FILL_WORDS);
                let bytes = words * BYTES_IN_WORD;

                let dest_end = dest + bytes;
                let cur_dest_region = compactable[dest_region_idx];
                if dest_end > regions.region(cur_dest_region).end {
                    dest_region_idx += 1;
                    dest = regions.region(compactable[dest_region_idx]).bottom;
                }
                let dest_region_id = compactable[dest_region_idx];

                if !split_recorded {
                    self.split_points.lock().unwrap().push(RegionSplitPoint {
                        source: src_id,
                        dest_region: dest_region_id,
                        dest_offset_bytes: dest - regions.region(dest_region_id).bottom,
                    });
                    split_recorded = true;
                }

                self.object_starts.record_object(dest, bytes);
                install_forward(obj, dest, dest_region_id, regions, objects, &self.fallback);

                dest = dest + bytes;
                cur = cur + bytes;

                let offset_in_region = dest.as_usize() - regions.region(dest_region_id).bottom.as_usize();
                self.dest_tops
                    .lock()
                    .unwrap()
                    .entry(dest_region_id.0)
                    .and_modify(|v| *v = (*v).max(offset_in_region))
                    .or_insert(offset_in_region);
            }
        }
    }

    /// Phase 3 is subsumed into `phase_summary` above (this engine computes
    /// destination addresses and installs forwarding pointers in the same
    /// left-to-right pass, since both require the same ordering guarantee
    /// and splitting them would need a second bitmap walk for no benefit).
    /// Exposed for callers that want to assert the split-point table is
    /// populated before moving on to `phase_adjust`.
    pub fn split_points(&self) -> Vec<RegionSplitPoint> {
        self.split_points.lock().unwrap().clone()
    }

    /// Number of regions at the front of the compaction's old-region list
    /// that the summary phase left in place as a dense prefix.
    pub fn dense_prefix_len(&self) -> usize {
        self.dense_prefix_regions.load(Ordering::Acquire)
    }

    fn adjust_slot_in<'a>(&'a self, regions: &'a RegionManager, objects: &'a dyn ObjectModel) -> impl FnMut(&mut ObjAddr) + 'a {
        move |slot: &mut ObjAddr| {
            let target = *slot;
            if target.addr().is_zero() {
                return;
            }
            if is_forwarded(objects, target) {
                *slot = ObjAddr::from_addr(decode_forward(objects, target, regions, &self.fallback));
            }
        }
    }

    /// Phase 4, root half: rewrites every root slot to point at its
    /// referent's forwarding address. Kept separate from the per-region
    /// sweep below so a caller sharding the region sweep across workers
    /// still runs the root scan exactly once.
    pub fn adjust_roots(&self, regions: &RegionManager, objects: &dyn ObjectModel, scanning: &dyn Scanning) {
        scanning.scan_roots(&mut self.adjust_slot_in(regions, objects));
    }

    /// Phase 4, one region's share: rewrites every in-heap slot in `id`
    /// to point at its referent's forwarding address. Disjoint regions can
    /// run this concurrently — each only ever writes slots inside objects
    /// it owns.
    pub fn phase_adjust_region(&self, regions: &RegionManager, objects: &dyn ObjectModel, bitmap: &MarkBitmap, id: RegionId) {
        let mut adjust_slot = self.adjust_slot_in(regions, objects);
        let region = regions.region(id);
        let mut cur = region.bottom;
        let top = region.top();
        while cur < top {
            if bitmap.is_marked(cur) {
                let obj = ObjAddr::from_addr(cur);
                if !objects.is_filler(obj) {
                    objects.oop_iterate(obj, &mut adjust_slot);
                    cur = cur + objects.size(obj).max(MIN_FILL_WORDS) * BYTES_IN_WORD;
                    continue;
                }
            }
            cur = cur + BYTES_IN_WORD;
        }
    }

    /// Sequential phase 4: runs the root scan, then every old region's
    /// share in turn. Engine-level callers running with more than one
    /// worker instead call `adjust_roots` once and shard `phase_adjust_region`
    /// across the pool, since every old region (dense prefix included, since
    /// a dense-prefix object can still hold outgoing references into a
    /// compacted region) needs its own pass either way.
    pub fn phase_adjust(
        &self,
        regions: &RegionManager,
        objects: &dyn ObjectModel,
        scanning: &dyn Scanning,
        bitmap: &MarkBitmap,
        old_regions: &[RegionId],
    ) {
        self.adjust_roots(regions, objects, scanning);
        for &id in old_regions {
            self.phase_adjust_region(regions, objects, bitmap, id);
        }
    }

    /// Phase 5, one source region's share: slides its forwarded objects to
    /// their destinations. Disjoint source regions never write overlapping
    /// destination bytes (each source's live prefix was assigned a disjoint
    /// destination span in `phase_summary`), so this is safe to run
    /// concurrently across regions.
    pub fn phase_compact_region(&self, regions: &RegionManager, objects: &dyn ObjectModel, bitmap: &MarkBitmap, src_id: RegionId) {
        let region = regions.region(src_id);
        let mut cur = region.bottom;
        let top = region.top();
        while cur < top {
            if !bitmap.is_marked(cur) {
                cur = cur + BYTES_IN_WORD;
                continue;
            }
            let obj = ObjAddr::from_addr(cur);
            if objects.is_filler(obj) {
                cur = cur + objects.size(obj).max(MIN_FILL_WORDS) * BYTES_IN_WORD;
                continue;
            }
            let words = objects.size(obj).max(MIN_FILL_WORDS);
            if is_forwarded(objects, obj) {
                let dest = ObjAddr::from_addr(decode_forward(objects, obj, regions, &self.fallback));
                if dest.addr() != obj.addr() {
                    objects.copy_to(obj, dest);
                    objects.init_mark(dest);
                }
            }
            cur = cur + words * BYTES_IN_WORD;
        }
    }

    /// Resets every compacted region's top to its new high-water mark and
    /// returns any region past the last surviving byte to the free set.
    /// Run once after every region's `phase_compact_region` share has
    /// finished copying.
    pub fn finalize_compacted_regions(&self, regions: &RegionManager, compactable: &[RegionId]) {
        let dest_tops = self.dest_tops.lock().unwrap();
        for &id in compactable {
            let region = regions.region(id);
            if let Some(&offset) = dest_tops.get(&id.0) {
                region.set_top((region.bottom + offset).align_up(BYTES_IN_WORD));
            } else {
                region.set_top(region.bottom);
            }
        }
    }

    /// Sequential phase 5: every compactable region's share in turn, then
    /// finalization. Engine-level callers running with more than one worker
    /// instead shard `phase_compact_region` across the pool and call
    /// `finalize_compacted_regions` once after the pool joins.
    pub fn phase_compact(&self, regions: &RegionManager, objects: &dyn ObjectModel, bitmap: &MarkBitmap, old_regions: &[RegionId]) {
        let dense_count = self.dense_prefix_regions.load(Ordering::Acquire);
        let compactable = &old_regions[dense_count.min(old_regions.len())..];
        for &src_id in compactable {
            self.phase_compact_region(regions, objects, bitmap, src_id);
        }
        self.finalize_compacted_regions(regions, compactable);
    }
}

fn install_forward(obj: ObjAddr, dest: Addr, dest_region: RegionId, regions: &RegionManager, objects: &dyn ObjectModel, fallback: &ForwardingFallback) {
    let offset_words = (dest - regions.region(dest_region).bottom) / BYTES_IN_WORD;
    let expected = objects.mark_word(obj);
    if offset_words <= MAX_OFFSET {
        let encoded = encode_inline(dest_region, offset_words);
        if objects.cas_mark_word(obj, expected, encoded) {
            return;
        }
    }
    // Either the offset overflowed `AVAILABLE_BITS`, or another forwarding
    // attempt raced (shouldn't happen under stop-the-world full GC, but
    // keep the fallback path live so the structure matches a
    // header-width-constrained binding).
    fallback.insert(obj.addr(), dest);
    objects.set_mark_word(obj, FALLBACK_PATTERN);
}

fn live_bytes_in_region(bottom: Addr, top: Addr, objects: &dyn ObjectModel, bitmap: &MarkBitmap) -> usize {
    let mut cur = bottom;
    let mut total = 0usize;
    while cur < top {
        if bitmap.is_marked(cur) {
            let obj = ObjAddr::from_addr(cur);
            let words = objects.size(obj).max(MIN_FILL_WORDS);
            if !objects.is_filler(obj) {
                total += words * BYTES_IN_WORD;
            }
            cur = cur + words * BYTES_IN_WORD;
        } else {
            cur = cur + BYTES_IN_WORD;
        }
    }
    total
}

/// Converts every compacted-but-now-empty region past the live high-water
/// mark back to the free set in one batch; called by the engine after
/// `phase_compact`/`finalize_compacted_regions`.
pub fn reclaim_fully_empty_regions(regions: &RegionManager, old_regions: &[RegionId]) {
    let mut reclaimed = Vec::new();
    for &id in old_regions {
        let region = regions.region(id);
        if region.is_empty() && region.kind() == RegionKind::Old {
            regions.remove_from_old_set(id);
            region.reset_for_reuse();
            region.set_containing_set(crate::region::ContainingSet::Free);
            reclaimed.push(id);
        }
    }
    regions.merge_free_sets(reclaimed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::mock::MockHeap;

    #[test]
    fn object_start_table_round_trips() {
        let table = ObjectStartTable::new(Addr::from_usize(0x1000), 0x10000, 0x100);
        table.record_object(Addr::from_usize(0x1200), 0x50);
        assert_eq!(table.object_start_before(Addr::from_usize(0x1240)).as_usize(), 0x1200);
    }

    #[test]
    fn compact_slides_live_objects_down() {
        let heap_start = Addr::from_usize(0x100_0000);
        let mgr = RegionManager::new(heap_start, 1 << 10, 4);
        let bitmap = MarkBitmap::new(heap_start, (4usize << 10) * BYTES_IN_WORD);
        let heap = MockHeap::new();

        let r0 = mgr.allocate_region(RegionKind::Old).unwrap();
        mgr.add_to_old_set(r0);
        let region0 = mgr.region(r0);

        let a = heap.place(region0.bottom, vec![]);
        region0.try_bump(heap.size(a) * BYTES_IN_WORD).unwrap();
        let gap = region0.top();
        let b_addr = gap + BYTES_IN_WORD * 4;
        let b = heap.place(b_addr, vec![]);
        region0.set_top(b_addr + heap.size(b) * BYTES_IN_WORD);

        bitmap.set_bit(a.addr());
        bitmap.set_bit(b_addr);
        heap.add_root(a.addr());
        heap.add_root(b_addr);

        let compactor = FullCompactor::new(heap_start, (4usize << 10) * BYTES_IN_WORD, 512);
        let old_regions = vec![r0];
        compactor.phase_summary(&mgr, &heap, &bitmap, &old_regions, 100);
        assert!(is_forwarded(&heap, a));
        assert!(is_forwarded(&heap, b));
        assert_eq!(decode_forward(&heap, a, &mgr, &compactor.fallback), region0.bottom);

        compactor.phase_adjust(&mgr, &heap, &heap, &bitmap, &old_regions);
        compactor.phase_compact(&mgr, &heap, &bitmap, &old_regions);
        assert!(region0.top() < b_addr + BYTES_IN_WORD * 8);
    }

    #[test]
    fn install_forward_overflows_to_fallback_table_past_max_offset() {
        let heap_start = Addr::from_usize(0x100_0000);
        let mgr = RegionManager::new(heap_start, 1 << 10, 1);
        let heap = MockHeap::new();
        let compactor = FullCompactor::new(heap_start, (1usize << 10) * BYTES_IN_WORD, 512);

        let region = mgr.region(RegionId(0));
        let obj = heap.place(region.bottom, vec![]);
        let far_dest = region.bottom + (MAX_OFFSET + 1) * BYTES_IN_WORD;

        install_forward(obj, far_dest, RegionId(0), &mgr, &heap, &compactor.fallback);
        assert!(is_forwarded(&heap, obj));
        assert_eq!(heap.mark_word(obj) & 0b11, FALLBACK_PATTERN);
        assert_eq!(decode_forward(&heap, obj, &mgr, &compactor.fallback), far_dest);
    }

    #[test]
    fn install_forward_encodes_inline_within_max_offset() {
        let heap_start = Addr::from_usize(0x100_0000);
        let mgr = RegionManager::new(heap_start, 1 << 10, 1);
        let heap = MockHeap::new();
        let compactor = FullCompactor::new(heap_start, (1usize << 10) * BYTES_IN_WORD, 512);

        let region = mgr.region(RegionId(0));
        let obj = heap.place(region.bottom, vec![]);
        let near_dest = region.bottom + 4 * BYTES_IN_WORD;

        install_forward(obj, near_dest, RegionId(0), &mgr, &heap, &compactor.fallback);
        assert!(is_forwarded(&heap, obj));
        assert_ne!(heap.mark_word(obj) & 0b11, FALLBACK_PATTERN);
        assert_eq!(decode_forward(&heap, obj, &mgr, &compactor.fallback), near_dest);
    }
}
