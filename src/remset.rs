//! Remembered-set refinement and the "merge cards" evacuation step (spec
//! §4.5 step 3): turning dirty post-write-barrier cards into a target-region
//! -indexed card set, then re-scanning exactly those cards as extra roots
//! into the collection set.
//!
//! Grounded on the teacher's remembered-set concept (`policy/region`'s card
//! table plus its mutator refinement path), simplified to a synchronous
//! in-pause refinement rather than a concurrent refinement thread: this
//! engine has no mutator-side concurrent refinement worker, so dirty cards
//! accumulated since the last pause are refined synchronously at the start
//! of the next evacuation pause, mirroring G1's own "refine during the
//! pause" fallback for cards refinement threads didn't get to in time.

use crate::addr::{Addr, ObjAddr, BYTES_IN_WORD};
use crate::region::RegionId;
use crate::region_manager::RegionManager;
use crate::side_table::{CardSet, CardTable};
use crate::vm::{ObjectModel, Slot};

/// Walks every old region's dirty cards, discovers cross-region references
/// recorded on those cards, and files them into `card_set` keyed by the
/// *target* region. Clears the cards it just refined: once a card's
/// references are captured in `card_set`, the card table entry has done its
/// job until the mutator dirties it again.
pub fn refine_dirty_cards(card_table: &CardTable, card_set: &CardSet, regions: &RegionManager, objects: &dyn ObjectModel) {
    for region_id in regions.old_regions() {
        let region = regions.region(region_id);
        let top = region.top();
        if region.bottom >= top {
            continue;
        }
        let range = card_table.card_range_of(region.bottom, top);
        if range.clone().all(|idx| !card_table.is_dirty_idx(idx)) {
            continue;
        }

        let mut cur = region.bottom;
        while cur < top {
            let obj = ObjAddr::from_addr(cur);
            if objects.is_filler(obj) {
                cur = cur + objects.size(obj) * BYTES_IN_WORD;
                continue;
            }
            let words = objects.size(obj);
            let card_idx = card_table.index_of(cur);
            if card_table.is_dirty_idx(card_idx) {
                objects.oop_iterate(obj, &mut |slot: Slot<'_>| {
                    let target = *slot;
                    if target.addr().is_zero() {
                        return;
                    }
                    let target_region = regions.addr_to_region(target.addr());
                    if target_region != region_id {
                        card_set.record_reference(target_region, card_idx);
                    }
                });
            }
            cur = cur + words * BYTES_IN_WORD;
        }

        for idx in range {
            card_table.clear_idx(idx);
        }
    }
}

/// The "merge cards" step: for every collection-set member, re-scans the
/// cards its remembered set recorded and hands every slot found to still
/// point into that member to `visit_slot` (the same evacuate-and-rewrite
/// closure the root-scan phase uses), then clears the member's remembered
/// set now that it has been fully consumed.
///
/// Cards are grouped by the source region that owns them before scanning,
/// so a source region with several dirty cards pointing at the same cset
/// member is only walked once.
pub fn merge_cards_into_roots(
    cset: &[RegionId],
    card_set: &CardSet,
    card_table: &CardTable,
    regions: &RegionManager,
    objects: &dyn ObjectModel,
    visit_slot: &mut dyn FnMut(Slot<'_>),
) {
    for &target in cset {
        let mut by_source: std::collections::HashMap<RegionId, std::collections::HashSet<usize>> = std::collections::HashMap::new();
        card_set.iterate_for_merge(target, |card_idx| {
            let addr: Addr = card_table.addr_of(card_idx);
            let source = regions.addr_to_region(addr);
            by_source.entry(source).or_default().insert(card_idx);
        });

        for (source_id, card_idxs) in by_source {
            let region = regions.region(source_id);
            let top = region.top();
            let mut cur = region.bottom;
            while cur < top {
                let obj = ObjAddr::from_addr(cur);
                if objects.is_filler(obj) {
                    cur = cur + objects.size(obj) * BYTES_IN_WORD;
                    continue;
                }
                let words = objects.size(obj);
                let idx = card_table.index_of(cur);
                if card_idxs.contains(&idx) {
                    objects.oop_iterate(obj, &mut |slot: Slot<'_>| {
                        let t = *slot;
                        if t.addr().is_zero() {
                            return;
                        }
                        if regions.addr_to_region(t.addr()) == target {
                            visit_slot(slot);
                        }
                    });
                }
                cur = cur + words * BYTES_IN_WORD;
            }
        }

        card_set.clear(target);
    }
}
