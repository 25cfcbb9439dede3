//! Collection-set selection: candidate region lists, the pause-time
//! predictor, and the young/mixed/optional increment builder.

use std::sync::Mutex;

use crate::addr::BYTES_IN_WORD;
use crate::region::{RegionId, RegionKind};
use crate::region_manager::RegionManager;
use crate::side_table::{CardSet, RegionAttrTable, RegionAttrs, RegionScalarTable};

/// One candidate region with its computed GC efficiency
/// (`reclaimable_bytes / predicted_copy_cost`), higher is more attractive.
#[derive(Copy, Clone, Debug)]
pub struct Candidate {
    pub region: RegionId,
    pub gc_efficiency: f64,
    pub reclaimable_bytes: usize,
}

/// Linear pause-time cost model coefficients, updated as a moving estimate
/// from measured pause times (spec §4.4): `V_fixed` by simple averaging,
/// the per-unit costs by taking the max seen so far so the predictor never
/// under-bids a pause.
#[derive(Clone, Copy, Debug)]
pub struct PausePredictor {
    v_fixed_ms: f64,
    per_dirty_card_ms: f64,
    per_rs_card_scan_ms: f64,
    per_live_byte_copy_ms: f64,
    samples: u64,
}

impl Default for PausePredictor {
    fn default() -> Self {
        PausePredictor {
            v_fixed_ms: 0.3,
            per_dirty_card_ms: 0.0001,
            per_rs_card_scan_ms: 0.00005,
            per_live_byte_copy_ms: 0.000005,
            samples: 0,
        }
    }
}

impl PausePredictor {
    /// `V(cset) = V_fixed + U*d + sum(S*rs_size(r) + C*live_bytes(r))`.
    pub fn predict_ms(&self, dirty_cards: usize, regions: &[(usize, usize)]) -> f64 {
        let mut total = self.v_fixed_ms + self.per_dirty_card_ms * dirty_cards as f64;
        for &(rs_size, live_bytes) in regions {
            total += self.per_rs_card_scan_ms * rs_size as f64 + self.per_live_byte_copy_ms * live_bytes as f64;
        }
        total
    }

    pub fn predict_one_ms(&self, rs_size: usize, live_bytes: usize) -> f64 {
        self.per_rs_card_scan_ms * rs_size as f64 + self.per_live_byte_copy_ms * live_bytes as f64
    }

    /// Updates the model from one pause's measured numbers. Per-unit costs
    /// take `max(old, observed)`; the fixed cost is a running average.
    pub fn update(&mut self, observed_fixed_ms: f64, observed_per_card: f64, observed_per_rs: f64, observed_per_byte: f64) {
        self.samples += 1;
        let n = self.samples as f64;
        self.v_fixed_ms += (observed_fixed_ms - self.v_fixed_ms) / n;
        self.per_dirty_card_ms = self.per_dirty_card_ms.max(observed_per_card);
        self.per_rs_card_scan_ms = self.per_rs_card_scan_ms.max(observed_per_rs);
        self.per_live_byte_copy_ms = self.per_live_byte_copy_ms.max(observed_per_byte);
    }
}

/// The two candidate lists (marking and retained) plus an O(1) membership
/// classifier, kept in decreasing-efficiency order.
pub struct CollectionSetChooser {
    marking: Mutex<Vec<Candidate>>,
    retained: Mutex<Vec<Candidate>>,
    unreclaimed_count: Mutex<std::collections::HashMap<u32, u32>>,
    pub predictor: Mutex<PausePredictor>,
}

impl CollectionSetChooser {
    pub fn new() -> Self {
        CollectionSetChooser {
            marking: Mutex::new(Vec::new()),
            retained: Mutex::new(Vec::new()),
            unreclaimed_count: Mutex::new(std::collections::HashMap::new()),
            predictor: Mutex::new(PausePredictor::default()),
        }
    }

    /// Builds the `marking` candidate list after a mark cycle (spec
    /// §4.4 "Parallel build"). `rs_size_of` supplies a region's
    /// remembered-set size for the cost model; `is_active_alloc_region`
    /// excludes the region currently used for old-gen bump allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn build_candidates(
        &self,
        regions: &RegionManager,
        attrs: &RegionAttrTable,
        live_bytes: &RegionScalarTable,
        live_threshold_percent: u8,
        rs_size_of: impl Fn(RegionId) -> usize,
        is_active_alloc_region: impl Fn(RegionId) -> bool,
    ) {
        let grain_bytes = regions.grain_bytes();
        let mut built = Vec::new();
        regions.iterate(|region| {
            if region.kind() != RegionKind::Old {
                return;
            }
            let id = region.id;
            if attrs.get(id).contains(RegionAttrs::IN_CSET) {
                return;
            }
            if region.remset_state() != crate::region::RemSetState::Complete {
                return;
            }
            if is_active_alloc_region(id) {
                return;
            }
            let live = live_bytes.get(id);
            let threshold = (grain_bytes as u64 * live_threshold_percent as u64 / 100) as usize;
            if live >= threshold {
                return;
            }
            let reclaimable = grain_bytes.saturating_sub(live);
            let predicted_cost = self.predictor.lock().unwrap().predict_one_ms(rs_size_of(id), live).max(1e-6);
            built.push(Candidate {
                region: id,
                gc_efficiency: reclaimable as f64 / predicted_cost,
                reclaimable_bytes: reclaimable,
            });
        });
        built.sort_by(|a, b| b.gc_efficiency.partial_cmp(&a.gc_efficiency).unwrap());
        *self.marking.lock().unwrap() = built;
    }

    /// Prunes the worst-efficiency tail of the marking list while keeping
    /// at least `min_length` candidates and discarding at most
    /// `allowed_waste` cumulative reclaimable bytes. A region dropped here
    /// will not be revisited as a cset candidate until its remembered set
    /// is rebuilt from scratch, so its card set is cleared along with its
    /// `HUMONGOUS_CAND` attribute.
    pub fn prune(&self, min_length: usize, allowed_waste: usize, attrs: &RegionAttrTable, card_set: &CardSet) {
        let mut marking = self.marking.lock().unwrap();
        let mut removed_waste = 0usize;
        while marking.len() > min_length {
            let worst = marking.last().unwrap();
            if removed_waste + worst.reclaimable_bytes > allowed_waste {
                break;
            }
            removed_waste += worst.reclaimable_bytes;
            let c = marking.pop().unwrap();
            attrs.remove(c.region, RegionAttrs::HUMONGOUS_CAND);
            card_set.clear(c.region);
        }
    }

    /// Adds a region whose evacuation failed to the retained list; it is
    /// retried in every young collection until it has gone unreclaimed
    /// `keep_pinned_count` times.
    pub fn retain(&self, candidate: Candidate) {
        self.retained.lock().unwrap().push(candidate);
        self.retained
            .lock()
            .unwrap()
            .sort_by(|a, b| b.gc_efficiency.partial_cmp(&a.gc_efficiency).unwrap());
    }

    pub fn note_unreclaimed(&self, region: RegionId, keep_pinned_count: u32) {
        let mut counts = self.unreclaimed_count.lock().unwrap();
        let entry = counts.entry(region.0).or_insert(0);
        *entry += 1;
        if *entry >= keep_pinned_count {
            drop(counts);
            self.retained.lock().unwrap().retain(|c| c.region != region);
        }
    }

    /// Pulls old-region candidates for a mixed-GC increment until the
    /// predicted pause time would exceed `budget_ms`, splitting the
    /// remainder with positive benefit into an "optional" list.
    pub fn select_mixed_increment(&self, budget_ms: f64, rs_size_of: impl Fn(RegionId) -> usize, live_bytes: &RegionScalarTable) -> (Vec<RegionId>, Vec<RegionId>) {
        let predictor = *self.predictor.lock().unwrap();
        let mut selected = Vec::new();
        let mut optional = Vec::new();
        let mut spent = predictor.v_fixed_ms;

        let mut pools: Vec<Candidate> = {
            let retained = self.retained.lock().unwrap().clone();
            let marking = self.marking.lock().unwrap().clone();
            retained.into_iter().chain(marking).collect()
        };
        pools.sort_by(|a, b| b.gc_efficiency.partial_cmp(&a.gc_efficiency).unwrap());

        for c in pools {
            let cost = predictor.predict_one_ms(rs_size_of(c.region), live_bytes.get(c.region));
            if spent + cost <= budget_ms {
                spent += cost;
                selected.push(c.region);
            } else if c.reclaimable_bytes > 0 {
                optional.push(c.region);
            }
        }
        (selected, optional)
    }

    pub fn marking_len(&self) -> usize {
        self.marking.lock().unwrap().len()
    }

    pub fn retained_len(&self) -> usize {
        self.retained.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.marking.lock().unwrap().clear();
    }
}

impl Default for CollectionSetChooser {
    fn default() -> Self {
        Self::new()
    }
}

/// Word size helper shared by cost-model call sites that want a live-bytes
/// figure from a word count.
pub fn words_to_bytes(words: usize) -> usize {
    words * BYTES_IN_WORD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    fn setup(n: usize) -> (RegionManager, RegionAttrTable, RegionScalarTable) {
        let mgr = RegionManager::new(Addr::from_usize(0x10_0000), 1 << 10, n);
        let attrs = RegionAttrTable::new(n);
        let live = RegionScalarTable::new(n);
        (mgr, attrs, live)
    }

    #[test]
    fn build_and_sort_candidates() {
        let (mgr, attrs, live) = setup(4);
        for _ in 0..4 {
            let id = mgr.allocate_region(RegionKind::Old).unwrap();
            mgr.region(id).set_remset_state(crate::region::RemSetState::Complete);
        }
        // give regions 0 and 1 different live-byte fractions
        live.set(RegionId(0), 100);
        live.set(RegionId(1), 900);
        let chooser = CollectionSetChooser::new();
        chooser.build_candidates(&mgr, &attrs, &live, 95, |_| 0, |_| false);
        assert_eq!(chooser.marking_len(), 4);
    }

    #[test]
    fn prune_respects_min_length_and_waste() {
        let (mgr, attrs, live) = setup(4);
        for i in 0..4 {
            let id = mgr.allocate_region(RegionKind::Old).unwrap();
            mgr.region(id).set_remset_state(crate::region::RemSetState::Complete);
            live.set(id, i * 1000);
        }
        let chooser = CollectionSetChooser::new();
        chooser.build_candidates(&mgr, &attrs, &live, 100, |_| 0, |_| false);
        let card_set = CardSet::new(4);
        card_set.record_reference(RegionId(3), 7);
        chooser.prune(1, usize::MAX, &attrs, &card_set);
        assert_eq!(chooser.marking_len(), 1);
        assert_eq!(card_set.card_count(RegionId(3)), 0, "a pruned region's card set must be cleared");
    }
}
