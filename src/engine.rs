//! The outer collection state machine: `Engine::drive(cause)` decides which
//! pause to run next and dispatches to the phase driver, mirroring the
//! teacher's `plan::global`/`plan::phase` split (a requester records *why*
//! a collection was asked for; the phase driver decides *what* runs next).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::addr::{Addr, ObjAddr};
use crate::compact::FullCompactor;
use crate::config::GcConfig;
use crate::cset::CollectionSetChooser;
use crate::error::GcError;
use crate::evac::{evacuate_object, EvacOutcome, EvacWorkerState};
use crate::mark::{ConcurrentMarker, MarkTask, StepResult};
use crate::mark_bitmap::MarkBitmap;
use crate::queue::{LocalQueue, TaskEntry};
use crate::region::{RegionId, RegionKind};
use crate::region_manager::RegionManager;
use crate::scheduler::{Terminator, WorkerPool};
use crate::side_table::{CardSet, CardTable, RegionAttrTable, RegionAttrs, RegionScalarTable};
use crate::vm::{Collaborators, ObjectModel, ReferenceProcessingPolicy, ReferenceProcessor, Scanning, WeakProcessor};

/// The outer state machine's phases (spec §2).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Idle,
    YoungPause,
    ConcMark,
    Remark,
    Cleanup,
    MixedPause,
    FullGc,
}

/// Why a collection was requested; the phase driver uses this plus the
/// current phase to decide what runs next.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GcCause {
    AllocationFailure,
    ExplicitRequest,
    MarkStackOverflow,
    MarkCycleDue,
}

/// Summary of one `drive` call, logged at `Info` and returned to the host.
#[derive(Debug, Default)]
pub struct PauseReport {
    pub phase: Option<Phase>,
    pub regions_reclaimed: usize,
    pub bytes_copied: usize,
}

pub struct Engine<C: Collaborators> {
    config: GcConfig,
    regions: RegionManager,
    attrs: RegionAttrTable,
    live_bytes: RegionScalarTable,
    pub card_table: CardTable,
    card_set: CardSet,
    bitmap: MarkBitmap,
    marker: ConcurrentMarker,
    cset_chooser: CollectionSetChooser,
    compactor: FullCompactor,
    pool: WorkerPool,
    collaborators: C,
    phase: Mutex<Phase>,
    heap_end: Addr,
}

impl<C: Collaborators> Engine<C> {
    pub fn new(config: GcConfig, heap_start: Addr, collaborators: C) -> Result<Self, GcError> {
        config.validate()?;
        let heap_bytes = config.grain_words * config.max_regions * crate::addr::BYTES_IN_WORD;
        let heap_end = heap_start + heap_bytes;
        let num_workers = config.resolved_num_workers();
        Ok(Engine {
            regions: RegionManager::new(heap_start, config.grain_words, config.max_regions),
            attrs: RegionAttrTable::new(config.max_regions),
            live_bytes: RegionScalarTable::new(config.max_regions),
            card_table: CardTable::new(heap_start, heap_bytes),
            card_set: CardSet::new(config.max_regions),
            bitmap: MarkBitmap::new(heap_start, heap_bytes),
            marker: ConcurrentMarker::new(heap_start, heap_end, config.max_mark_stack_chunks),
            cset_chooser: CollectionSetChooser::new(),
            compactor: FullCompactor::new(heap_start, heap_bytes, crate::side_table::CARD_BYTES),
            pool: WorkerPool::new(num_workers),
            collaborators,
            phase: Mutex::new(Phase::Idle),
            heap_end,
            config,
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, p: Phase) {
        log::info!(target: "g1core::engine", "phase -> {p:?}");
        *self.phase.lock().unwrap() = p;
    }

    pub fn regions(&self) -> &RegionManager {
        &self.regions
    }

    /// Exposes the attribute table and the host collaborators so test code
    /// can set up region state and object graphs directly, bypassing the
    /// (not-yet-built) allocator front end.
    #[cfg(any(test, feature = "test_private"))]
    pub fn attrs(&self) -> &RegionAttrTable {
        &self.attrs
    }

    #[cfg(any(test, feature = "test_private"))]
    pub fn collaborators(&self) -> &C {
        &self.collaborators
    }

    #[cfg(any(test, feature = "test_private"))]
    pub fn live_bytes_of(&self, id: RegionId) -> usize {
        self.live_bytes.get(id)
    }

    /// The single entry point a mutator/allocator calls to ask for
    /// collection work. Decides the next phase from `cause` and the
    /// engine's current state, runs it to completion, and reports what
    /// happened.
    pub fn drive(&self, cause: GcCause) -> Result<PauseReport, GcError> {
        log::info!(target: "g1core::engine", "drive cause={cause:?} phase={:?}", self.phase());
        let mut report = PauseReport::default();

        match self.phase() {
            Phase::ConcMark => {
                self.drive_concurrent_mark()?;
                self.run_remark()?;
                self.build_cset_candidates();
                self.set_phase(Phase::Idle);
            }
            Phase::Idle => match cause {
                GcCause::MarkCycleDue => self.start_concurrent_mark(),
                GcCause::MarkStackOverflow => self.run_full_gc(&mut report)?,
                GcCause::AllocationFailure | GcCause::ExplicitRequest => {
                    if self.cset_chooser.marking_len() > 0 {
                        self.run_mixed_pause(&mut report)?;
                    } else {
                        self.run_young_pause(&mut report)?;
                    }
                    if self.occupancy_above_ihop() {
                        self.start_concurrent_mark();
                    }
                }
            },
            _ => self.run_full_gc(&mut report)?,
        }

        report.phase = Some(self.phase());
        Ok(report)
    }

    /// Whether old-gen occupancy has crossed the initiating-heap-occupancy
    /// threshold (spec §4.3: `100 - mark_sweep_dead_ratio` percent of
    /// capacity), at which point a new concurrent-mark cycle starts so the
    /// cset chooser has fresh candidates before the next allocation failure.
    fn occupancy_above_ihop(&self) -> bool {
        let used: u64 = self.regions.old_regions().iter().map(|&id| self.regions.region(id).used_bytes() as u64).sum();
        let capacity = (self.regions.grain_bytes() * self.config.max_regions) as u64;
        let threshold = 100 - self.config.mark_sweep_dead_ratio as u64;
        used * 100 >= capacity * threshold
    }

    // ---- Young / mixed evacuation pauses ----------------------------------

    fn run_young_pause(&self, report: &mut PauseReport) -> Result<(), GcError> {
        self.set_phase(Phase::YoungPause);
        // Eden/survivor regions are not linked into `old_set`; the engine
        // tracks them via the attribute table instead. Collect every region
        // currently flagged YOUNG as this pause's collection set.
        let young: Vec<RegionId> = (0..self.regions.region_count())
            .map(|i| RegionId(i as u32))
            .filter(|&id| self.attrs.get(id).contains(RegionAttrs::YOUNG))
            .collect();

        self.evacuate_regions(&young, report)?;
        self.set_phase(Phase::Idle);
        Ok(())
    }

    fn run_mixed_pause(&self, report: &mut PauseReport) -> Result<(), GcError> {
        self.set_phase(Phase::MixedPause);
        let (selected, _optional) =
            self.cset_chooser.select_mixed_increment(self.config.pause_time_goal_ms as f64, |_| 0, &self.live_bytes);
        self.evacuate_regions(&selected, report)?;
        self.set_phase(Phase::Idle);
        Ok(())
    }

    /// Runs one evacuation pause over `cset` using the worker pool: every
    /// worker scans roots plus its share of the collection set's remembered
    /// cards, copies reachable survivors out, and drains to quiescence via
    /// the terminator before the pause returns.
    fn evacuate_regions(&self, cset: &[RegionId], report: &mut PauseReport) -> Result<(), GcError> {
        for &id in cset {
            self.attrs.insert(id, RegionAttrs::IN_CSET);
        }
        self.regions.reset_claim_cursor();

        // Step 3 (spec §4.5): refine whatever cards the mutator dirtied
        // since the last pause into `card_set` before the pool starts, so
        // every worker's later merge-cards share sees a complete picture.
        let objects_for_refine = self.collaborators.objects();
        crate::remset::refine_dirty_cards(&self.card_table, &self.card_set, &self.regions, objects_for_refine);

        let terminator = Terminator::new(self.pool.worker_count());
        let self_forwarded = Mutex::new(Vec::<(RegionId, ObjAddr)>::new());
        let total_copied = AtomicUsize::new(0);
        const CSET_STRIPE_LEN: usize = 4;

        self.pool.run_pause(|_ordinal| {
            let mut state = EvacWorkerState::new();
            let objects = self.collaborators.objects();
            let scanning = self.collaborators.roots();

            // A cset member that is already an Old region (mixed/full-style
            // evacuation of old candidates) must evacuate straight back into
            // Old, never into Survivor: age-based tenuring only applies to
            // young objects. There is no per-object age counter in this
            // engine (spec §9 keeps age implicit in the young/old region
            // split), so age is read off the object's *source* region kind.
            let tenure_age_of = |target: ObjAddr| -> u8 {
                if self.regions.region(self.regions.addr_to_region(target.addr())).kind() == RegionKind::Old {
                    self.config.tenure_threshold
                } else {
                    0
                }
            };

            macro_rules! evac_slot_for {
                ($state:expr) => {
                    |slot: &mut ObjAddr| {
                        let target = *slot;
                        if target.addr().is_zero() || !self.attrs.in_cset(self.regions.addr_to_region(target.addr())) {
                            return;
                        }
                        let age = tenure_age_of(target);
                        match evacuate_object(target, age, self.config.tenure_threshold, objects, $state, &self.regions) {
                            EvacOutcome::Copied(dest) | EvacOutcome::AlreadyForwarded(dest) => *slot = dest,
                            EvacOutcome::SelfForwarded(region) => {
                                self_forwarded.lock().unwrap().push((region, target));
                            }
                        }
                    }
                };
            }

            let mut evac_slot = evac_slot_for!(&mut state);

            scanning.scan_roots(&mut evac_slot);

            // Step 3's other half: each worker claims a disjoint stripe of
            // the collection set and merges that stripe's remembered cards
            // in as extra roots.
            while let Some(range) = self.regions.claim_stripe_over(cset.len(), CSET_STRIPE_LEN) {
                crate::remset::merge_cards_into_roots(&cset[range], &self.card_set, &self.card_table, &self.regions, objects, &mut evac_slot);
            }
            drop(evac_slot);

            loop {
                while let Some(entry) = state.queue.pop() {
                    let TaskEntry::Object(obj) = entry else { continue };
                    let mut evac_slot = evac_slot_for!(&mut state);
                    objects.oop_iterate(obj, &mut evac_slot);
                }
                if terminator.try_terminate(|| !state.queue.is_empty()) {
                    break;
                }
            }

            total_copied.fetch_add(state.bytes_copied.load(Ordering::Relaxed), Ordering::Relaxed);
        });

        // Step 7 (spec §4.5): a self-forwarded object's header still encodes
        // "forwarded to itself", which would otherwise make it permanently
        // indistinguishable from a real forwarding pointer. Restore it to a
        // normal, live-in-place object before the pause returns.
        let self_forwarded = self_forwarded.into_inner().unwrap();
        let objects = self.collaborators.objects();
        let failed: std::collections::HashSet<u32> = self_forwarded
            .into_iter()
            .map(|(region, obj)| {
                crate::evac::remove_self_forward(obj, objects);
                region.0
            })
            .collect();

        // Mandatory reference/weak processing at every evacuation pause
        // (spec: "Open Questions" resolved in DESIGN.md). A cset member is
        // alive post-pause either because it was never in the cset, or
        // because its evacuation failed and the region was retained
        // wholesale, or because the object survived and was forwarded.
        let cset_ids: std::collections::HashSet<u32> = cset.iter().map(|id| id.0).collect();
        let mut is_alive = |addr: ObjAddr| -> bool {
            let region = self.regions.addr_to_region(addr.addr());
            !cset_ids.contains(&region.0) || failed.contains(&region.0) || objects.is_forwarded(addr)
        };
        self.collaborators.references().process_discovered_references(
            ReferenceProcessingPolicy::AlwaysClear,
            &mut is_alive,
            &mut |addr| self.marker.satb_enqueue_direct(addr),
            &mut || {},
        );
        self.collaborators.weaks().process_weak_roots(&mut is_alive);

        for &id in cset {
            self.attrs.remove(id, RegionAttrs::IN_CSET);
            if failed.contains(&id.0) {
                self.cset_chooser.note_unreclaimed(id, 1);
                continue;
            }
            // Only old regions are linked into `old_set`; evacuating a
            // young (Eden/Survivor) region must not touch that list.
            if self.regions.region(id).kind() == RegionKind::Old {
                self.regions.try_remove_from_old_set(id, self.regions.region_count());
            }
            self.attrs.remove(id, RegionAttrs::YOUNG);
            self.regions.free_region(id);
            report.regions_reclaimed += 1;
        }
        report.bytes_copied = total_copied.load(Ordering::Relaxed);
        Ok(())
    }

    // ---- Concurrent marking -------------------------------------------------

    fn start_concurrent_mark(&self) {
        self.marker.initial_mark(&self.regions);
        self.set_phase(Phase::ConcMark);
    }

    /// Drives one concurrent-marking increment across the whole pool: every
    /// worker owns one `MarkTask` behind its own mutex (so `WorkerPool::
    /// run_pause`'s `Fn` closure never needs mutable capture), worker 0
    /// scans roots into task 0, and every worker steals from every other
    /// worker's queue once its own claimable-region work runs dry.
    fn drive_concurrent_mark(&self) -> Result<(), GcError> {
        let worker_count = self.pool.worker_count();
        let tasks: Vec<Mutex<MarkTask>> = (0..worker_count).map(|_| Mutex::new(MarkTask::new())).collect();
        let stealers: Vec<crossbeam::deque::Stealer<TaskEntry>> = tasks.iter().map(|t| t.lock().unwrap().queue.stealer()).collect();
        let aborted = AtomicBool::new(false);
        let terminator = Terminator::new(worker_count);

        self.pool.run_pause(|ordinal| {
            let objects = self.collaborators.objects();

            if ordinal == 0 {
                let scanning = self.collaborators.roots();
                self.marker.scan_roots(scanning, &mut *tasks[0].lock().unwrap(), &self.bitmap, &self.regions);
            }

            let other_stealers: Vec<_> = stealers.iter().enumerate().filter(|&(i, _)| i != ordinal).map(|(_, s)| s.clone()).collect();

            loop {
                let step_result = {
                    let mut task = tasks[ordinal].lock().unwrap();
                    self.marker.do_marking_step(&mut *task, objects, &self.bitmap, &self.regions, &other_stealers, Duration::from_millis(10))
                };
                match step_result {
                    StepResult::Completed => {
                        let done = terminator.try_terminate(|| {
                            !self.marker.overflow_stack.is_empty() || tasks.iter().any(|t| !t.lock().unwrap().queue.is_empty())
                        });
                        if done {
                            break;
                        }
                    }
                    StepResult::TimedOut => {}
                    StepResult::Overflow => {
                        self.marker.recover_from_overflow(&mut *tasks[ordinal].lock().unwrap());
                    }
                    StepResult::Aborted => {
                        aborted.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        });

        if aborted.load(Ordering::Acquire) {
            return Err(GcError::InvariantViolation("mark aborted".into()));
        }
        for task in &tasks {
            ConcurrentMarker::flush_stats(&*task.lock().unwrap(), &self.live_bytes);
        }
        self.marker.mark_complete();
        Ok(())
    }

    /// Drains the mutator SATB buffers accumulated since initial mark, marks
    /// to completion, then runs mandatory reference/weak processing. A
    /// reference processor's `keep_alive` callback can enqueue fresh SATB
    /// entries (an object only reachable through a soft/weak reference that
    /// was just resurrected), so this repeats drain-then-mark-then-process
    /// until a round processes references without keeping anything new
    /// alive.
    fn run_remark(&self) -> Result<(), GcError> {
        self.set_phase(Phase::Remark);
        let mut task = MarkTask::new();
        let objects = self.collaborators.objects();

        loop {
            self.marker.drain_satb_buffers(&mut task, &self.bitmap, &self.regions);
            loop {
                match self.marker.do_marking_step(&mut task, objects, &self.bitmap, &self.regions, &[], Duration::from_millis(10)) {
                    StepResult::Completed => break,
                    StepResult::TimedOut => continue,
                    StepResult::Overflow => {
                        self.marker.recover_from_overflow(&mut task);
                        continue;
                    }
                    StepResult::Aborted => return Err(GcError::InvariantViolation("remark aborted".into())),
                }
            }

            let mut is_alive = |addr: ObjAddr| self.bitmap.is_marked(addr.addr());
            let mut any_kept_alive = false;
            {
                let marker = &self.marker;
                let mut keep_alive = |addr: ObjAddr| {
                    any_kept_alive = true;
                    marker.satb_enqueue_direct(addr);
                };
                self.collaborators.references().process_discovered_references(
                    ReferenceProcessingPolicy::AlwaysClear,
                    &mut is_alive,
                    &mut keep_alive,
                    &mut || {},
                );
                self.collaborators.weaks().process_weak_roots(&mut is_alive);
            }
            if !any_kept_alive {
                break;
            }
        }

        ConcurrentMarker::flush_stats(&task, &self.live_bytes);
        self.marker.remark_done();
        Ok(())
    }

    fn build_cset_candidates(&self) {
        self.set_phase(Phase::Cleanup);
        self.cset_chooser.build_candidates(
            &self.regions,
            &self.attrs,
            &self.live_bytes,
            self.config.live_threshold_percent,
            |_| 0,
            |_| false,
        );
        self.cset_chooser
            .prune(self.config.min_old_cset_length, self.config.allowed_waste, &self.attrs, &self.card_set);
    }

    // ---- Full compaction -----------------------------------------------------

    /// Runs a full collection's five phases (mark, summary, adjust,
    /// compact, reclaim). Summary stays a single left-to-right scan (it
    /// computes one region's destination from the running end of the
    /// previous region's, an inherently sequential dependency); adjust and
    /// compact shard over disjoint regions through the worker pool once
    /// summary has assigned every surviving object a destination.
    fn run_full_gc(&self, report: &mut PauseReport) -> Result<(), GcError> {
        self.set_phase(Phase::FullGc);
        let objects = self.collaborators.objects();
        let scanning = self.collaborators.roots();
        let heap_start = self.regions.heap_start;

        self.compactor.phase_mark(objects, scanning, &self.bitmap, heap_start, self.heap_end);

        // Mandatory reference/weak processing at the full-GC mark step.
        // `keep_alive` resurrects an otherwise-dead referent by graying it
        // and draining its transitive closure immediately: `phase_mark`'s
        // own worklist has already drained by the time reference discovery
        // runs, so this runs its own small follow-up BFS over the same
        // bitmap/queue primitives.
        {
            let keep_alive_queue = LocalQueue::new();
            let mut is_alive = |addr: ObjAddr| self.bitmap.is_marked(addr.addr());
            let mut keep_alive = |addr: ObjAddr| {
                if self.bitmap.set_bit(addr.addr()) {
                    keep_alive_queue.push(TaskEntry::Object(addr));
                }
            };
            self.collaborators.references().process_discovered_references(
                ReferenceProcessingPolicy::AlwaysClear,
                &mut is_alive,
                &mut keep_alive,
                &mut || {},
            );
            self.collaborators.weaks().process_weak_roots(&mut is_alive);
            while let Some(entry) = keep_alive_queue.pop() {
                let TaskEntry::Object(obj) = entry else { continue };
                if objects.is_filler(obj) {
                    continue;
                }
                objects.oop_iterate(obj, &mut |slot: &mut ObjAddr| {
                    let target = *slot;
                    if !target.addr().is_zero() && self.bitmap.set_bit(target.addr()) {
                        keep_alive_queue.push(TaskEntry::Object(target));
                    }
                });
            }
        }

        let old_regions = self.regions.old_regions();
        self.compactor.phase_summary(&self.regions, objects, &self.bitmap, &old_regions, 100 - self.config.mark_sweep_dead_ratio);

        const FULL_GC_STRIPE_LEN: usize = 4;

        // Phase 4: root half runs once, then every old region's share (the
        // dense prefix included — a dense-prefix object can still hold
        // outgoing references into a compacted region) is sharded across
        // the pool.
        self.compactor.adjust_roots(&self.regions, objects, scanning);
        self.regions.reset_claim_cursor();
        self.pool.run_pause(|_ordinal| {
            while let Some(range) = self.regions.claim_stripe_over(old_regions.len(), FULL_GC_STRIPE_LEN) {
                for &id in &old_regions[range] {
                    self.compactor.phase_adjust_region(&self.regions, objects, &self.bitmap, id);
                }
            }
        });

        // Phase 5: only the post-dense-prefix regions actually move;
        // disjoint source regions never write overlapping destination
        // bytes, so this is safe to shard the same way.
        let dense_count = self.compactor.dense_prefix_len();
        let compactable = &old_regions[dense_count.min(old_regions.len())..];
        self.regions.reset_claim_cursor();
        self.pool.run_pause(|_ordinal| {
            while let Some(range) = self.regions.claim_stripe_over(compactable.len(), FULL_GC_STRIPE_LEN) {
                for &id in &compactable[range] {
                    self.compactor.phase_compact_region(&self.regions, objects, &self.bitmap, id);
                }
            }
        });
        self.compactor.finalize_compacted_regions(&self.regions, compactable);
        crate::compact::reclaim_fully_empty_regions(&self.regions, &old_regions);

        self.cset_chooser.clear();
        self.set_phase(Phase::Idle);
        report.regions_reclaimed = old_regions.len();
        Ok(())
    }
}
