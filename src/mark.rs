//! Concurrent SATB marking.
//!
//! Implements the state machine and `do_marking_step` algorithm: workers
//! claim regions off a shared finger, sweep each region's mark bitmap from
//! its local finger to the region's TAMS, and push newly-grayed references
//! onto a local queue that spills to a global overflow stack when workers
//! produce faster than they consume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::addr::{Addr, ObjAddr};
use crate::queue::{GlobalMarkStack, LocalQueue, TaskEntry};
use crate::region::RegionId;
use crate::region_manager::RegionManager;
use crate::vm::{ObjectModel, Scanning};

/// The marker's externally-visible state machine (spec §4.3).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MarkPhase {
    Idle,
    InitialMark,
    RootScanDone,
    MarkComplete,
    RemarkDone,
}

/// Outcome of one `do_marking_step` invocation.
#[derive(Debug)]
pub enum StepResult {
    /// Local queue, global stack, and (if requested) termination all
    /// agreed the cycle is done.
    Completed,
    /// The global mark stack hit its chunk cap; caller must run the
    /// two-barrier overflow-recovery protocol and restart from
    /// `RootScanDone`.
    Overflow,
    /// The step's time budget was exceeded; caller should reschedule.
    TimedOut,
    /// `abort()` was called externally (a full GC preempted concurrent
    /// marking).
    Aborted,
}

/// How often (in objects scanned) a marking step re-checks its clock for
/// abort/overflow/time-target conditions.
const CLOCK_INTERVAL: usize = 256;

/// Per-worker state for one marking task: a local finger into whatever
/// region it currently holds, plus a private cache of region -> live-bytes
/// contributions flushed into the global array at remark.
pub struct MarkTask {
    pub queue: LocalQueue,
    local_finger: Addr,
    current_region: Option<RegionId>,
    pub region_stats: HashMap<RegionId, usize>,
}

impl MarkTask {
    pub fn new() -> Self {
        MarkTask {
            queue: LocalQueue::new(),
            local_finger: Addr::ZERO,
            current_region: None,
            region_stats: HashMap::new(),
        }
    }
}

impl Default for MarkTask {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutator-side SATB (snapshot-at-the-beginning) write-barrier buffer: the
/// pre-write barrier pushes the *old* value of a slot about to be
/// overwritten here, since SATB needs the snapshot taken at initial-mark to
/// stay reachable even after a concurrent mutation drops the only other
/// reference to it. Flushes to the marker's shared buffer list once full so
/// no single mutator thread's buffer grows unbounded.
pub struct SatbBuffer {
    entries: Vec<ObjAddr>,
}

const SATB_BUFFER_CAPACITY: usize = 256;

impl SatbBuffer {
    pub fn new() -> Self {
        SatbBuffer { entries: Vec::with_capacity(SATB_BUFFER_CAPACITY) }
    }

    /// Records `old_referent` as needing to be kept alive through this
    /// marking cycle. A no-op while marking is not active, or for a null
    /// referent — mirrors the teacher's own pre-write-barrier fast-out path.
    pub fn push(&mut self, marker: &ConcurrentMarker, old_referent: ObjAddr) {
        if !marker.is_satb_active() || old_referent.addr().is_zero() {
            return;
        }
        self.entries.push(old_referent);
        if self.entries.len() >= SATB_BUFFER_CAPACITY {
            self.flush(marker);
        }
    }

    pub fn flush(&mut self, marker: &ConcurrentMarker) {
        if self.entries.is_empty() {
            return;
        }
        marker.enqueue_satb_buffer(std::mem::take(&mut self.entries));
    }
}

impl Default for SatbBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared marker state: the global sweep finger, the bitmap, the overflow
/// stack, and the phase/abort flags every worker polls.
pub struct ConcurrentMarker {
    phase: Mutex<MarkPhase>,
    finger: AtomicUsize,
    heap_start: Addr,
    heap_end: Addr,
    pub overflow_stack: GlobalMarkStack,
    abort: AtomicBool,
    pub root_regions: Mutex<Vec<RegionId>>,
    satb_active: AtomicBool,
    satb_buffers: Mutex<Vec<Vec<ObjAddr>>>,
}

impl ConcurrentMarker {
    pub fn new(heap_start: Addr, heap_end: Addr, max_mark_stack_chunks: usize) -> Self {
        ConcurrentMarker {
            phase: Mutex::new(MarkPhase::Idle),
            finger: AtomicUsize::new(heap_start.as_usize()),
            heap_start,
            heap_end,
            overflow_stack: GlobalMarkStack::new(max_mark_stack_chunks),
            abort: AtomicBool::new(false),
            root_regions: Mutex::new(Vec::new()),
            satb_active: AtomicBool::new(false),
            satb_buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_satb_active(&self) -> bool {
        self.satb_active.load(Ordering::Acquire)
    }

    /// Files a full mutator-side SATB buffer for later draining at remark.
    pub fn enqueue_satb_buffer(&self, buf: Vec<ObjAddr>) {
        self.satb_buffers.lock().unwrap().push(buf);
    }

    /// Enqueues a single old referent directly, bypassing a per-thread
    /// buffer; used by collector-internal callers (e.g. the reference
    /// processor's `keep_alive` callback) that don't carry a `SatbBuffer`.
    pub fn satb_enqueue_direct(&self, old_referent: ObjAddr) {
        if !self.is_satb_active() || old_referent.addr().is_zero() {
            return;
        }
        self.satb_buffers.lock().unwrap().push(vec![old_referent]);
    }

    /// Drains every buffered SATB entry into `task`'s mark queue, graying
    /// each one. Called once at remark, after every mutator buffer that was
    /// going to be flushed this cycle has had the chance to flush.
    pub fn drain_satb_buffers(&self, task: &mut MarkTask, bitmap: &crate::mark_bitmap::MarkBitmap, regions: &RegionManager) {
        let buffers = std::mem::take(&mut *self.satb_buffers.lock().unwrap());
        for buf in buffers {
            for obj in buf {
                self.mark_and_push(obj, task, bitmap, regions);
            }
        }
    }

    pub fn phase(&self) -> MarkPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, p: MarkPhase) {
        log::debug!(target: "g1core::mark", "phase -> {p:?}");
        *self.phase.lock().unwrap() = p;
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Requested by a full-GC initiator to preempt a running concurrent
    /// cycle. Idempotent with never having started one (spec property 9).
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.overflow_stack.reset();
        self.satb_active.store(false, Ordering::Release);
        self.satb_buffers.lock().unwrap().clear();
        self.set_phase(MarkPhase::Idle);
    }

    /// Snapshots TAMS for every region that is a marking root (every
    /// committed region at initial-mark time in this simplified model;
    /// a host that also tracks humongous/archive regions separately would
    /// filter here) and resets the sweep finger to the heap start.
    pub fn initial_mark(&self, regions: &RegionManager) {
        self.abort.store(false, Ordering::Release);
        for r in regions.all_regions() {
            r.snapshot_tams();
        }
        self.finger.store(self.heap_start.as_usize(), Ordering::Release);
        self.satb_buffers.lock().unwrap().clear();
        self.satb_active.store(true, Ordering::Release);
        self.set_phase(MarkPhase::InitialMark);
    }

    /// Scans roots into `injector_queue`, entering the `RootScanDone` phase.
    /// In this engine roots are pushed directly onto the calling worker's
    /// local queue; a production scheduler would fan this out across
    /// multiple root-scanning workers.
    pub fn scan_roots(&self, scanning: &dyn Scanning, task: &mut MarkTask, bitmap: &crate::mark_bitmap::MarkBitmap, regions: &RegionManager) {
        scanning.scan_roots(&mut |slot| {
            let target = *slot;
            if !target.addr().is_zero() {
                self.mark_and_push(target, task, bitmap, regions);
            }
        });
        self.set_phase(MarkPhase::RootScanDone);
    }

    /// Grays `obj` if it is below its region's TAMS and not already marked;
    /// pushes it onto `task`'s local queue on the 0->1 transition.
    pub fn mark_and_push(
        &self,
        obj: ObjAddr,
        task: &mut MarkTask,
        bitmap: &crate::mark_bitmap::MarkBitmap,
        regions: &RegionManager,
    ) {
        let region_id = regions.addr_to_region(obj.addr());
        let region = regions.region(region_id);
        if obj.addr() >= region.tams() {
            // Implicitly live: allocated after the snapshot, never grayed.
            return;
        }
        if bitmap.set_bit(obj.addr()) {
            task.queue.push(TaskEntry::Object(obj));
        }
    }

    /// Claims the next unclaimed region for sweeping, advancing the shared
    /// finger by CAS. Returns `None` once the finger reaches the heap end.
    pub fn claim_region(&self, regions: &RegionManager) -> Option<RegionId> {
        loop {
            let cur = self.finger.load(Ordering::Acquire);
            if cur >= self.heap_end.as_usize() {
                return None;
            }
            let region_id = regions.addr_to_region(Addr::from_usize(cur));
            let region = regions.region(region_id);
            let region_end = region.end.as_usize();
            match self.finger.compare_exchange(cur, region_end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if region.tams() > region.bottom {
                        return Some(region_id);
                    }
                    // Empty of marking root work; loop to claim the next one.
                }
                Err(_) => continue,
            }
        }
    }

    /// The marking step (spec §4.3.3). Drains local/global work, sweeps
    /// claimed regions' bitmaps, and periodically checks the clock for
    /// abort/overflow/timeout.
    #[allow(clippy::too_many_arguments)]
    pub fn do_marking_step(
        &self,
        task: &mut MarkTask,
        objects: &dyn ObjectModel,
        bitmap: &crate::mark_bitmap::MarkBitmap,
        regions: &RegionManager,
        stealers: &[crossbeam::deque::Stealer<TaskEntry>],
        time_target: Duration,
    ) -> StepResult {
        let start = Instant::now();
        let mut scanned = 0usize;

        macro_rules! clock_check {
            () => {{
                scanned += 1;
                if scanned % CLOCK_INTERVAL == 0 {
                    if self.is_aborted() {
                        return StepResult::Aborted;
                    }
                    if self.overflow_stack.has_overflowed() {
                        return StepResult::Overflow;
                    }
                    if start.elapsed() > time_target {
                        return StepResult::TimedOut;
                    }
                }
            }};
        }

        // Pull a share of the global overflow stack back to the local queue.
        for entry in self.overflow_stack.pop_batch(64) {
            task.queue.push(entry);
        }

        loop {
            if let Some(region_id) = task.current_region {
                let region = regions.region(region_id);
                let limit = region.tams();
                if task.local_finger >= limit {
                    task.current_region = None;
                    continue;
                }
                match bitmap.find_next_marked_addr(task.local_finger, limit) {
                    Some(addr) => {
                        let obj = ObjAddr::from_addr(addr);
                        task.local_finger = addr + crate::addr::BYTES_IN_WORD;
                        if !objects.is_filler(obj) {
                            let size = objects.size(obj);
                            *task.region_stats.entry(region_id).or_insert(0) += size * crate::addr::BYTES_IN_WORD;
                            objects.oop_iterate(obj, &mut |slot| {
                                let target = *slot;
                                if !target.addr().is_zero() {
                                    self.mark_and_push(target, task, bitmap, regions);
                                }
                            });
                        }
                        clock_check!();
                        continue;
                    }
                    None => {
                        task.current_region = None;
                        continue;
                    }
                }
            }

            if let Some(entry) = task.queue.pop() {
                self.process_entry(entry, task, objects, bitmap, regions);
                clock_check!();
                continue;
            }

            match self.claim_region(regions) {
                Some(region_id) => {
                    task.current_region = Some(region_id);
                    task.local_finger = regions.region(region_id).bottom;
                    continue;
                }
                None => break,
            }
        }

        // Local and claimable-region work is exhausted; try stealing
        // before declaring this worker quiescent.
        for stealer in stealers {
            if let Some(entry) = task.queue.steal_from(stealer) {
                self.process_entry(entry, task, objects, bitmap, regions);
                return StepResult::TimedOut; // re-enter do_marking_step to keep draining
            }
        }

        if self.overflow_stack.has_overflowed() {
            return StepResult::Overflow;
        }
        StepResult::Completed
    }

    fn process_entry(
        &self,
        entry: TaskEntry,
        task: &mut MarkTask,
        objects: &dyn ObjectModel,
        bitmap: &crate::mark_bitmap::MarkBitmap,
        regions: &RegionManager,
    ) {
        match entry {
            TaskEntry::Object(obj) => {
                if objects.is_filler(obj) {
                    return;
                }
                let region_id = regions.addr_to_region(obj.addr());
                let size = objects.size(obj);
                *task.region_stats.entry(region_id).or_insert(0) += size * crate::addr::BYTES_IN_WORD;
                objects.oop_iterate(obj, &mut |slot| {
                    let target = *slot;
                    if !target.addr().is_zero() {
                        self.mark_and_push(target, task, bitmap, regions);
                    }
                });
            }
            TaskEntry::Slice { base, start, length } => {
                objects.oop_iterate_slice(base, start, length, &mut |slot| {
                    let target = *slot;
                    if !target.addr().is_zero() {
                        self.mark_and_push(target, task, bitmap, regions);
                    }
                });
            }
        }
    }

    /// Worker 0 resets shared state between the two overflow barriers; all
    /// workers then restart from `RootScanDone` (the bitmap already
    /// records previously-grayed objects, so no progress is lost).
    pub fn recover_from_overflow(&self, task: &mut MarkTask) {
        task.current_region = None;
        task.local_finger = Addr::ZERO;
        self.finger.store(self.heap_start.as_usize(), Ordering::Release);
        self.overflow_stack.reset();
        self.set_phase(MarkPhase::RootScanDone);
    }

    pub fn mark_complete(&self) {
        self.set_phase(MarkPhase::MarkComplete);
    }

    pub fn remark_done(&self) {
        self.satb_active.store(false, Ordering::Release);
        self.set_phase(MarkPhase::RemarkDone);
    }

    pub fn idle(&self) {
        self.set_phase(MarkPhase::Idle);
    }

    /// Flushes a worker's per-region live-bytes cache into the shared
    /// array. Called once per worker at the end of the remark pause.
    pub fn flush_stats(task: &MarkTask, live_bytes: &crate::side_table::RegionScalarTable) {
        for (&region, &bytes) in &task.region_stats {
            live_bytes.fetch_add(region, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark_bitmap::MarkBitmap;

    #[test]
    fn satb_buffer_is_inert_outside_a_marking_cycle() {
        let marker = ConcurrentMarker::new(Addr::from_usize(0x10_0000), Addr::from_usize(0x20_0000), 4);
        let mut buf = SatbBuffer::new();
        buf.push(&marker, ObjAddr::from_addr(Addr::from_usize(0x10_0008)));
        buf.flush(&marker);
        assert_eq!(marker.satb_buffers.lock().unwrap().len(), 0);
    }

    #[test]
    fn drain_satb_buffers_grays_buffered_entries() {
        let heap_start = Addr::from_usize(0x10_0000);
        let regions = RegionManager::new(heap_start, 1 << 10, 2);
        let bitmap = MarkBitmap::new(heap_start, (2usize << 10) * crate::addr::BYTES_IN_WORD);
        let marker = ConcurrentMarker::new(heap_start, heap_start + (2usize << 10) * crate::addr::BYTES_IN_WORD, 4);
        regions.region(RegionId(0)).try_bump(128).unwrap();
        marker.initial_mark(&regions);

        let obj = ObjAddr::from_addr(heap_start + 64);
        let mut buf = SatbBuffer::new();
        buf.push(&marker, obj);
        buf.flush(&marker);
        assert_eq!(marker.satb_buffers.lock().unwrap().len(), 1);

        let mut task = MarkTask::new();
        marker.drain_satb_buffers(&mut task, &bitmap, &regions);
        assert!(bitmap.is_marked(obj.addr()));
        assert!(!task.queue.is_empty());
        assert_eq!(marker.satb_buffers.lock().unwrap().len(), 0);
    }
}
