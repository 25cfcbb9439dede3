//! A minimal in-process mock collaborator, used to drive marking,
//! evacuation, and compaction end-to-end without a real VM.
//!
//! Grounded on the teacher's mock-VM test utilities: a small fixed-shape
//! object format backed by a plain growable word arena, with a
//! configurable out-of-band reference list per object so test code can
//! build arbitrary object graphs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::addr::{Addr, ObjAddr};
use crate::region::RegionId;
use crate::vm::{Collaborators, ObjectModel, ReferenceProcessingPolicy, ReferenceProcessor, ReferenceStats, Scanning, Slot};

/// One mock object: a mark word followed by a fixed list of reference
/// slots. `size()` is `1 + refs.len()` words; slots holding `Addr::ZERO`
/// are treated as null and are not visited.
struct MockObject {
    mark_word: AtomicU64,
    refs: RwLock<Vec<ObjAddr>>,
}

fn is_null(a: ObjAddr) -> bool {
    a.addr().is_zero()
}

/// A backing arena for mock objects, addressed by `ObjAddr`s the test
/// assigns itself (this mock does not allocate into real regions; callers
/// that need region-addressed objects use `MockHeap::place` to associate
/// an object with a chosen address computed from a `RegionManager`).
pub struct MockHeap {
    objects: RwLock<std::collections::HashMap<usize, MockObject>>,
    roots: RwLock<Vec<Addr>>,
}

impl MockHeap {
    pub fn new() -> Self {
        MockHeap { objects: RwLock::new(std::collections::HashMap::new()), roots: RwLock::new(Vec::new()) }
    }

    /// Registers a mock object at `addr` with `refs` as its initial
    /// reference slots (use `Addr::ZERO` for an unused/null slot).
    pub fn place(&self, addr: Addr, refs: Vec<Addr>) -> ObjAddr {
        self.objects.write().unwrap().insert(
            addr.as_usize(),
            MockObject {
                mark_word: AtomicU64::new(0),
                refs: RwLock::new(refs.into_iter().map(ObjAddr::from_addr).collect()),
            },
        );
        ObjAddr::from_addr(addr)
    }

    pub fn add_root(&self, addr: Addr) {
        self.roots.write().unwrap().push(addr);
    }

    pub fn set_ref(&self, obj: ObjAddr, slot_index: usize, target: Addr) {
        let objects = self.objects.read().unwrap();
        let o = objects.get(&obj.addr().as_usize()).expect("unknown mock object");
        o.refs.write().unwrap()[slot_index] = ObjAddr::from_addr(target);
    }

    pub fn get_ref(&self, obj: ObjAddr, slot_index: usize) -> ObjAddr {
        let objects = self.objects.read().unwrap();
        let result = objects.get(&obj.addr().as_usize()).expect("unknown mock object").refs.read().unwrap()[slot_index];
        result
    }

    pub fn region_of(&self, mgr: &crate::region_manager::RegionManager, obj: ObjAddr) -> RegionId {
        mgr.addr_to_region(obj.addr())
    }
}

impl Default for MockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectModel for MockHeap {
    fn size(&self, obj: ObjAddr) -> usize {
        let objects = self.objects.read().unwrap();
        let o = objects.get(&obj.addr().as_usize()).expect("unknown mock object");
        let result = 1 + o.refs.read().unwrap().len();
        result
    }

    fn oop_iterate(&self, obj: ObjAddr, visit: &mut dyn FnMut(Slot<'_>)) {
        let objects = self.objects.read().unwrap();
        let o = objects.get(&obj.addr().as_usize()).expect("unknown mock object");
        let mut refs = o.refs.write().unwrap();
        for r in refs.iter_mut() {
            if !is_null(*r) {
                visit(r);
            }
        }
    }

    fn copy_to(&self, src: ObjAddr, dest: ObjAddr) {
        let (mark, refs) = {
            let objects = self.objects.read().unwrap();
            let o = objects.get(&src.addr().as_usize()).expect("unknown mock object");
            let result = (o.mark_word.load(Ordering::Acquire), o.refs.read().unwrap().clone());
            result
        };
        self.objects
            .write()
            .unwrap()
            .insert(dest.addr().as_usize(), MockObject { mark_word: AtomicU64::new(mark), refs: RwLock::new(refs) });
    }

    fn mark_word(&self, obj: ObjAddr) -> u64 {
        let objects = self.objects.read().unwrap();
        objects.get(&obj.addr().as_usize()).expect("unknown mock object").mark_word.load(Ordering::Acquire)
    }

    fn set_mark_word(&self, obj: ObjAddr, word: u64) {
        let objects = self.objects.read().unwrap();
        objects.get(&obj.addr().as_usize()).expect("unknown mock object").mark_word.store(word, Ordering::Release);
    }

    fn cas_mark_word(&self, obj: ObjAddr, expected: u64, new: u64) -> bool {
        let objects = self.objects.read().unwrap();
        let o = objects.get(&obj.addr().as_usize()).expect("unknown mock object");
        o.mark_word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn init_mark(&self, obj: ObjAddr) {
        self.set_mark_word(obj, 0);
    }

    fn is_forwarded(&self, obj: ObjAddr) -> bool {
        self.mark_word(obj) & 1 == 1
    }

    fn forwardee(&self, obj: ObjAddr) -> ObjAddr {
        ObjAddr::from_addr(Addr::from_usize((self.mark_word(obj) >> 1) as usize))
    }
}

impl Scanning for MockHeap {
    fn scan_roots(&self, visit: &mut dyn FnMut(Slot<'_>)) {
        let mut roots = self.roots.write().unwrap();
        for r in roots.iter_mut() {
            let mut obj = ObjAddr::from_addr(*r);
            visit(&mut obj);
            *r = obj.addr();
        }
    }
}

/// A reference processor that treats every discovered reference as
/// immediately resolvable via the supplied `is_alive` closure: no separate
/// discovery lists, since the mock never defers reference handling past a
/// single pause.
#[derive(Default)]
pub struct NullReferenceProcessor;

impl ReferenceProcessor for NullReferenceProcessor {
    fn process_discovered_references(
        &self,
        _policy: ReferenceProcessingPolicy,
        _is_alive: &mut dyn FnMut(ObjAddr) -> bool,
        _keep_alive: &mut dyn FnMut(ObjAddr),
        complete_gc: &mut dyn FnMut(),
    ) -> ReferenceStats {
        complete_gc();
        ReferenceStats::default()
    }
}

#[derive(Default)]
pub struct NullWeakProcessor;

impl crate::vm::WeakProcessor for NullWeakProcessor {
    fn process_weak_roots(&self, _is_alive: &mut dyn FnMut(ObjAddr) -> bool) {}
}

/// Bundles a [`MockHeap`] with the null reference/weak processors into one
/// [`Collaborators`] impl, so engine-level tests can drive [`crate::engine::Engine`]
/// without a real language runtime.
#[derive(Default)]
pub struct MockCollaborators {
    pub heap: MockHeap,
    references: NullReferenceProcessor,
    weaks: NullWeakProcessor,
}

impl MockCollaborators {
    pub fn new() -> Self {
        MockCollaborators::default()
    }
}

impl Collaborators for MockCollaborators {
    type Objects = MockHeap;
    type Roots = MockHeap;
    type References = NullReferenceProcessor;
    type Weaks = NullWeakProcessor;

    fn objects(&self) -> &MockHeap {
        &self.heap
    }

    fn roots(&self) -> &MockHeap {
        &self.heap
    }

    fn references(&self) -> &NullReferenceProcessor {
        &self.references
    }

    fn weaks(&self) -> &NullWeakProcessor {
        &self.weaks
    }
}
