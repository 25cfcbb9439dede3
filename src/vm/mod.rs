//! External-collaborator contracts.
//!
//! Everything in this module is a trait the *host* implements: object
//! layout, root scanning, reference processing, and weak-oop processing are
//! all out of this crate's scope (see the crate's module docs) and are
//! supplied by whatever language runtime embeds the engine. Hot inner loops
//! (the marking step, the evacuation copy loop) are generic over these
//! traits and monomorphize, rather than calling through `dyn Trait`, per
//! the design note on avoiding dynamic dispatch in hot paths.

use crate::addr::ObjAddr;

#[cfg(any(test, feature = "mock_test"))]
pub mod mock;

/// A reference slot, as handed to an `oop_iterate` visitor: `*slot` is the
/// current referent (`ObjAddr::from_addr(Addr::ZERO)` for a null slot), and
/// writing through it relocates the reference in place. Modeled as a
/// mutable reference rather than a raw address the collector dereferences
/// itself, so the object model retains full control over its own storage
/// representation.
pub type Slot<'a> = &'a mut ObjAddr;

/// The object/header contract (spec: "Object/Header contract").
///
/// Implementors must ensure every method remains callable on a forwarded
/// object (one whose header has been overwritten with a forwarding
/// pointer) and on an object below a region's TAMS during concurrent
/// marking.
pub trait ObjectModel: Send + Sync {
    /// Size of the object at `obj`, in heap words.
    fn size(&self, obj: ObjAddr) -> usize;

    /// Invokes `visit` once per reference slot in the object. Null slots
    /// (`ObjAddr`'s address is zero) are skipped.
    fn oop_iterate(&self, obj: ObjAddr, visit: &mut dyn FnMut(Slot<'_>));

    /// Invokes `visit` once per reference slot in `[start, start+length)`
    /// of an array object, for chunked scanning of large arrays (spec:
    /// array entries are sliced so no one worker owns a whole huge array).
    /// The default forwards to `oop_iterate` and ignores the range, which
    /// is correct but non-parallel; object models backing large arrays
    /// should override this for real chunking.
    fn oop_iterate_slice(&self, obj: ObjAddr, start: usize, length: usize, visit: &mut dyn FnMut(Slot<'_>)) {
        let _ = (start, length);
        self.oop_iterate(obj, visit);
    }

    /// Copies `src`'s full representation (header included) to `dest`,
    /// which must be freshly allocated and at least `size(src)` words.
    /// Called by the evacuation and compaction drivers immediately before
    /// they install a forwarding pointer over `src`'s header.
    fn copy_to(&self, src: ObjAddr, dest: ObjAddr);

    fn mark_word(&self, obj: ObjAddr) -> u64;
    fn set_mark_word(&self, obj: ObjAddr, word: u64);
    fn cas_mark_word(&self, obj: ObjAddr, expected: u64, new: u64) -> bool;

    /// Resets the mark word to this object's class prototype. Called after
    /// evacuation/compaction installs a copy, and when restoring a
    /// self-forwarded object's original header.
    fn init_mark(&self, obj: ObjAddr);

    /// Whether `obj`'s header currently encodes a per-object forwarding
    /// pointer (the evacuation-pause protocol, distinct from the
    /// full-compaction header-encoded scheme in `crate::compact`).
    fn is_forwarded(&self, obj: ObjAddr) -> bool;
    fn forwardee(&self, obj: ObjAddr) -> ObjAddr;

    /// True for the two sentinel filler classes (filler object, filler
    /// array); both scan as zero references.
    fn is_filler(&self, obj: ObjAddr) -> bool {
        let _ = obj;
        false
    }
}

/// Supplies the initial root set to a marking or evacuation pause. The
/// collector does not know what "a root" is (thread stacks, globals,
/// class-loader graphs); it only knows how to ask for them.
pub trait Scanning: Send + Sync {
    /// Invokes `visit` once per root reference. May be called from
    /// multiple worker threads concurrently; implementors should partition
    /// their root sources (e.g. one thread stack per call) rather than
    /// synchronizing internally.
    fn scan_roots(&self, visit: &mut dyn FnMut(Slot<'_>));

    /// Root regions scanned during the concurrent mark's initial phase
    /// (survivor regions that may hold references into old regions).
    fn scan_root_regions(&self, regions: &[crate::region::RegionId], visit: &mut dyn FnMut(Slot<'_>)) {
        let _ = (regions, visit);
    }
}

/// Outcome of processing one reference-processing tier.
#[derive(Default, Debug, Clone, Copy)]
pub struct ReferenceStats {
    pub discovered: usize,
    pub cleared: usize,
    pub enqueued: usize,
}

/// The soft-reference clearing policy; only the soft tier is pluggable
/// (weak/final/phantom always clear when unreached), matching the
/// original reference processor's policy surface.
#[derive(Clone, Copy, Debug)]
pub enum ReferenceProcessingPolicy {
    AlwaysClear,
    ClearOnRequest,
    ClearByAge { max_soft_ref_age: u32 },
}

/// Sequences soft/weak/final/phantom reference processing using
/// collector-supplied closures. The collector drives liveness; this trait
/// only fixes the *order* (soft, then weak, then final, then phantom) and
/// dispatches to the host's discovered-reference lists.
pub trait ReferenceProcessor: Send + Sync {
    fn process_discovered_references(
        &self,
        policy: ReferenceProcessingPolicy,
        is_alive: &mut dyn FnMut(ObjAddr) -> bool,
        keep_alive: &mut dyn FnMut(ObjAddr),
        complete_gc: &mut dyn FnMut(),
    ) -> ReferenceStats;
}

/// Iterates all registered weak-oop storages (JNI weak globals, string
/// table, etc.), clearing slots whose referent is unreached.
pub trait WeakProcessor: Send + Sync {
    fn process_weak_roots(&self, is_alive: &mut dyn FnMut(ObjAddr) -> bool);
}

/// Bundles the four external-collaborator contracts the engine needs for
/// one run. A host implements this once for its object layout and runtime.
pub trait Collaborators: Send + Sync {
    type Objects: ObjectModel;
    type Roots: Scanning;
    type References: ReferenceProcessor;
    type Weaks: WeakProcessor;

    fn objects(&self) -> &Self::Objects;
    fn roots(&self) -> &Self::Roots;
    fn references(&self) -> &Self::References;
    fn weaks(&self) -> &Self::Weaks;
}
