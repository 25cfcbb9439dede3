//! Per-worker task queues and the global overflow mark stack.
//!
//! Local queues are `crossbeam::deque` work-stealing deques, the same
//! primitive the teacher's scheduler uses for GC work packets. The global
//! overflow stack is a chunked append-only structure: chunks are fixed-size
//! arrays linked through a lock-free head pointer, with chunk *allocation*
//! (growing the backing bucket array) behind a mutex since it is rare.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};

use crate::addr::ObjAddr;

/// A unit of marking work: either a whole object or a slice of an array
/// object's reference slots, so a large array can be scanned in parallel
/// without one worker owning the whole object.
#[derive(Copy, Clone, Debug)]
pub enum TaskEntry {
    Object(ObjAddr),
    Slice { base: ObjAddr, start: usize, length: usize },
}

/// One worker's local task queue plus a handle to steal from it.
pub struct LocalQueue {
    worker: Worker<TaskEntry>,
}

impl LocalQueue {
    pub fn new() -> Self {
        LocalQueue { worker: Worker::new_lifo() }
    }

    pub fn stealer(&self) -> Stealer<TaskEntry> {
        self.worker.stealer()
    }

    pub fn push(&self, entry: TaskEntry) {
        self.worker.push(entry);
    }

    pub fn pop(&self) -> Option<TaskEntry> {
        self.worker.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    pub fn len(&self) -> usize {
        self.worker.len()
    }

    /// Attempts to steal a batch of work from `victim` into this queue,
    /// returning one entry to run immediately.
    pub fn steal_from(&self, victim: &Stealer<TaskEntry>) -> Option<TaskEntry> {
        try_steal(victim, &self.worker)
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempts to steal a batch of work from `victim` into `dest`, returning
/// one entry to run immediately. Retries on `Steal::Retry` a bounded number
/// of times before giving up, matching the teacher's work-stealing retry
/// discipline.
pub fn try_steal(victim: &Stealer<TaskEntry>, dest: &Worker<TaskEntry>) -> Option<TaskEntry> {
    for _ in 0..8 {
        match victim.steal_batch_and_pop(dest) {
            Steal::Success(entry) => return Some(entry),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
    None
}

const CHUNK_CAPACITY: usize = 1024;

struct Chunk {
    entries: Vec<TaskEntry>,
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Chunk { entries: Vec::with_capacity(CHUNK_CAPACITY) })
    }
}

/// The global overflow mark stack: a growing list of fixed-size chunks.
/// Pushing reserves a slot in the current chunk via `fetch_add`; when a
/// chunk fills, a new one is appended under `grow_lock`. Capped at
/// `max_chunks`; exceeding the cap reports overflow so the marking cycle
/// can abort and restart (see `mark::do_marking_step`).
pub struct GlobalMarkStack {
    chunks: Mutex<Vec<Box<Chunk>>>,
    max_chunks: usize,
    overflowed: std::sync::atomic::AtomicBool,
}

impl GlobalMarkStack {
    pub fn new(max_chunks: usize) -> Self {
        GlobalMarkStack {
            chunks: Mutex::new(vec![Chunk::new()]),
            max_chunks,
            overflowed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Pushes a batch of entries (draining a worker's local queue to the
    /// global stack as part of load-balancing). Returns `false` if the
    /// stack cannot grow further (overflow condition).
    pub fn push_batch(&self, entries: &[TaskEntry]) -> bool {
        let mut chunks = self.chunks.lock().unwrap();
        for &entry in entries {
            let mut last = chunks.last_mut().unwrap();
            if last.entries.len() == CHUNK_CAPACITY {
                if chunks.len() >= self.max_chunks {
                    self.overflowed.store(true, Ordering::Release);
                    return false;
                }
                chunks.push(Chunk::new());
                last = chunks.last_mut().unwrap();
            }
            last.entries.push(entry);
        }
        true
    }

    /// Pops up to `max` entries for a worker to continue draining locally.
    pub fn pop_batch(&self, max: usize) -> Vec<TaskEntry> {
        let mut chunks = self.chunks.lock().unwrap();
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            let last = chunks.last_mut().unwrap();
            if let Some(entry) = last.entries.pop() {
                out.push(entry);
            } else if chunks.len() > 1 {
                chunks.pop();
            } else {
                break;
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        let chunks = self.chunks.lock().unwrap();
        chunks.len() == 1 && chunks[0].entries.is_empty()
    }

    /// Resets the stack to empty, clearing the overflow flag. Called by
    /// worker 0 between the two overflow barriers during recovery.
    pub fn reset(&self) {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.clear();
        chunks.push(Chunk::new());
        self.overflowed.store(false, Ordering::Release);
    }
}

/// A shared injector used to distribute initial root-scan work across
/// workers before any worker has populated its own local queue.
pub type RootInjector = Injector<TaskEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    fn obj(n: usize) -> TaskEntry {
        TaskEntry::Object(ObjAddr::from_addr(Addr::from_usize(n * 8)))
    }

    #[test]
    fn local_queue_push_pop() {
        let q = LocalQueue::new();
        q.push(obj(1));
        q.push(obj(2));
        assert!(matches!(q.pop(), Some(TaskEntry::Object(_))));
        assert!(matches!(q.pop(), Some(TaskEntry::Object(_))));
        assert!(q.pop().is_none());
    }

    #[test]
    fn global_stack_push_pop_batches() {
        let gs = GlobalMarkStack::new(4);
        let batch: Vec<_> = (0..10).map(obj).collect();
        assert!(gs.push_batch(&batch));
        assert!(!gs.is_empty());
        let popped = gs.pop_batch(10);
        assert_eq!(popped.len(), 10);
        assert!(gs.is_empty());
    }

    #[test]
    fn global_stack_overflows_at_cap() {
        let gs = GlobalMarkStack::new(1);
        let batch: Vec<_> = (0..(CHUNK_CAPACITY + 1)).map(obj).collect();
        assert!(!gs.push_batch(&batch));
        assert!(gs.has_overflowed());
        gs.reset();
        assert!(!gs.has_overflowed());
    }
}
