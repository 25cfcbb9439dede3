//! A fixed-size worker pool that runs one pause's closure to completion on
//! each worker and joins before returning control to the engine.
//!
//! The teacher's own worker pool (`scheduler/worker.rs`, `scheduler/
//! scheduler.rs`) keeps workers alive for the whole process and repeatedly
//! polls a hierarchy of work buckets across many GC cycles; this crate's
//! engine instead drives one pause (mark step, evacuation, or compaction)
//! at a time from `Engine::drive`, so the pool only needs to spawn,
//! run-to-quiescence, and join for the duration of a single pause. `std::
//! thread::scope` gives this without the teacher's `Weak`/`unsafe`
//! self-referential worker-group plumbing, which existed to keep workers
//! alive across pauses.

/// Runs `body(ordinal)` on `worker_count` scoped threads, waiting for all
/// of them to finish before returning. `body` must be `Sync` across calls
/// since every worker holds the same reference.
pub struct WorkerPool {
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        WorkerPool { worker_count: worker_count.max(1) }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Runs one pause. `body(ordinal)` runs on a scoped thread per worker;
    /// the call blocks until every worker's closure returns.
    pub fn run_pause<F>(&self, body: F)
    where
        F: Fn(usize) + Sync,
    {
        std::thread::scope(|scope| {
            for ordinal in 0..self.worker_count {
                let body = &body;
                scope.spawn(move || body(ordinal));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_worker_exactly_once() {
        let pool = WorkerPool::new(4);
        let counter = AtomicUsize::new(0);
        pool.run_pause(|_ordinal| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
