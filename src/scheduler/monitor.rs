//! Worker parking/unparking coordination, adapted from the teacher's
//! `scheduler/worker_monitor.rs`: workers park on a condvar when they run
//! out of local work, and the last worker to park gets to decide (by
//! running a caller-supplied closure while still holding the lock) whether
//! the pause is over or more work has appeared elsewhere.
//!
//! Simplified relative to the teacher: this crate has one goal per pause
//! (drain everything, then stop) rather than a queue of worker goals
//! (normal GC / stop-for-fork / ...), so there is no `WorkerGoals` request
//! queue here, only a plain "should we shut down" flag the terminator sets.

use std::sync::{Condvar, Mutex};

/// What should happen to every worker once `on_last_parked` returns.
pub enum LastParkedResult {
    /// The last parked worker should also block; nothing for anyone to do.
    ParkSelf,
    /// The last parked worker found more work (or the pause ended); it
    /// should continue running without blocking.
    WakeSelf,
    /// Wake every parked worker (a full round of work just became
    /// available, or the pause has ended and everyone should exit).
    WakeAll,
}

struct Parker {
    worker_count: usize,
    parked: usize,
}

impl Parker {
    fn inc(&mut self) -> bool {
        self.parked += 1;
        debug_assert!(self.parked <= self.worker_count);
        self.parked == self.worker_count
    }

    fn dec(&mut self) {
        debug_assert!(self.parked > 0);
        self.parked -= 1;
    }
}

/// Coordinates parking across a fixed-size worker pool for one pause at a
/// time. Reused across pauses by calling `reset` between them.
pub struct WorkerMonitor {
    parker: Mutex<Parker>,
    has_work: Condvar,
}

impl WorkerMonitor {
    pub fn new(worker_count: usize) -> Self {
        WorkerMonitor {
            parker: Mutex::new(Parker { worker_count, parked: 0 }),
            has_work: Condvar::new(),
        }
    }

    /// Wakes parked workers: `all` for a newly-opened work bucket or pause
    /// end, `false` for a single new work item.
    pub fn notify(&self, all: bool) {
        if all {
            self.has_work.notify_all();
        } else {
            self.has_work.notify_one();
        }
    }

    /// Parks the calling worker. If it is the last to park, runs
    /// `on_last_parked` while still holding the lock (so no other worker
    /// can observe a missed wakeup between the empty-queue check and the
    /// park) and acts on its verdict.
    pub fn park_and_wait(&self, on_last_parked: impl FnOnce() -> LastParkedResult) {
        let mut parker = self.parker.lock().unwrap();
        let all_parked = parker.inc();

        let mut should_wait = true;
        if all_parked {
            match on_last_parked() {
                LastParkedResult::ParkSelf => {}
                LastParkedResult::WakeSelf => should_wait = false,
                LastParkedResult::WakeAll => {
                    should_wait = false;
                    self.notify(true);
                }
            }
        }

        if should_wait {
            parker = self.has_work.wait(parker).unwrap();
        }
        parker.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn last_parked_wakes_all_exactly_once() {
        let n = 4;
        let monitor = Arc::new(WorkerMonitor::new(n));
        let last_parked_calls = AtomicUsize::new(0);
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..n {
                let monitor = monitor.clone();
                let last_parked_calls = &last_parked_calls;
                let done = &done;
                scope.spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        monitor.park_and_wait(|| {
                            last_parked_calls.fetch_add(1, Ordering::SeqCst);
                            done.store(true, Ordering::SeqCst);
                            LastParkedResult::WakeAll
                        });
                    }
                });
            }
        });

        assert_eq!(last_parked_calls.load(Ordering::SeqCst), 1);
    }
}
