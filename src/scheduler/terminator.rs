//! Termination detection for a pool of workers draining a shared pool of
//! work (local queues plus one global overflow structure): a worker that
//! runs dry parks; once every worker is parked, the last one to park
//! re-checks whether work reappeared anywhere (another worker's local
//! queue, the global overflow stack) before declaring the pause finished.
//! Built on `WorkerMonitor`'s single-last-parked-decides protocol, the same
//! one the teacher's scheduler uses for its own work-bucket draining.

use std::sync::atomic::{AtomicBool, Ordering};

use super::monitor::{LastParkedResult, WorkerMonitor};

pub struct Terminator {
    monitor: WorkerMonitor,
    done: AtomicBool,
}

impl Terminator {
    pub fn new(worker_count: usize) -> Self {
        Terminator { monitor: WorkerMonitor::new(worker_count), done: AtomicBool::new(false) }
    }

    /// Called by a worker whose local queue just went empty. `has_work`
    /// reports whether *any* worker (not just the caller) currently has
    /// runnable work, checked only by the last parked worker. Returns
    /// `true` once every worker has independently observed no work
    /// anywhere — the caller should stop polling and exit its drain loop.
    pub fn try_terminate(&self, has_work: impl Fn() -> bool) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        self.monitor.park_and_wait(|| {
            if has_work() {
                LastParkedResult::WakeAll
            } else {
                self.done.store(true, Ordering::Release);
                LastParkedResult::WakeAll
            }
        });
        self.done.load(Ordering::Acquire)
    }

    /// Wakes every worker immediately — used when a producer (e.g. a
    /// mutator thread enqueuing a root) adds work after some workers have
    /// already parked for this pause.
    pub fn notify_work_available(&self) {
        self.monitor.notify(true);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn all_workers_terminate_when_queue_drains() {
        let n = 4;
        let remaining = Arc::new(AtomicUsize::new(10));
        let term = Arc::new(Terminator::new(n));

        std::thread::scope(|scope| {
            for _ in 0..n {
                let remaining = remaining.clone();
                let term = term.clone();
                scope.spawn(move || loop {
                    if remaining.load(Ordering::SeqCst) > 0 {
                        remaining.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    if term.try_terminate(|| remaining.load(Ordering::SeqCst) > 0) {
                        break;
                    }
                });
            }
        });

        assert!(term.is_done());
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }
}
