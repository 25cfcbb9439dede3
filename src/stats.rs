//! Per-pause phase timing and a small ring buffer of recent events used by
//! [`crate::fatal`] to print a dump of "what just happened" before aborting.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RECENT_EVENTS_CAP: usize = 64;

lazy_static::lazy_static! {
    static ref RECENT_EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::with_capacity(RECENT_EVENTS_CAP));
}

/// Records an event for the fatal-dump ring buffer. Cheap enough to call at
/// every phase transition; does not itself go through `log` (callers should
/// also `log::info!` the same fact if it's pause-boundary-worthy, per the
/// observability contract).
pub fn record_event(event: impl Into<String>) {
    let mut buf = RECENT_EVENTS.lock().unwrap();
    if buf.len() == RECENT_EVENTS_CAP {
        buf.remove(0);
    }
    buf.push(event.into());
}

/// Snapshot of the recent-event ring buffer, oldest first.
pub fn recent_events() -> Vec<String> {
    RECENT_EVENTS.lock().unwrap().clone()
}

/// A single named timing measurement within a pause.
#[derive(Clone, Copy, Debug)]
pub struct PhaseTiming {
    pub name: &'static str,
    pub duration: Duration,
}

/// Accumulates timings for one pause (or one full-GC invocation) and logs a
/// summary line at `Info` level when dropped... actually logged explicitly
/// via [`PhaseTimes::log_summary`] so call sites control exactly when it's
/// emitted relative to other pause-end bookkeeping.
#[derive(Default)]
pub struct PhaseTimes {
    entries: Vec<PhaseTiming>,
}

impl PhaseTimes {
    pub fn new() -> Self {
        PhaseTimes::default()
    }

    pub fn record(&mut self, name: &'static str, duration: Duration) {
        self.entries.push(PhaseTiming { name, duration });
    }

    /// Times `f` and records its duration under `name`.
    pub fn timed<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().map(|e| e.duration).sum()
    }

    pub fn log_summary(&self, target: &str, pause_kind: &str) {
        let total = self.total();
        log::info!(target: "g1core::stats", "[{target}] {pause_kind} pause: total={total:?}");
        for entry in &self.entries {
            log::debug!(target: "g1core::stats", "[{target}]   {}={:?}", entry.name, entry.duration);
        }
        record_event(format!("{pause_kind} pause total={total:?}"));
    }
}

impl fmt::Debug for PhaseTimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| (e.name, e.duration))).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_sums() {
        let mut pt = PhaseTimes::new();
        pt.record("a", Duration::from_millis(5));
        pt.record("b", Duration::from_millis(7));
        assert_eq!(pt.total(), Duration::from_millis(12));
    }

    #[test]
    fn recent_events_ring_buffer_caps() {
        for i in 0..(RECENT_EVENTS_CAP + 10) {
            record_event(format!("event {i}"));
        }
        assert!(recent_events().len() <= RECENT_EVENTS_CAP);
    }
}
