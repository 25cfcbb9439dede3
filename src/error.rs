//! The engine's error taxonomy.
//!
//! Only three kinds are recoverable at the phase level — `AllocationExhausted`,
//! `MarkStackOverflow`, and `EvacuationFailure` — and phase drivers match on
//! them explicitly to decide escalation (young -> mixed -> full). Every other
//! kind represents a broken invariant and is fatal: it is raised through
//! [`fatal`] rather than returned as an `Err`, so a fallible caller can never
//! accidentally swallow it.

use std::fmt;

use crate::region::RegionId;

#[derive(Debug)]
pub enum GcError {
    /// No region manager could satisfy an allocation request even after
    /// attempting to expand the committed heap.
    AllocationExhausted { words_requested: usize },
    /// The global overflow mark stack hit its configured chunk cap.
    MarkStackOverflow,
    /// A per-object copy during evacuation could not find destination space;
    /// the object was self-forwarded and the pause must run the
    /// evacuation-failure recovery path.
    EvacuationFailure { region: RegionId },
    /// The reference processor's `complete_gc` closure could not make
    /// progress because the mark stack it drives through overflowed.
    ReferenceProcessingOverflow,
    /// A broken invariant that the caller chose to surface rather than abort
    /// on (used only by validation helpers called outside a GC pause, e.g.
    /// `GcConfig::validate`).
    InvariantViolation(String),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::AllocationExhausted { words_requested } => {
                write!(f, "allocation exhausted: {words_requested} words requested")
            }
            GcError::MarkStackOverflow => write!(f, "global mark stack overflow"),
            GcError::EvacuationFailure { region } => {
                write!(f, "evacuation failure in region {region:?}")
            }
            GcError::ReferenceProcessingOverflow => {
                write!(f, "reference processing overflow")
            }
            GcError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for GcError {}

/// Aborts the process after logging the current phase, a caller-supplied
/// diagnostic message, and the tail of the recent-event log.
///
/// Mirrors `SafepointTimeout` / `InvariantViolation` from the error
/// taxonomy: these are not modeled as `Result::Err` because no caller in
/// this engine is prepared to recover from them, and a silently-swallowed
/// invariant violation is worse than a crash.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!(target: "g1core::fatal", "{msg}");
        for event in $crate::stats::recent_events() {
            log::error!(target: "g1core::fatal", "  recent event: {event}");
        }
        if cfg!(any(debug_assertions, feature = "extreme_assertions")) {
            std::process::abort();
        } else {
            panic!("{msg}");
        }
    }};
}
