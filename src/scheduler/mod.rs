//! The worker pool that drives every parallel pause (evacuation, full
//! compaction) and the termination-detection protocol concurrent marking
//! shares with it.

mod monitor;
mod pool;
mod terminator;

pub use monitor::{LastParkedResult, WorkerMonitor};
pub use pool::WorkerPool;
pub use terminator::Terminator;
