//! g1core is a tracing, moving, generational, region-based garbage
//! collection engine. It implements a G1-style incremental collector —
//! young-only and mixed evacuation pauses driven by concurrent SATB
//! marking and a predicted-pause-time collection-set chooser — plus a
//! parallel full-heap sliding-compaction backstop used when evacuation
//! cannot keep up with allocation.
//!
//! This crate owns the collector's internal state (regions, mark
//! bitmaps, remembered sets, worker scheduling) and nothing else: object
//! layout, root enumeration, and reference/weak-oop processing are all
//! external-collaborator contracts in [`vm`], implemented once by
//! whatever language runtime embeds the engine. [`engine::Engine`] is the
//! single entry point a host drives: construct one with a [`config::GcConfig`]
//! and a [`vm::Collaborators`] impl, then call [`engine::Engine::drive`]
//! whenever the host wants a collection to run.

pub mod addr;
pub mod compact;
pub mod config;
pub mod cset;
pub mod engine;
pub mod error;
pub mod evac;
pub mod logger;
pub mod mark;
pub mod mark_bitmap;
pub mod queue;
pub mod region;
pub mod region_manager;
pub mod remset;
pub mod scheduler;
pub mod side_table;
pub mod stats;
pub mod vm;

#[cfg(feature = "mock_test")]
mod tests;

pub use config::GcConfig;
pub use engine::{Engine, GcCause, Phase};
pub use error::GcError;
