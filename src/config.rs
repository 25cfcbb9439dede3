//! Engine-wide tunables.
//!
//! There is deliberately no CLI or environment-variable parsing here: this
//! crate treats configuration plumbing as an external collaborator's job
//! (see the crate's module docs). A host embeds this engine by constructing
//! a [`GcConfig`] programmatically and passing it to `Heap::new`.

/// Number of heap words per region. Must be a power of two.
pub const DEFAULT_GRAIN_WORDS: usize = 1 << 17; // 1 MiB regions on a 64-bit word

#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Words per region; must be a power of two.
    pub grain_words: usize,
    /// Maximum number of regions the heap can grow to.
    pub max_regions: usize,
    /// A region is not a mixed-GC candidate if its live bytes are at or
    /// above this percentage of the region's capacity.
    pub live_threshold_percent: u8,
    /// Minimum number of old regions to keep as candidates regardless of
    /// waste pruning, so mixed GC always makes forward progress.
    pub min_old_cset_length: usize,
    /// Upper bound, in bytes, on reclaimable bytes discarded while pruning
    /// low-efficiency candidates from the chooser.
    pub allowed_waste: usize,
    /// Soft pause-time goal in milliseconds; used to bound the mixed-GC
    /// increment and optional rounds.
    pub pause_time_goal_ms: u64,
    /// Number of GC worker threads. `0` means "use available parallelism".
    pub num_workers: usize,
    /// Dead-space budget (percent of old-gen capacity) used to choose the
    /// dense prefix during full compaction.
    pub mark_sweep_dead_ratio: u8,
    /// Maximum number of chunks the global overflow mark stack may grow to
    /// before a marking cycle is aborted and restarted.
    pub max_mark_stack_chunks: usize,
    /// Age (in survivor copies) at which a young object is tenured into Old.
    pub tenure_threshold: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            grain_words: DEFAULT_GRAIN_WORDS,
            max_regions: 4096,
            live_threshold_percent: 85,
            min_old_cset_length: 1,
            allowed_waste: 64 * 1024 * 1024,
            pause_time_goal_ms: 200,
            num_workers: 0,
            mark_sweep_dead_ratio: 15,
            max_mark_stack_chunks: 1 << 14,
            tenure_threshold: 15,
        }
    }
}

impl GcConfig {
    pub fn with_grain_words(mut self, words: usize) -> Self {
        self.grain_words = words;
        self
    }

    pub fn with_max_regions(mut self, n: usize) -> Self {
        self.max_regions = n;
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_pause_time_goal_ms(mut self, ms: u64) -> Self {
        self.pause_time_goal_ms = ms;
        self
    }

    /// Resolve `num_workers == 0` into the host's available parallelism.
    pub fn resolved_num_workers(&self) -> usize {
        if self.num_workers == 0 {
            if cfg!(feature = "single_worker") {
                1
            } else {
                num_cpus::get().max(1)
            }
        } else {
            self.num_workers
        }
    }

    /// Validates invariants that must hold before a `Heap` can be built.
    /// Called once, at `Heap::new`.
    pub fn validate(&self) -> Result<(), crate::error::GcError> {
        if !self.grain_words.is_power_of_two() {
            return Err(crate::error::GcError::InvariantViolation(format!(
                "grain_words {} is not a power of two",
                self.grain_words
            )));
        }
        if self.max_regions == 0 {
            return Err(crate::error::GcError::InvariantViolation(
                "max_regions must be nonzero".into(),
            ));
        }
        if self.live_threshold_percent > 100 || self.mark_sweep_dead_ratio > 100 {
            return Err(crate::error::GcError::InvariantViolation(
                "percentage tunable out of range 0..=100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_grain() {
        let cfg = GcConfig::default().with_grain_words(3);
        assert!(cfg.validate().is_err());
    }
}
