//! Observability counters for the fixpoint (§7, ambient addition).
//!
//! Never part of the lattice: nothing here feeds back into a [`crate::model::Model`]
//! or changes a transfer function's result. Plain atomics so the parallel
//! worker pool can bump them without a lock, mirroring how the rest of the
//! crate keeps shared, read-mostly state lock-free (`interning`'s append-only
//! factories, the `dashmap`-backed model registry).

use std::sync::atomic::{AtomicU64, Ordering};

/// Budget-exhaustion and resolution-miss counters accumulated over one
/// fixpoint run. Exposed so a caller can decide whether an incomplete
/// result is acceptable, per §7's "a warning counter is exposed" policy.
#[derive(Default)]
pub struct Statistics {
    sweeps_run: AtomicU64,
    methods_reanalyzed: AtomicU64,
    resolution_misses: AtomicU64,
    iteration_cap_hits: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics::default()
    }

    pub fn record_sweep(&self) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_method_reanalyzed(&self) {
        self.methods_reanalyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution_miss(&self) {
        self.resolution_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_iteration_cap_hit(&self) {
        self.iteration_cap_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweeps_run(&self) -> u64 {
        self.sweeps_run.load(Ordering::Relaxed)
    }

    pub fn methods_reanalyzed(&self) -> u64 {
        self.methods_reanalyzed.load(Ordering::Relaxed)
    }

    pub fn resolution_misses(&self) -> u64 {
        self.resolution_misses.load(Ordering::Relaxed)
    }

    pub fn iteration_cap_hits(&self) -> u64 {
        self.iteration_cap_hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = Statistics::new();
        assert_eq!(stats.resolution_misses(), 0);
        stats.record_resolution_miss();
        stats.record_resolution_miss();
        assert_eq!(stats.resolution_misses(), 2);
    }
}
