//! Global atomic counters for safepush runs.
//!
//! Counters are bumped silently at the call site. Call [`Metrics::flush`] to
//! emit the current values as one `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    predictions_submitted: AtomicU64,
    judgment_calls: AtomicU64,
    fuzz_inputs_generated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            predictions_submitted: AtomicU64::new(0),
            judgment_calls: AtomicU64::new(0),
            fuzz_inputs_generated: AtomicU64::new(0),
        }
    }

    pub fn inc_predictions(&self) {
        self.predictions_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "predictions_submitted", "counter incremented");
    }

    /// Counts every attempt, retries included.
    pub fn inc_judgment_calls(&self) {
        self.judgment_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "judgment_calls", "counter incremented");
    }

    pub fn inc_fuzz_inputs(&self) {
        self.fuzz_inputs_generated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fuzz_inputs_generated", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            predictions_submitted = self.predictions_submitted(),
            judgment_calls = self.judgment_calls(),
            fuzz_inputs_generated = self.fuzz_inputs_generated(),
        );
    }

    pub fn predictions_submitted(&self) -> u64 {
        self.predictions_submitted.load(Ordering::Relaxed)
    }

    pub fn judgment_calls(&self) -> u64 {
        self.judgment_calls.load(Ordering::Relaxed)
    }

    pub fn fuzz_inputs_generated(&self) -> u64 {
        self.fuzz_inputs_generated.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.predictions_submitted.store(0, Ordering::Relaxed);
        self.judgment_calls.store(0, Ordering::Relaxed);
        self.fuzz_inputs_generated.store(0, Ordering::Relaxed);
    }
}
