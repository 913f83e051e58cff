//! Sliding-window latency samples for percentile queries.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

/// Fixed-size ring buffer of latency samples in microseconds.
///
/// Recording is lock-free and takes `&self`; percentile queries copy the window and
/// sort it. Slot value `0` marks an empty slot, so a zero latency is stored as 1µs.
pub struct LatencyTracker {
    samples: Box<[AtomicU64]>,
    write_index: AtomicUsize,
    count: AtomicUsize,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let samples = (0..capacity).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        Self {
            samples: samples.into_boxed_slice(),
            write_index: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn record(&self, latency: Duration) {
        let micros = (latency.as_micros() as u64).max(1);
        let index = self.write_index.fetch_add(1, Ordering::Relaxed) % self.samples.len();
        let previous = self.samples[index].swap(micros, Ordering::Relaxed);
        if previous == 0 {
            self.count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                    Some(c.saturating_add(1).min(self.samples.len()))
                })
                .ok();
        }
    }

    fn snapshot(&self) -> Vec<u64> {
        self.samples.iter().map(|slot| slot.load(Ordering::Relaxed)).filter(|v| *v > 0).collect()
    }

    /// Returns `None` with no samples or a quantile outside `[0, 1]`.
    #[must_use]
    pub fn percentile(&self, quantile: f64) -> Option<Duration> {
        if !(0.0..=1.0).contains(&quantile) {
            return None;
        }
        let mut sorted = self.snapshot();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((sorted.len() as f64 - 1.0) * quantile) as usize;
        Some(Duration::from_micros(sorted[index]))
    }

    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        let samples = self.snapshot();
        if samples.is_empty() {
            return None;
        }
        let sum: u64 = samples.iter().sum();
        Some(Duration::from_micros(sum / samples.len() as u64))
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
