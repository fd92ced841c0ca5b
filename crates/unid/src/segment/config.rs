use core::time::Duration;

use crate::{Error, Result, RetryPolicy};

/// Tuning for [`SegmentAllocator`](crate::SegmentAllocator).
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentConfig {
    /// Step used for the first segment of every key.
    pub default_step: u64,
    /// Lower bound when the step shrinks.
    pub min_step: u64,
    /// Upper bound when the step grows.
    pub max_step: u64,
    /// Fraction of the current segment consumed before the idle one is
    /// prefetched, in `(0, 1]`.
    pub low_water: f64,
    /// Desired time between refills of one key. Faster consumption doubles
    /// the step, consumption slower than twice this halves it.
    pub target_refill_interval: Duration,
    /// How long a caller waits on an in-flight refill when both segments are
    /// empty before failing with
    /// [`SegmentExhausted`](crate::Error::SegmentExhausted).
    pub exhausted_wait: Duration,
    /// Backoff for failing range store calls.
    pub retry: RetryPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            default_step: 1_000,
            min_step: 1_000,
            max_step: 1_000_000,
            low_water: 0.9,
            target_refill_interval: Duration::from_secs(15 * 60),
            exhausted_wait: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl SegmentConfig {
    /// A fixed-step configuration; the step never adapts.
    pub fn fixed_step(step: u64) -> Self {
        Self {
            default_step: step,
            min_step: step,
            max_step: step,
            ..Self::default()
        }
    }

    /// Checks the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.min_step == 0 {
            return Err(Error::invalid_config("segment min_step must be positive"));
        }
        if !(self.min_step <= self.default_step && self.default_step <= self.max_step) {
            return Err(Error::invalid_config(format!(
                "segment steps must satisfy min ({}) <= default ({}) <= max ({})",
                self.min_step, self.default_step, self.max_step
            )));
        }
        if !(self.low_water > 0.0 && self.low_water <= 1.0) {
            return Err(Error::invalid_config(format!(
                "segment low_water {} must be in (0, 1]",
                self.low_water
            )));
        }
        if self.retry.attempts == 0 {
            return Err(Error::invalid_config("retry attempts must be at least 1"));
        }
        Ok(())
    }

    /// Step for the next refill, given how long ago the previous refill of
    /// the same key happened.
    pub fn adapt_step(&self, current: u64, since_last_refill: Option<Duration>) -> u64 {
        let Some(elapsed) = since_last_refill else {
            return current.clamp(self.min_step, self.max_step);
        };
        let next = if elapsed < self.target_refill_interval {
            current.saturating_mul(2)
        } else if elapsed >= self.target_refill_interval.saturating_mul(2) {
            current / 2
        } else {
            current
        };
        next.clamp(self.min_step, self.max_step)
    }
}

/// Number of IDs of a `step`-sized segment handed out before the idle
/// segment is prefetched.
pub(crate) fn refill_threshold(step: u64, low_water: f64) -> u64 {
    ((step as f64 * low_water) as u64).clamp(1, step.max(1))
}
