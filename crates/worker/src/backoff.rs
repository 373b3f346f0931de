//! Reschedule backoff of recurring tasks.
//!
//! The delay after `n` consecutive idle runs is `base × 2^n`, clamped to the
//! ceiling. It is derived from the attempt number alone, so a reset always
//! returns to `base` and growth never depends on the previous delay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default reschedule delay.
pub const DEFAULT_BASE: Duration = Duration::from_millis(500);
/// Default upper bound of the reschedule delay.
pub const DEFAULT_CEILING: Duration = Duration::from_millis(8000);

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempt: AtomicU32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CEILING)
    }
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            attempt: AtomicU32::new(0),
        }
    }

    /// Delay for the given number of consecutive idle runs.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Current reschedule delay.
    pub fn delay(&self) -> Duration {
        self.delay_for(self.attempt.load(Ordering::SeqCst))
    }

    /// Doubles the delay (up to the ceiling) and returns the new one.
    pub fn increase(&self) -> Duration {
        let attempt = self
            .attempt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |a| {
                (self.delay_for(a) < self.ceiling).then(|| a + 1)
            })
            .map_or_else(|a| a, |a| a + 1);
        self.delay_for(attempt)
    }

    /// Back to the base delay.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
