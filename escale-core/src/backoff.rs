//! Exponential back-off with jitter.

use std::time::Duration;

use rand::Rng;

/// Per-path back-off state for `Busy` and transient relay errors.
///
/// Delays follow `2^attempt` seconds capped at the maximum, plus up to
/// five seconds of random jitter so contending clients desynchronize.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempt: u32,
}

/// Cap on the exponential component.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Upper bound of the random jitter added to every delay.
const JITTER_MS: u64 = 5000;

impl Backoff {
    /// Fresh state: the first failure yields the base delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exp_secs = 2u64
            .saturating_pow(self.attempt.min(16))
            .min(MAX_DELAY.as_secs());
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MS));
        Duration::from_secs(exp_secs) + jitter
    }

    /// Number of consecutive failures recorded.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Clear the state after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
