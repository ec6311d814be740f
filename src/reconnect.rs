//! Reconnection delay policy

use std::time::Duration;

use crate::constants::{DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_MAX_MS};

/// Shortest delay handed out; a zero delay would spin the reconnect loop.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Bounded exponential backoff.
///
/// `delay(n) = min(initial * multiplier^n, max)`, where `n` counts failed
/// attempts since the last [`reset`](Self::reset).
///
/// ```
/// use asterisk_ami_tokio::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(2));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(4));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(5));
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_RECONNECT_DELAY);
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2,
            attempt: 0,
        }
    }

    /// Growth factor between attempts (minimum 1).
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(self.attempt)
            .unwrap_or(u32::MAX);
        let delay = self
            .initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self
            .attempt
            .saturating_add(1);
        delay
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        )
    }
}
