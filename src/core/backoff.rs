//! Capped exponential backoff for background reconnects.
//!
//! Unlike a request retry policy there is no attempt limit: the watch loop
//! keeps trying for the life of the process and only the delay is bounded.

use std::time::Duration;

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `initial` and never exceeding `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt, advancing the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempts.min(31);
        self.attempts = self.attempts.saturating_add(1);
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let scaled = self.initial.as_millis().saturating_mul(1u128 << shift);
        let capped = scaled.min(self.max.as_millis());
        Duration::from_millis(capped.min(u128::from(u64::MAX)) as u64)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the initial delay after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn many_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(30));
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
