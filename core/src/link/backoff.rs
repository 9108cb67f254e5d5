//! Reconnect backoff
//!
//! Exponential: base, 2x base, 4x base, ... capped. Each delay is jittered
//! into `[d/2, d]` so several bridges restarting together do not hammer a
//! shared endpoint in lockstep.

use std::time::Duration;

use rand::Rng;

/// Default first delay after a failed connect
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Default upper bound on any delay
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Capped exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    /// Consecutive failures since the last reset
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered delay for the current attempt
    pub fn ceiling(&self) -> Duration {
        // 2^20 * base overflows any sane cap; stop doubling there
        let factor = 1u32 << self.attempts.min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Record a failure and return how long to wait before the next try
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempts = self.attempts.saturating_add(1);

        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    /// Link came up; start over from the base delay
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        let mut ceilings = Vec::new();
        for _ in 0..6 {
            ceilings.push(backoff.ceiling().as_secs());
            backoff.next_delay();
        }
        assert_eq!(ceilings, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::default();
        for _ in 0..50 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay();
            assert!(delay >= ceiling / 2, "{:?} below {:?}", delay, ceiling / 2);
            assert!(delay <= ceiling);
            assert!(delay <= DEFAULT_BACKOFF_CAP);
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.ceiling(), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let mut backoff = Backoff::default();
        for _ in 0..1000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), DEFAULT_BACKOFF_CAP);
    }
}
