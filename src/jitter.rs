//! Jitter strategies for retry delays.
//!
//! Spreads scheduled retries so many destinations failing together do not
//! refetch in lockstep. The default for async taps is [`Jitter::None`],
//! which keeps published `retry_at` timestamps exact.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    #[default]
    None,
    /// Random delay between 0 and the backoff delay.
    Full,
    /// Random delay between half the backoff delay and the full delay.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply with a caller-supplied RNG, for deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => {
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_keeps_the_delay() {
        let delay = Duration::from_millis(250);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn full_stays_within_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..64 {
            let jittered = Jitter::Full.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn equal_stays_in_upper_half() {
        let delay = Duration::from_millis(100);
        for _ in 0..64 {
            let jittered = Jitter::Equal.apply(delay);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }
}
