//! Retry configuration and exponential backoff math.
//!
//! The delay for an attempt is
//! `min(max_delay, initial_delay * backoff_multiplier ^ attempt)`, where
//! `attempt` is the destination's retry counter at schedule time. The
//! counter is incremented when the retry is scheduled, so the stored value
//! always reflects the next attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::jitter::Jitter;

/// Retry policy for failed fetches.
#[derive(Clone)]
pub struct RetryConfig<E> {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> RetryConfig<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries.
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether an error is worth retrying. Defaults to
    /// retrying everything.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn should_retry(&self, error: &E) -> bool {
        (self.retry_on)(error)
    }

    /// Exact backoff delay for the given attempt number (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis() as f64;
        let max = self.max_delay.as_millis() as f64;
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(1_000) as i32);
        let capped = (initial * factor).min(max);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay with the configured jitter applied.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.delay_for(attempt))
    }
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: Jitter::None,
            retry_on: Arc::new(|_| true),
        }
    }
}

impl<E> fmt::Debug for RetryConfig<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn config() -> RetryConfig<io::Error> {
        RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_backoff_multiplier(2.0)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = config();
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = config();
        assert_eq!(config.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(30), Duration::from_millis(1_000));
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let config = config();
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let config = config().with_backoff_multiplier(0.5);
        assert_eq!(config.delay_for(3), Duration::from_millis(100));
    }

    #[test]
    fn default_predicate_retries_everything() {
        let config: RetryConfig<io::Error> = RetryConfig::new();
        assert!(config.should_retry(&io::Error::new(io::ErrorKind::Other, "x")));
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.delay_for(0), Duration::from_millis(1_000));
    }

    #[test]
    fn custom_predicate_filters_errors() {
        let config = config()
            .retry_on(|e: &io::Error| e.kind() == io::ErrorKind::TimedOut);
        assert!(config.should_retry(&io::Error::new(io::ErrorKind::TimedOut, "slow")));
        assert!(!config.should_retry(&io::Error::new(io::ErrorKind::PermissionDenied, "no")));
    }

    #[test]
    fn disabled_policy_has_no_budget() {
        let config: RetryConfig<io::Error> = RetryConfig::disabled();
        assert_eq!(config.max_retries(), 0);
    }
}
