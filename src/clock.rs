//! Clock abstractions used by the request runner and schedulers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Clock abstraction so request timing can be faked in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> EpochMillis;
}

/// Wall clock backed by `SystemTime::now()`.
///
/// `retry_at` values published in request states are wall-clock timestamps,
/// so the production clock reads epoch time rather than a monotonic source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> EpochMillis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self { now: Arc::new(AtomicU64::new(start)) }
    }

    /// Jump the clock to an absolute timestamp.
    pub fn set(&self, now: EpochMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}
