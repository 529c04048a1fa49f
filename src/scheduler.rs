//! One-shot timer abstraction for retry and refresh scheduling.
//!
//! Enables fast, deterministic tests without real time delays: the tap arms
//! timers through a [`Scheduler`], production uses [`TokioScheduler`], and
//! virtual-time tests drive a [`ManualScheduler`] by hand.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, EpochMillis, ManualClock};

/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an armed one-shot timer.
///
/// Cancelling is idempotent; a cancelled timer never runs its callback.
#[derive(Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Abstraction for arming one-shot timers.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Arm a timer that runs `callback` after `delay` unless cancelled.
    /// A zero delay fires as soon as the scheduler next runs.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Production scheduler backed by the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let observed = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !observed.is_cancelled() {
                callback();
            }
        });
        handle
    }
}

struct ArmedEntry {
    deadline: EpochMillis,
    handle: TimerHandle,
    callback: TimerCallback,
}

/// Test scheduler driven by a [`ManualClock`].
///
/// Armed timers accumulate until [`ManualScheduler::fire_due`] runs every
/// non-cancelled timer whose deadline has been reached.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    armed: Arc<Mutex<Vec<ArmedEntry>>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, armed: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Number of armed, not-yet-fired, not-cancelled timers.
    pub fn pending(&self) -> usize {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .count()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<EpochMillis> {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .map(|e| e.deadline)
            .min()
    }

    /// Run every due timer at the clock's current time.
    ///
    /// Callbacks run outside the internal lock, so a callback may arm new
    /// timers; timers armed during the pass wait for the next call.
    pub fn fire_due(&self) {
        let now = self.clock.now_millis();
        let mut due = {
            let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
            let mut due = Vec::new();
            let mut rest = Vec::new();
            for entry in armed.drain(..) {
                if entry.handle.is_cancelled() {
                    continue;
                }
                if entry.deadline <= now {
                    due.push(entry);
                } else {
                    rest.push(entry);
                }
            }
            *armed = rest;
            due
        };
        due.sort_by_key(|e| e.deadline);
        for entry in due {
            if !entry.handle.is_cancelled() {
                (entry.callback)();
            }
        }
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.clock.now_millis())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let deadline = self.clock.now_millis().saturating_add(delay.as_millis() as u64);
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ArmedEntry { deadline, handle: handle.clone(), callback });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = count.clone();
            move || -> TimerCallback {
                let count = count.clone();
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }
        };
        (count, make)
    }

    #[test]
    fn manual_scheduler_fires_only_due_timers() {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::new(clock.clone());
        let (count, cb) = counter();

        scheduler.schedule(Duration::from_millis(100), cb());
        scheduler.schedule(Duration::from_millis(500), cb());
        assert_eq!(scheduler.pending(), 2);

        clock.advance(100);
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1);

        clock.advance(400);
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::new(clock.clone());
        let (count, cb) = counter();

        let handle = scheduler.schedule(Duration::from_millis(10), cb());
        handle.cancel();
        handle.cancel();

        clock.advance(50);
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn zero_delay_fires_on_next_pass() {
        let clock = ManualClock::new(42);
        let scheduler = ManualScheduler::new(clock.clone());
        let (count, cb) = counter();

        scheduler.schedule(Duration::ZERO, cb());
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_arm_new_timers() {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::new(clock.clone());
        let (count, cb) = counter();

        let rearm = {
            let scheduler = scheduler.clone();
            let cb = cb();
            Box::new(move || {
                scheduler.schedule(Duration::from_millis(10), cb);
            })
        };
        scheduler.schedule(Duration::from_millis(10), rearm);

        clock.advance(10);
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        clock.advance(10);
        scheduler.fire_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_deadline_reports_earliest() {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::new(clock.clone());
        let (_, cb) = counter();

        assert_eq!(scheduler.next_deadline(), None);
        scheduler.schedule(Duration::from_millis(300), cb());
        scheduler.schedule(Duration::from_millis(100), cb());
        assert_eq!(scheduler.next_deadline(), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_after_delay() {
        let (count, cb) = counter();
        TokioScheduler.schedule(Duration::from_millis(100), cb());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_honours_cancel() {
        let (count, cb) = counter();
        let handle = TokioScheduler.schedule(Duration::from_millis(100), cb());
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
