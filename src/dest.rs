//! Per-destination request records.

use std::sync::Weak;

use crate::cancel::CancelToken;
use crate::clock::EpochMillis;
use crate::context::{Context, ContextRef};
use crate::history::{HistoryEntry, HistoryRing, TransitionReason};
use crate::scheduler::TimerHandle;
use crate::state::{RequestKey, RequestState};

/// An armed one-shot timer owned by a destination.
///
/// `gen` is compared when the timer fires: a fire whose generation no longer
/// matches the slot lost a race with cancellation and is ignored.
pub(crate) struct ArmedTimer {
    pub handle: TimerHandle,
    pub gen: u64,
}

impl ArmedTimer {
    fn cancel(&self) {
        self.handle.cancel();
    }
}

/// State record for one destination context.
///
/// Created lazily on first connect, survives request-key changes, torn down
/// on tap detach. Holds the destination weakly so a destination dropped
/// without an explicit disconnect does not leak.
pub(crate) struct DestState<E> {
    pub context: Weak<Context>,
    pub state: RequestState<E>,
    pub request_key: Option<RequestKey>,
    /// Output-grip subscribers only; state and controller grips don't count.
    pub listener_count: usize,
    pub retry_attempt: u32,
    pub retry_timer: Option<ArmedTimer>,
    pub refresh_timer: Option<ArmedTimer>,
    pub abort_handle: Option<CancelToken>,
    pub history: HistoryRing<E>,
    pub controller_live: bool,
    /// Monotonic sequence for latest-only completion routing.
    pub inflight_seq: u64,
    pub timer_gen: u64,
}

impl<E> DestState<E> {
    pub fn new(context: &ContextRef, history_size: usize) -> Self {
        Self {
            context: std::sync::Arc::downgrade(context),
            state: RequestState::Idle,
            request_key: None,
            listener_count: 0,
            retry_attempt: 0,
            retry_timer: None,
            refresh_timer: None,
            abort_handle: None,
            history: HistoryRing::new(history_size),
            controller_live: false,
            inflight_seq: 0,
            timer_gen: 0,
        }
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count > 0
    }

    /// Cancel both timers. Returns whether any timer was actually armed.
    pub fn cancel_timers(&mut self) -> bool {
        let mut cancelled = false;
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
            cancelled = true;
        }
        if let Some(timer) = self.refresh_timer.take() {
            timer.cancel();
            cancelled = true;
        }
        cancelled
    }

    /// Abort the in-flight request, if any. Returns whether one existed.
    pub fn abort_inflight(&mut self) -> bool {
        match self.abort_handle.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn next_timer_gen(&mut self) -> u64 {
        self.timer_gen += 1;
        self.timer_gen
    }

    pub fn next_inflight_seq(&mut self) -> u64 {
        self.inflight_seq += 1;
        self.inflight_seq
    }

    /// Record an event without changing the current state. Deduplicates
    /// against the most recent entry's reason.
    pub fn note(&mut self, timestamp: EpochMillis, reason: TransitionReason) {
        if self.history.last().map(|e| e.reason) == Some(reason) {
            return;
        }
        let entry = HistoryEntry {
            state: self.state.clone(),
            timestamp,
            request_key: self.request_key.clone(),
            reason,
        };
        self.history.push(entry);
    }

    /// Record the transition out of the current state and install the next.
    pub fn transition(
        &mut self,
        next: RequestState<E>,
        timestamp: EpochMillis,
        reason: TransitionReason,
    ) {
        let previous = std::mem::replace(&mut self.state, next);
        self.history.push(HistoryEntry {
            state: previous,
            timestamp,
            request_key: self.request_key.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::state::StateKind;
    use std::io;

    fn dest() -> DestState<io::Error> {
        DestState::new(&Context::root(), 10)
    }

    #[test]
    fn new_dest_is_idle_and_unobserved() {
        let dest = dest();
        assert_eq!(dest.state.kind(), StateKind::Idle);
        assert!(!dest.has_listeners());
        assert_eq!(dest.request_key, None);
        assert!(dest.history.is_empty());
    }

    #[test]
    fn transition_records_the_state_being_left() {
        let mut dest = dest();
        dest.transition(
            RequestState::Loading { initiated_at: 5, retry_at: None },
            5,
            TransitionReason::RequestInitiated,
        );
        assert_eq!(dest.state.kind(), StateKind::Loading);
        let last = dest.history.last().expect("entry");
        assert_eq!(last.state.kind(), StateKind::Idle);
        assert_eq!(last.reason, TransitionReason::RequestInitiated);
        assert_eq!(last.timestamp, 5);
    }

    #[test]
    fn note_deduplicates_consecutive_reasons() {
        let mut dest = dest();
        dest.note(10, TransitionReason::ListenerUnsubscribed);
        dest.note(20, TransitionReason::ListenerUnsubscribed);
        assert_eq!(dest.history.len(), 1);
        dest.note(30, TransitionReason::ConcurrentRequestAborted);
        assert_eq!(dest.history.len(), 2);
    }

    #[test]
    fn cancel_timers_reports_whether_any_were_armed() {
        let mut dest = dest();
        assert!(!dest.cancel_timers());

        let handle = TimerHandle::new();
        dest.retry_timer = Some(ArmedTimer { handle: handle.clone(), gen: 1 });
        assert!(dest.cancel_timers());
        assert!(handle.is_cancelled());
        assert!(dest.retry_timer.is_none());
    }

    #[test]
    fn abort_inflight_cancels_the_token() {
        let mut dest = dest();
        assert!(!dest.abort_inflight());

        let token = CancelToken::new();
        dest.abort_handle = Some(token.clone());
        assert!(dest.abort_inflight());
        assert!(token.is_cancelled());
        assert!(dest.abort_handle.is_none());
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut dest = dest();
        assert_eq!(dest.next_inflight_seq(), 1);
        assert_eq!(dest.next_inflight_seq(), 2);
        assert_eq!(dest.next_timer_gen(), 1);
        assert_eq!(dest.next_timer_gen(), 2);
    }
}
