//! Bounded transition history for debuggability.
//!
//! Every transition appends an entry describing the state being left, the
//! key at that moment, and a reason tag. The internal buffer is a mutable
//! ring for amortised O(1) push/evict; the published view is a shared frozen
//! slice rebuilt lazily.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::clock::EpochMillis;
use crate::state::{RequestKey, RequestState};

/// Why a transition (or notable non-transition event) happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionReason {
    Initial,
    RequestInitiated,
    CacheHit,
    FetchSuccess,
    FetchError,
    RetryScheduled,
    RetryExecuted,
    RefreshInitiated,
    RefreshSuccess,
    RefreshError,
    ListenerUnsubscribed,
    ManualReset,
    ManualRetry,
    ManualRefresh,
    TtlRefreshScheduled,
    TtlRefreshExecuted,
    RequestKeyChanged,
    RequestKeyChangedAborted,
    ConcurrentRequestAborted,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionReason::Initial => "initial",
            TransitionReason::RequestInitiated => "request_initiated",
            TransitionReason::CacheHit => "cache_hit",
            TransitionReason::FetchSuccess => "fetch_success",
            TransitionReason::FetchError => "fetch_error",
            TransitionReason::RetryScheduled => "retry_scheduled",
            TransitionReason::RetryExecuted => "retry_executed",
            TransitionReason::RefreshInitiated => "refresh_initiated",
            TransitionReason::RefreshSuccess => "refresh_success",
            TransitionReason::RefreshError => "refresh_error",
            TransitionReason::ListenerUnsubscribed => "listener_unsubscribed",
            TransitionReason::ManualReset => "manual_reset",
            TransitionReason::ManualRetry => "manual_retry",
            TransitionReason::ManualRefresh => "manual_refresh",
            TransitionReason::TtlRefreshScheduled => "ttl_refresh_scheduled",
            TransitionReason::TtlRefreshExecuted => "ttl_refresh_executed",
            TransitionReason::RequestKeyChanged => "request_key_changed",
            TransitionReason::RequestKeyChangedAborted => "request_key_changed_aborted",
            TransitionReason::ConcurrentRequestAborted => "concurrent_request_aborted",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition: the state being left, when, under which key,
/// and why.
pub struct HistoryEntry<E> {
    pub state: RequestState<E>,
    pub timestamp: EpochMillis,
    pub request_key: Option<RequestKey>,
    pub reason: TransitionReason,
}

impl<E> Clone for HistoryEntry<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            timestamp: self.timestamp,
            request_key: self.request_key.clone(),
            reason: self.reason,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for HistoryEntry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryEntry")
            .field("state", &self.state.kind())
            .field("timestamp", &self.timestamp)
            .field("request_key", &self.request_key)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Bounded append-only ring of transitions. Capacity 0 disables recording
/// entirely; nothing is allocated in that case.
pub struct HistoryRing<E> {
    entries: VecDeque<HistoryEntry<E>>,
    capacity: usize,
    frozen: Option<Arc<[HistoryEntry<E>]>>,
}

impl<E> HistoryRing<E> {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), capacity, frozen: None }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry<E>> {
        self.entries.back()
    }

    /// Append an entry, evicting the oldest at capacity.
    pub fn push(&mut self, entry: HistoryEntry<E>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.frozen = None;
    }

    /// Drop every entry. Only `reset()` goes through here.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.frozen = None;
    }

    /// Shared frozen view of the current contents. Reuses the previous
    /// allocation until the ring changes.
    pub fn snapshot(&mut self) -> Arc<[HistoryEntry<E>]> {
        if let Some(frozen) = &self.frozen {
            return Arc::clone(frozen);
        }
        let frozen: Arc<[HistoryEntry<E>]> =
            self.entries.iter().cloned().collect::<Vec<_>>().into();
        self.frozen = Some(Arc::clone(&frozen));
        frozen
    }
}

impl<E: fmt::Debug> fmt::Debug for HistoryRing<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryRing")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
