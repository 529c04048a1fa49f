//! Request lifecycle states and the published snapshot.
//!
//! A [`RequestState`] is a closed set of six variants. Every transition
//! yields a new value; existing references are never mutated. The data
//! itself travels on the tap's output grips, never inside the state, so
//! status consumers and data consumers stay decoupled.

use std::fmt;
use std::sync::Arc;

use crate::clock::EpochMillis;
use crate::history::HistoryEntry;

/// Fingerprint string derived from destination parameters; the cache and
/// deduplication axis.
pub type RequestKey = Arc<str>;

/// Lifecycle state of one destination's request.
///
/// `retry_at` is a future wall-clock time at which a retry or refresh is
/// scheduled; `None` when nothing is pending. `Idle` carries no `retry_at`
/// by construction: an idle destination never has scheduled work.
pub enum RequestState<E> {
    Idle,
    Loading {
        initiated_at: EpochMillis,
        retry_at: Option<EpochMillis>,
    },
    Success {
        retrieved_at: EpochMillis,
        retry_at: Option<EpochMillis>,
    },
    Error {
        error: Arc<E>,
        failed_at: EpochMillis,
        retry_at: Option<EpochMillis>,
    },
    StaleWhileRevalidate {
        retrieved_at: EpochMillis,
        refresh_initiated_at: EpochMillis,
        retry_at: Option<EpochMillis>,
    },
    StaleWithError {
        retrieved_at: EpochMillis,
        error: Arc<E>,
        failed_at: EpochMillis,
        retry_at: Option<EpochMillis>,
    },
}

/// Discriminant of a [`RequestState`], for matching and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Idle,
    Loading,
    Success,
    Error,
    StaleWhileRevalidate,
    StaleWithError,
}

impl StateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Idle => "idle",
            StateKind::Loading => "loading",
            StateKind::Success => "success",
            StateKind::Error => "error",
            StateKind::StaleWhileRevalidate => "stale-while-revalidate",
            StateKind::StaleWithError => "stale-with-error",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<E> RequestState<E> {
    pub fn kind(&self) -> StateKind {
        match self {
            RequestState::Idle => StateKind::Idle,
            RequestState::Loading { .. } => StateKind::Loading,
            RequestState::Success { .. } => StateKind::Success,
            RequestState::Error { .. } => StateKind::Error,
            RequestState::StaleWhileRevalidate { .. } => StateKind::StaleWhileRevalidate,
            RequestState::StaleWithError { .. } => StateKind::StaleWithError,
        }
    }

    /// Data is available on the output grips (possibly stale).
    pub fn has_data(&self) -> bool {
        matches!(
            self,
            RequestState::Success { .. }
                | RequestState::StaleWhileRevalidate { .. }
                | RequestState::StaleWithError { .. }
        )
    }

    /// Available data is known to be stale.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            RequestState::StaleWhileRevalidate { .. } | RequestState::StaleWithError { .. }
        )
    }

    /// A fetch is in flight (with or without data to show meanwhile).
    pub fn is_refreshing(&self) -> bool {
        matches!(
            self,
            RequestState::Loading { .. } | RequestState::StaleWhileRevalidate { .. }
        )
    }

    /// A fetch is in flight and stale data is being served meanwhile.
    pub fn is_refreshing_with_data(&self) -> bool {
        matches!(self, RequestState::StaleWhileRevalidate { .. })
    }

    /// A fetch is in flight and no data is available. If cached data exists
    /// for the current key the state is never `Loading`.
    pub fn is_loading(&self) -> bool {
        matches!(self, RequestState::Loading { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RequestState::Idle)
    }

    pub fn has_error(&self) -> bool {
        matches!(self, RequestState::Error { .. } | RequestState::StaleWithError { .. })
    }

    pub fn error(&self) -> Option<&Arc<E>> {
        match self {
            RequestState::Error { error, .. } | RequestState::StaleWithError { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Timestamp of the data currently on the output grips, if any.
    pub fn data_retrieved_at(&self) -> Option<EpochMillis> {
        match self {
            RequestState::Success { retrieved_at, .. }
            | RequestState::StaleWhileRevalidate { retrieved_at, .. }
            | RequestState::StaleWithError { retrieved_at, .. } => Some(*retrieved_at),
            _ => None,
        }
    }

    /// When the in-flight request started, if one is in flight.
    pub fn request_initiated_at(&self) -> Option<EpochMillis> {
        match self {
            RequestState::Loading { initiated_at, .. } => Some(*initiated_at),
            RequestState::StaleWhileRevalidate { refresh_initiated_at, .. } => {
                Some(*refresh_initiated_at)
            }
            _ => None,
        }
    }

    pub fn error_failed_at(&self) -> Option<EpochMillis> {
        match self {
            RequestState::Error { failed_at, .. }
            | RequestState::StaleWithError { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }

    pub fn retry_at(&self) -> Option<EpochMillis> {
        match self {
            RequestState::Idle => None,
            RequestState::Loading { retry_at, .. }
            | RequestState::Success { retry_at, .. }
            | RequestState::Error { retry_at, .. }
            | RequestState::StaleWhileRevalidate { retry_at, .. }
            | RequestState::StaleWithError { retry_at, .. } => *retry_at,
        }
    }

    /// Copy of this state with `retry_at` replaced. A no-op on `Idle`.
    pub fn with_retry_at(&self, retry_at: Option<EpochMillis>) -> Self {
        let mut next = self.clone();
        match &mut next {
            RequestState::Idle => {}
            RequestState::Loading { retry_at: slot, .. }
            | RequestState::Success { retry_at: slot, .. }
            | RequestState::Error { retry_at: slot, .. }
            | RequestState::StaleWhileRevalidate { retry_at: slot, .. }
            | RequestState::StaleWithError { retry_at: slot, .. } => *slot = retry_at,
        }
        next
    }

    /// Whether a retry or refresh is scheduled for a future instant.
    pub fn has_scheduled_retry(&self, now: EpochMillis) -> bool {
        self.retry_at().map(|at| at > now).unwrap_or(false)
    }

    /// Milliseconds until the scheduled retry, clamped at zero; `None` when
    /// nothing is scheduled.
    pub fn retry_time_remaining(&self, now: EpochMillis) -> Option<u64> {
        self.retry_at().map(|at| at.saturating_sub(now))
    }
}

impl<E: fmt::Display> RequestState<E> {
    /// Human-readable status line for the current variant.
    pub fn status_message(&self) -> String {
        match self {
            RequestState::Idle => "no request made".to_string(),
            RequestState::Loading { .. } => "loading".to_string(),
            RequestState::Success { .. } => "data loaded".to_string(),
            RequestState::Error { error, retry_at, .. } => match retry_at {
                Some(_) => format!("request failed: {error} (retry scheduled)"),
                None => format!("request failed: {error}"),
            },
            RequestState::StaleWhileRevalidate { .. } => "refreshing data".to_string(),
            RequestState::StaleWithError { error, retry_at, .. } => match retry_at {
                Some(_) => format!("refresh failed: {error} (serving stale data, retry scheduled)"),
                None => format!("refresh failed: {error} (serving stale data)"),
            },
        }
    }
}

impl<E> Clone for RequestState<E> {
    fn clone(&self) -> Self {
        match self {
            RequestState::Idle => RequestState::Idle,
            RequestState::Loading { initiated_at, retry_at } => {
                RequestState::Loading { initiated_at: *initiated_at, retry_at: *retry_at }
            }
            RequestState::Success { retrieved_at, retry_at } => {
                RequestState::Success { retrieved_at: *retrieved_at, retry_at: *retry_at }
            }
            RequestState::Error { error, failed_at, retry_at } => RequestState::Error {
                error: Arc::clone(error),
                failed_at: *failed_at,
                retry_at: *retry_at,
            },
            RequestState::StaleWhileRevalidate { retrieved_at, refresh_initiated_at, retry_at } => {
                RequestState::StaleWhileRevalidate {
                    retrieved_at: *retrieved_at,
                    refresh_initiated_at: *refresh_initiated_at,
                    retry_at: *retry_at,
                }
            }
            RequestState::StaleWithError { retrieved_at, error, failed_at, retry_at } => {
                RequestState::StaleWithError {
                    retrieved_at: *retrieved_at,
                    error: Arc::clone(error),
                    failed_at: *failed_at,
                    retry_at: *retry_at,
                }
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for RequestState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Idle => f.write_str("Idle"),
            RequestState::Loading { initiated_at, retry_at } => f
                .debug_struct("Loading")
                .field("initiated_at", initiated_at)
                .field("retry_at", retry_at)
                .finish(),
            RequestState::Success { retrieved_at, retry_at } => f
                .debug_struct("Success")
                .field("retrieved_at", retrieved_at)
                .field("retry_at", retry_at)
                .finish(),
            RequestState::Error { error, failed_at, retry_at } => f
                .debug_struct("Error")
                .field("error", error)
                .field("failed_at", failed_at)
                .field("retry_at", retry_at)
                .finish(),
            RequestState::StaleWhileRevalidate { retrieved_at, refresh_initiated_at, retry_at } => {
                f.debug_struct("StaleWhileRevalidate")
                    .field("retrieved_at", retrieved_at)
                    .field("refresh_initiated_at", refresh_initiated_at)
                    .field("retry_at", retry_at)
                    .finish()
            }
            RequestState::StaleWithError { retrieved_at, error, failed_at, retry_at } => f
                .debug_struct("StaleWithError")
                .field("retrieved_at", retrieved_at)
                .field("error", error)
                .field("failed_at", failed_at)
                .field("retry_at", retry_at)
                .finish(),
        }
    }
}

impl<E> Default for RequestState<E> {
    fn default() -> Self {
        RequestState::Idle
    }
}

/// Immutable snapshot published on the tap's state grip.
///
/// The history slice is shared and frozen: every publish hands consumers the
/// same allocation until the next transition.
pub struct AsyncRequestState<E> {
    pub state: RequestState<E>,
    pub request_key: Option<RequestKey>,
    /// Derived: output-grip subscribers > 0 at publish time. State-grip and
    /// controller-grip subscriptions do not count.
    pub has_listeners: bool,
    pub history: Arc<[HistoryEntry<E>]>,
}

impl<E> AsyncRequestState<E> {
    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }
}

impl<E> Clone for AsyncRequestState<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            request_key: self.request_key.clone(),
            has_listeners: self.has_listeners,
            history: Arc::clone(&self.history),
        }
    }
}

impl<E> Default for AsyncRequestState<E> {
    fn default() -> Self {
        Self {
            state: RequestState::Idle,
            request_key: None,
            has_listeners: false,
            history: Vec::new().into(),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for AsyncRequestState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequestState")
            .field("state", &self.state)
            .field("request_key", &self.request_key)
            .field("has_listeners", &self.has_listeners)
            .field("history_len", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    type State = RequestState<io::Error>;

    fn err() -> Arc<io::Error> {
        Arc::new(io::Error::new(io::ErrorKind::Other, "boom"))
    }

    #[test]
    fn idle_never_has_retry_at() {
        let state: State = RequestState::Idle;
        assert_eq!(state.retry_at(), None);
        assert_eq!(state.with_retry_at(Some(99)).retry_at(), None);
    }

    #[test]
    fn data_availability_tracks_variants() {
        let success: State = RequestState::Success { retrieved_at: 10, retry_at: None };
        let swr: State = RequestState::StaleWhileRevalidate {
            retrieved_at: 10,
            refresh_initiated_at: 20,
            retry_at: None,
        };
        let stale_err: State = RequestState::StaleWithError {
            retrieved_at: 10,
            error: err(),
            failed_at: 30,
            retry_at: None,
        };
        let loading: State = RequestState::Loading { initiated_at: 5, retry_at: None };

        assert!(success.has_data() && swr.has_data() && stale_err.has_data());
        assert!(!loading.has_data());
        assert!(swr.is_stale() && stale_err.is_stale());
        assert!(!success.is_stale());
        assert!(loading.is_refreshing() && swr.is_refreshing());
        assert!(swr.is_refreshing_with_data());
        assert!(!loading.is_refreshing_with_data());
    }

    #[test]
    fn error_accessors() {
        let error: State =
            RequestState::Error { error: err(), failed_at: 30, retry_at: Some(40) };
        assert!(error.has_error());
        assert_eq!(error.error_failed_at(), Some(30));
        assert!(error.error().is_some());

        let loading: State = RequestState::Loading { initiated_at: 5, retry_at: None };
        assert!(loading.error().is_none());
    }

    #[test]
    fn scheduled_retry_is_relative_to_now() {
        let error: State =
            RequestState::Error { error: err(), failed_at: 30, retry_at: Some(150) };
        assert!(error.has_scheduled_retry(100));
        assert!(!error.has_scheduled_retry(150));
        assert_eq!(error.retry_time_remaining(100), Some(50));
        assert_eq!(error.retry_time_remaining(200), Some(0));

        let idle: State = RequestState::Idle;
        assert_eq!(idle.retry_time_remaining(100), None);
    }

    #[test]
    fn with_retry_at_preserves_other_fields() {
        let error: State =
            RequestState::Error { error: err(), failed_at: 30, retry_at: Some(150) };
        let cleared = error.with_retry_at(None);
        assert_eq!(cleared.retry_at(), None);
        assert_eq!(cleared.error_failed_at(), Some(30));
        // The original is untouched.
        assert_eq!(error.retry_at(), Some(150));
    }

    #[test]
    fn timestamps_route_by_variant() {
        let swr: State = RequestState::StaleWhileRevalidate {
            retrieved_at: 10,
            refresh_initiated_at: 20,
            retry_at: None,
        };
        assert_eq!(swr.data_retrieved_at(), Some(10));
        assert_eq!(swr.request_initiated_at(), Some(20));

        let loading: State = RequestState::Loading { initiated_at: 5, retry_at: None };
        assert_eq!(loading.request_initiated_at(), Some(5));
        assert_eq!(loading.data_retrieved_at(), None);
    }

    #[test]
    fn status_messages_mention_errors() {
        let stale: State = RequestState::StaleWithError {
            retrieved_at: 10,
            error: err(),
            failed_at: 30,
            retry_at: None,
        };
        let msg = stale.status_message();
        assert!(msg.contains("boom"));
        assert!(msg.contains("stale"));

        let retrying: State =
            RequestState::Error { error: err(), failed_at: 30, retry_at: Some(99) };
        assert!(retrying.status_message().contains("retry scheduled"));
    }

    #[test]
    fn default_snapshot_is_idle_and_empty() {
        let snapshot: AsyncRequestState<io::Error> = AsyncRequestState::default();
        assert_eq!(snapshot.kind(), StateKind::Idle);
        assert_eq!(snapshot.request_key, None);
        assert!(!snapshot.has_listeners);
        assert!(snapshot.history.is_empty());
    }
}
