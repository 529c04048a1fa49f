//! Convenient re-exports for common grip-async types.
pub use crate::{
    cache::{CachedResult, LruTtlCache, RequestCache},
    cancel::CancelToken,
    clock::{Clock, EpochMillis, ManualClock, SystemClock},
    context::{Context, ContextId, ContextRef, Params, Publisher},
    controller::AsyncTapController,
    fetch::{Fetch, FnFetcher},
    grip::{Grip, GripId, GripUpdates, GripValue},
    history::{HistoryEntry, TransitionReason},
    jitter::Jitter,
    retry::RetryConfig,
    scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler},
    state::{AsyncRequestState, RequestKey, RequestState, StateKind},
    tap::{AsyncTap, AsyncTapBuilder, BuildError},
};
