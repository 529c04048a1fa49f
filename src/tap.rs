//! The async tap: a multi-key, multi-destination request state machine.
//!
//! One [`AsyncTap`] is instantiated per data source. Each destination
//! context that subscribes to any of its grips gets an independent state
//! record; destinations resolving to the same request key share the cache.
//! Every entry into the runner (connect, parameter change, manual
//! retry/refresh, scheduled retry, scheduled refresh) funnels through a
//! single kickoff operation, and every transition publishes a fresh
//! immutable snapshot on the state grip.
//!
//! All state mutations happen on one logical timeline guarded by a mutex;
//! only fetcher futures and armed timers live outside it, re-entering
//! through weak references. Publishes are batched during a mutation and
//! flushed after the lock is released, so a publisher may synchronously
//! read back state or invoke the controller.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CachedResult, LruTtlCache, RequestCache};
use crate::cancel::CancelToken;
use crate::clock::{Clock, EpochMillis, SystemClock};
use crate::context::{ContextId, ContextRef, Params, Publisher};
use crate::controller::{AsyncTapController, ControllerOps};
use crate::dest::{ArmedTimer, DestState};
use crate::fetch::{Fetch, FnFetcher};
use crate::grip::{Grip, GripId, GripUpdates, GripValue};
use crate::history::TransitionReason;
use crate::retry::RetryConfig;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::state::{AsyncRequestState, RequestKey, RequestState};

/// Default bound of the per-destination history ring.
pub const DEFAULT_HISTORY_SIZE: usize = 10;
/// Default capacity of the per-tap request cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Configuration mistakes caught by [`AsyncTapBuilder::build`].
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("async tap must provide at least one output grip")]
    NoOutputGrips,
    #[error("async tap requires a fetcher")]
    MissingFetcher,
    #[error("async tap requires a request key function")]
    MissingRequestKeyFn,
    #[error("async tap requires a result mapper")]
    MissingResultMapper,
    #[error("backoff multiplier must be at least 1.0 (got {0})")]
    InvalidBackoffMultiplier(f64),
    #[error("refresh_before_expiry requires cache_ttl to be set")]
    RefreshWithoutTtl,
}

type KeyFn = Arc<dyn Fn(&Params) -> Option<RequestKey> + Send + Sync>;
type MapFn<R, E> = Arc<dyn Fn(&R) -> Result<GripUpdates, E> + Send + Sync>;

struct ProvidedGrip {
    id: GripId,
    default: GripValue,
}

struct TapConfig<R, E> {
    provides: Vec<ProvidedGrip>,
    state_grip: Option<GripId>,
    controller_grip: Option<GripId>,
    dest_params: Vec<GripId>,
    home_params: Vec<GripId>,
    request_key_of: KeyFn,
    fetcher: Arc<dyn Fetch<R, E>>,
    map_result: MapFn<R, E>,
    cache_ttl: Option<Duration>,
    refresh_before_expiry: Option<Duration>,
    latest_only: bool,
    history_size: usize,
    retry: RetryConfig<E>,
}

impl<R, E> TapConfig<R, E> {
    fn is_output(&self, grip: GripId) -> bool {
        self.provides.iter().any(|p| p.id == grip)
    }

    fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl.map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

struct TapState<E> {
    home: Option<ContextRef>,
    publisher: Option<Arc<dyn Publisher>>,
    dests: HashMap<ContextId, DestState<E>>,
    /// Output-grip listener totals aggregated per request key.
    key_listeners: HashMap<RequestKey, usize>,
}

impl<E> TapState<E> {
    fn new() -> Self {
        Self {
            home: None,
            publisher: None,
            dests: HashMap::new(),
            key_listeners: HashMap::new(),
        }
    }
}

/// Pending publishes collected during a mutation and flushed after the
/// state lock is released.
struct Batch {
    publisher: Option<Arc<dyn Publisher>>,
    items: Vec<(ContextRef, GripUpdates)>,
}

impl Batch {
    fn new(publisher: Option<Arc<dyn Publisher>>) -> Self {
        Self { publisher, items: Vec::new() }
    }

    fn push(&mut self, dest: ContextRef, updates: GripUpdates) {
        if !updates.is_empty() {
            self.items.push((dest, updates));
        }
    }

    fn flush(self) {
        if let Some(publisher) = self.publisher {
            for (dest, updates) in self.items {
                publisher.publish(&dest, updates);
            }
        }
    }
}

/// Where a kickoff came from; decides transition reasons and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KickoffCause {
    Connect,
    Produce,
    ManualRetry,
    ManualRefresh,
    ScheduledRetry,
    TtlRefresh,
}

impl KickoffCause {
    fn reason(self, has_data: bool) -> TransitionReason {
        match self {
            KickoffCause::Connect | KickoffCause::Produce => {
                if has_data {
                    TransitionReason::RefreshInitiated
                } else {
                    TransitionReason::RequestInitiated
                }
            }
            KickoffCause::ManualRetry => TransitionReason::ManualRetry,
            KickoffCause::ManualRefresh => TransitionReason::ManualRefresh,
            KickoffCause::ScheduledRetry => TransitionReason::RetryExecuted,
            KickoffCause::TtlRefresh => TransitionReason::TtlRefreshExecuted,
        }
    }
}

enum Route {
    Nothing,
    EmitOnly,
    Start,
    KeyChange,
}

enum TimerKind {
    Retry,
    Refresh,
}

/// Drop `by` listeners from a key's aggregated count, removing the entry
/// when it reaches zero.
fn remove_key_listeners(
    key_listeners: &mut HashMap<RequestKey, usize>,
    key: &RequestKey,
    by: usize,
) {
    let emptied = match key_listeners.get_mut(key) {
        Some(count) => {
            *count = count.saturating_sub(by);
            *count == 0
        }
        None => false,
    };
    if emptied {
        key_listeners.remove(key);
    }
}

struct TapInner<R, E> {
    cfg: TapConfig<R, E>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    cache: Arc<dyn RequestCache<R>>,
    state: Mutex<TapState<E>>,
    controller_ops: OnceLock<Arc<dyn ControllerOps>>,
}

/// Dispatch target for live controllers; holds the tap weakly so a dropped
/// tap silences every outstanding handle.
struct ControllerDispatch<R, E> {
    inner: Weak<TapInner<R, E>>,
}

impl<R, E> ControllerOps for ControllerDispatch<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn retry(&self, dest: ContextId, force: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.manual_retry(dest, force);
        }
    }

    fn refresh(&self, dest: ContextId, force: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.manual_refresh(dest, force);
        }
    }

    fn cancel_retry(&self, dest: ContextId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.manual_cancel_retry(dest);
        }
    }

    fn reset(&self, dest: ContextId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.manual_reset(dest);
        }
    }
}

impl<R, E> TapInner<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, TapState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- lifecycle -------------------------------------------------------

    fn attach(&self, home: ContextRef, publisher: Arc<dyn Publisher>) {
        let mut st = self.lock();
        st.home = Some(home);
        st.publisher = Some(publisher);
        tracing::debug!("async tap attached");
    }

    fn detach(&self) {
        let mut st = self.lock();
        for dest in st.dests.values_mut() {
            dest.cancel_timers();
            dest.abort_inflight();
        }
        st.dests.clear();
        st.key_listeners.clear();
        st.home = None;
        st.publisher = None;
        tracing::debug!("async tap detached");
    }

    // ---- subscription tracking ------------------------------------------

    fn connect(self: &Arc<Self>, dest_ctx: &ContextRef, grip: GripId) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        let dest_id = dest_ctx.id();
        if !st.dests.contains_key(&dest_id) {
            st.dests.insert(dest_id, DestState::new(dest_ctx, self.cfg.history_size));
        }
        let is_output = self.cfg.is_output(grip);
        {
            let TapState { dests, key_listeners, .. } = &mut *st;
            if let Some(dest) = dests.get_mut(&dest_id) {
                if is_output {
                    dest.listener_count += 1;
                    if let Some(key) = dest.request_key.clone() {
                        *key_listeners.entry(key).or_insert(0) += 1;
                    }
                }
                if self.cfg.controller_grip.is_some() && !dest.controller_live {
                    dest.controller_live = true;
                    self.emit_controller(dest, true, &mut batch);
                }
            }
        }
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            self.emit_state(dest, &mut batch);
        }
        if is_output {
            self.kickoff(&mut st, dest_id, false, KickoffCause::Connect, &mut batch);
        }
        drop(st);
        batch.flush();
    }

    fn disconnect(self: &Arc<Self>, dest_ctx: &ContextRef, grip: GripId) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        self.disconnect_locked(&mut st, &mut batch, dest_ctx.id(), grip);
        drop(st);
        batch.flush();
    }

    fn disconnect_locked(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        batch: &mut Batch,
        dest_id: ContextId,
        grip: GripId,
    ) {
        let now = self.clock.now_millis();
        let is_output = self.cfg.is_output(grip);
        let mut controller_dropped = false;
        {
            let TapState { dests, key_listeners, .. } = &mut *st;
            let Some(dest) = dests.get_mut(&dest_id) else { return };
            if is_output && dest.listener_count > 0 {
                dest.listener_count -= 1;
                if let Some(key) = &dest.request_key {
                    remove_key_listeners(key_listeners, key, 1);
                }
                if dest.listener_count == 0 {
                    // The last data consumer left: freeze the state where it
                    // is, but nothing may fire for this destination anymore.
                    let cancelled = dest.cancel_timers();
                    if cancelled || dest.state.retry_at().is_some() {
                        dest.state = dest.state.with_retry_at(None);
                        dest.note(now, TransitionReason::ListenerUnsubscribed);
                    }
                    if dest.controller_live {
                        dest.controller_live = false;
                        controller_dropped = true;
                    }
                }
            }
        }
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            if controller_dropped {
                self.emit_controller(dest, false, batch);
            }
            self.emit_state(dest, batch);
        }
    }

    fn produce(self: &Arc<Self>, dest_ctx: &ContextRef) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        let dest_id = dest_ctx.id();
        if !st.dests.contains_key(&dest_id) {
            st.dests.insert(dest_id, DestState::new(dest_ctx, self.cfg.history_size));
        }
        self.kickoff(&mut st, dest_id, false, KickoffCause::Produce, &mut batch);
        drop(st);
        batch.flush();
    }

    fn request_state(&self, dest_id: ContextId) -> AsyncRequestState<E> {
        let mut st = self.lock();
        match st.dests.get_mut(&dest_id) {
            Some(dest) => AsyncRequestState {
                state: dest.state.clone(),
                request_key: dest.request_key.clone(),
                has_listeners: dest.has_listeners(),
                history: dest.history.snapshot(),
            },
            None => AsyncRequestState::default(),
        }
    }

    fn key_listener_count(&self, key: &str) -> usize {
        self.lock().key_listeners.get(key).copied().unwrap_or(0)
    }

    // ---- the request runner ---------------------------------------------

    /// Single entry point of the state machine. Resolves the destination's
    /// parameters, routes request-key drift to [`Self::change_key`], and
    /// otherwise starts (or dedupes) a request under the current key.
    fn kickoff(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        dest_id: ContextId,
        force: bool,
        cause: KickoffCause,
        batch: &mut Batch,
    ) {
        let now = self.clock.now_millis();
        let Some(ctx) = st.dests.get(&dest_id).and_then(|d| d.context.upgrade()) else {
            // Destination context is gone without a disconnect; tear down.
            if let Some(mut dest) = st.dests.remove(&dest_id) {
                dest.cancel_timers();
                dest.abort_inflight();
            }
            return;
        };
        let params = Params::resolve(
            &ctx,
            st.home.as_ref(),
            &self.cfg.dest_params,
            &self.cfg.home_params,
        );
        let new_key = (self.cfg.request_key_of)(&params);

        let route = {
            let TapState { dests, key_listeners, .. } = &mut *st;
            let Some(dest) = dests.get_mut(&dest_id) else { return };
            match (dest.request_key.as_ref(), new_key.as_ref()) {
                (None, None) => {
                    // Params unresolved and nothing to tear down.
                    if dest.state.is_idle() {
                        Route::Nothing
                    } else {
                        dest.transition(
                            RequestState::Idle,
                            now,
                            TransitionReason::RequestKeyChanged,
                        );
                        Route::EmitOnly
                    }
                }
                (None, Some(key)) => {
                    // First key for this destination; adopt it quietly.
                    dest.request_key = Some(Arc::clone(key));
                    if dest.listener_count > 0 {
                        *key_listeners.entry(Arc::clone(key)).or_insert(0) +=
                            dest.listener_count;
                    }
                    Route::Start
                }
                (Some(old), Some(key)) if old == key => Route::Start,
                _ => Route::KeyChange,
            }
        };

        match route {
            Route::Nothing => {}
            Route::EmitOnly => {
                if let Some(dest) = st.dests.get_mut(&dest_id) {
                    self.emit_state(dest, batch);
                }
            }
            Route::KeyChange => self.change_key(st, dest_id, new_key, params, now, batch),
            Route::Start => {
                self.start_same_key(st, dest_id, params, force, cause, now, batch)
            }
        }
    }

    fn start_same_key(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        dest_id: ContextId,
        params: Params,
        force: bool,
        cause: KickoffCause,
        now: EpochMillis,
        batch: &mut Batch,
    ) {
        {
            let Some(dest) = st.dests.get_mut(&dest_id) else { return };
            let in_flight = dest.abort_handle.is_some();
            if in_flight
                && !force
                && matches!(cause, KickoffCause::Connect | KickoffCause::Produce)
            {
                // An equivalent request is already running; don't restart it.
                return;
            }
            if dest.abort_inflight() {
                dest.note(now, TransitionReason::ConcurrentRequestAborted);
            }
            dest.cancel_timers();
        }
        self.begin_request(st, dest_id, params, force, cause, now, batch, false);
    }

    /// Request-key change: abort, rewind retry bookkeeping, move listener
    /// aggregation to the new key, and either restart under the new key or
    /// fall back to idle when the key resolved to nothing. History is
    /// preserved across the change.
    fn change_key(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        dest_id: ContextId,
        new_key: Option<RequestKey>,
        params: Params,
        now: EpochMillis,
        batch: &mut Batch,
    ) {
        {
            let TapState { dests, key_listeners, .. } = &mut *st;
            let Some(dest) = dests.get_mut(&dest_id) else { return };
            tracing::debug!(old = ?dest.request_key, new = ?new_key, "request key changed");
            if dest.abort_inflight() {
                dest.note(now, TransitionReason::RequestKeyChangedAborted);
            }
            dest.cancel_timers();
            dest.retry_attempt = 0;
            if dest.listener_count > 0 {
                if let Some(old) = &dest.request_key {
                    remove_key_listeners(key_listeners, old, dest.listener_count);
                }
                if let Some(key) = &new_key {
                    *key_listeners.entry(Arc::clone(key)).or_insert(0) += dest.listener_count;
                }
            }
            let had_data = dest.state.has_data();
            // One history entry covers the whole change: the state being
            // left under the old key.
            let next = match &new_key {
                Some(_) => RequestState::Loading { initiated_at: now, retry_at: None },
                None => RequestState::Idle,
            };
            dest.transition(next, now, TransitionReason::RequestKeyChanged);
            dest.request_key = new_key.clone();
            if had_data || new_key.is_none() {
                if let Some(ctx) = dest.context.upgrade() {
                    batch.push(ctx, self.default_updates());
                }
            }
        }
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            self.emit_state(dest, batch);
        }
        if new_key.is_some() {
            self.begin_request(
                st,
                dest_id,
                params,
                false,
                KickoffCause::Connect,
                now,
                batch,
                true,
            );
        }
    }

    /// Start a request under the destination's current key: consult the
    /// cache, transition, and dispatch the fetch. Timers and any previous
    /// in-flight request must already be cleared.
    #[allow(clippy::too_many_arguments)]
    fn begin_request(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        dest_id: ContextId,
        params: Params,
        force: bool,
        cause: KickoffCause,
        now: EpochMillis,
        batch: &mut Batch,
        already_transitioned: bool,
    ) {
        let Some(dest) = st.dests.get_mut(&dest_id) else { return };
        let Some(key) = dest.request_key.clone() else { return };
        let my_seq = dest.next_inflight_seq();

        // A TTL refresh fires before the cached entry expires; consulting
        // the cache there would short-circuit the refresh it exists for.
        let consult_cache = !force && cause != KickoffCause::TtlRefresh;
        if consult_cache {
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(key = %key, "cache hit, serving without fetch");
                match (self.cfg.map_result)(&hit.result) {
                    Ok(updates) => {
                        if let Some(ctx) = dest.context.upgrade() {
                            batch.push(ctx, updates);
                        }
                        dest.retry_attempt = 0;
                        let retry_at = self.arm_refresh_timer(dest_id, dest, now, now);
                        dest.transition(
                            RequestState::Success { retrieved_at: now, retry_at },
                            now,
                            TransitionReason::CacheHit,
                        );
                        self.emit_state(dest, batch);
                    }
                    Err(error) => self.fail_request(dest_id, dest, error, now, batch),
                }
                return;
            }
        }

        if !already_transitioned {
            let has_data = dest.state.has_data();
            let next = if has_data {
                RequestState::StaleWhileRevalidate {
                    retrieved_at: dest.state.data_retrieved_at().unwrap_or(now),
                    refresh_initiated_at: now,
                    retry_at: None,
                }
            } else {
                RequestState::Loading { initiated_at: now, retry_at: None }
            };
            dest.transition(next, now, cause.reason(has_data));
            self.emit_state(dest, batch);
        }

        let token = CancelToken::new();
        dest.abort_handle = Some(token.clone());
        let fetcher = Arc::clone(&self.cfg.fetcher);
        let weak = Arc::downgrade(self);
        tracing::debug!(key = %key, seq = my_seq, "fetch dispatched");
        tokio::spawn(async move {
            let outcome = fetcher.fetch(params, token.clone()).await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(dest_id, my_seq, token, outcome);
            }
        });
    }

    /// Completion routing. Runs back on the timeline once a fetch resolves.
    fn complete(self: &Arc<Self>, dest_id: ContextId, seq: u64, token: CancelToken, outcome: Result<R, E>) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        self.complete_locked(&mut st, &mut batch, dest_id, seq, token, outcome);
        drop(st);
        batch.flush();
    }

    fn complete_locked(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        batch: &mut Batch,
        dest_id: ContextId,
        seq: u64,
        token: CancelToken,
        outcome: Result<R, E>,
    ) {
        let now = self.clock.now_millis();
        let Some(dest) = st.dests.get_mut(&dest_id) else { return };
        if token.is_cancelled() {
            tracing::trace!(seq, "completion from aborted request dropped");
            return;
        }
        if self.cfg.latest_only && seq != dest.inflight_seq {
            tracing::debug!(seq, current = dest.inflight_seq, "stale completion discarded");
            return;
        }
        if seq == dest.inflight_seq {
            dest.abort_handle = None;
        }
        match outcome {
            Ok(result) => match (self.cfg.map_result)(&result) {
                Ok(updates) => {
                    if let Some(key) = dest.request_key.clone() {
                        self.cache.set(
                            key,
                            CachedResult {
                                result,
                                stored_at: now,
                                ttl_ms: self.cfg.cache_ttl_ms(),
                            },
                        );
                    }
                    if let Some(ctx) = dest.context.upgrade() {
                        batch.push(ctx, updates);
                    }
                    let reason = if dest.state.is_refreshing_with_data() {
                        TransitionReason::RefreshSuccess
                    } else {
                        TransitionReason::FetchSuccess
                    };
                    dest.retry_attempt = 0;
                    let retry_at = self.arm_refresh_timer(dest_id, dest, now, now);
                    dest.transition(
                        RequestState::Success { retrieved_at: now, retry_at },
                        now,
                        reason,
                    );
                    self.emit_state(dest, batch);
                }
                // A result the mapper rejects is a failed fetch; nothing is
                // cached for it.
                Err(error) => self.fail_request(dest_id, dest, error, now, batch),
            },
            Err(error) => self.fail_request(dest_id, dest, error, now, batch),
        }
    }

    /// Failure routing shared by fetch errors and mapper errors.
    fn fail_request(
        self: &Arc<Self>,
        dest_id: ContextId,
        dest: &mut DestState<E>,
        error: E,
        now: EpochMillis,
        batch: &mut Batch,
    ) {
        let retryable = self.cfg.retry.should_retry(&error);
        let has_data = dest.state.has_data();
        let leaving_refresh = dest.state.is_refreshing_with_data();
        let error = Arc::new(error);
        let mut retry_at = None;
        if retryable && dest.has_listeners() && dest.retry_attempt < self.cfg.retry.max_retries()
        {
            retry_at = Some(self.arm_retry_timer(dest_id, dest, now));
        }
        tracing::debug!(error = %error, retry_at = ?retry_at, "fetch failed");
        let reason = if leaving_refresh {
            TransitionReason::RefreshError
        } else {
            TransitionReason::FetchError
        };
        let next = if has_data {
            RequestState::StaleWithError {
                retrieved_at: dest.state.data_retrieved_at().unwrap_or(now),
                error,
                failed_at: now,
                retry_at,
            }
        } else {
            RequestState::Error { error, failed_at: now, retry_at }
        };
        dest.transition(next, now, reason);
        self.emit_state(dest, batch);
    }

    // ---- timers ----------------------------------------------------------

    /// Arm the backoff timer for the next retry. Increments the attempt
    /// counter at schedule time, so the stored value names the attempt the
    /// timer will execute.
    fn arm_retry_timer(
        self: &Arc<Self>,
        dest_id: ContextId,
        dest: &mut DestState<E>,
        now: EpochMillis,
    ) -> EpochMillis {
        let delay = self.cfg.retry.jittered_delay_for(dest.retry_attempt);
        dest.retry_attempt += 1;
        let at = now.saturating_add(delay.as_millis() as u64);
        let gen = dest.next_timer_gen();
        let weak = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.retry_timer_fired(dest_id, gen);
                }
            }),
        );
        dest.retry_timer = Some(ArmedTimer { handle, gen });
        tracing::debug!(attempt = dest.retry_attempt, at, "retry scheduled");
        at
    }

    /// Arm the pre-expiry refresh timer after a success, when configured
    /// and somebody is listening. Returns the `retry_at` to record on the
    /// success state.
    fn arm_refresh_timer(
        self: &Arc<Self>,
        dest_id: ContextId,
        dest: &mut DestState<E>,
        now: EpochMillis,
        retrieved_at: EpochMillis,
    ) -> Option<EpochMillis> {
        let ttl = self.cfg.cache_ttl?;
        let lead = self.cfg.refresh_before_expiry?;
        let ttl_ms = ttl.as_millis() as u64;
        if ttl_ms == 0 {
            return None;
        }
        let refresh_at =
            retrieved_at.saturating_add(ttl_ms).saturating_sub(lead.as_millis() as u64);
        if refresh_at <= now || !dest.has_listeners() {
            return None;
        }
        let gen = dest.next_timer_gen();
        let weak = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            Duration::from_millis(refresh_at - now),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_timer_fired(dest_id, gen);
                }
            }),
        );
        dest.refresh_timer = Some(ArmedTimer { handle, gen });
        tracing::debug!(at = refresh_at, "ttl refresh scheduled");
        Some(refresh_at)
    }

    fn retry_timer_fired(self: &Arc<Self>, dest_id: ContextId, gen: u64) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        self.timer_fired_locked(&mut st, &mut batch, dest_id, gen, TimerKind::Retry);
        drop(st);
        batch.flush();
    }

    fn refresh_timer_fired(self: &Arc<Self>, dest_id: ContextId, gen: u64) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        self.timer_fired_locked(&mut st, &mut batch, dest_id, gen, TimerKind::Refresh);
        drop(st);
        batch.flush();
    }

    fn timer_fired_locked(
        self: &Arc<Self>,
        st: &mut TapState<E>,
        batch: &mut Batch,
        dest_id: ContextId,
        gen: u64,
        kind: TimerKind,
    ) {
        let now = self.clock.now_millis();
        {
            let Some(dest) = st.dests.get_mut(&dest_id) else { return };
            let armed_gen = match kind {
                TimerKind::Retry => dest.retry_timer.as_ref().map(|t| t.gen),
                TimerKind::Refresh => dest.refresh_timer.as_ref().map(|t| t.gen),
            };
            if armed_gen != Some(gen) {
                // Cancelled or superseded while the fire was in flight.
                return;
            }
            match kind {
                TimerKind::Retry => dest.retry_timer = None,
                TimerKind::Refresh => dest.refresh_timer = None,
            }
            if !dest.has_listeners() {
                if dest.state.retry_at().is_some() {
                    dest.state = dest.state.with_retry_at(None);
                    dest.note(now, TransitionReason::ListenerUnsubscribed);
                    self.emit_state(dest, batch);
                }
                return;
            }
        }
        let (force, cause) = match kind {
            TimerKind::Retry => (true, KickoffCause::ScheduledRetry),
            TimerKind::Refresh => (false, KickoffCause::TtlRefresh),
        };
        self.kickoff(st, dest_id, force, cause, batch);
    }

    // ---- controller dispatch --------------------------------------------

    fn manual_retry(self: &Arc<Self>, dest_id: ContextId, force: bool) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            dest.retry_attempt = dest.retry_attempt.saturating_add(1);
        }
        self.kickoff(&mut st, dest_id, force, KickoffCause::ManualRetry, &mut batch);
        drop(st);
        batch.flush();
    }

    fn manual_refresh(self: &Arc<Self>, dest_id: ContextId, force: bool) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        self.kickoff(&mut st, dest_id, force, KickoffCause::ManualRefresh, &mut batch);
        drop(st);
        batch.flush();
    }

    fn manual_cancel_retry(self: &Arc<Self>, dest_id: ContextId) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            dest.cancel_timers();
            if dest.state.retry_at().is_some() {
                dest.state = dest.state.with_retry_at(None);
                self.emit_state(dest, &mut batch);
            }
        }
        drop(st);
        batch.flush();
    }

    fn manual_reset(self: &Arc<Self>, dest_id: ContextId) {
        let mut st = self.lock();
        let mut batch = Batch::new(st.publisher.clone());
        if let Some(dest) = st.dests.get_mut(&dest_id) {
            dest.abort_inflight();
            dest.cancel_timers();
            dest.retry_attempt = 0;
            dest.history.clear();
            dest.state = RequestState::Idle;
            if let Some(ctx) = dest.context.upgrade() {
                batch.push(ctx, self.default_updates());
            }
            self.emit_state(dest, &mut batch);
        }
        drop(st);
        batch.flush();
    }

    // ---- emission helpers ------------------------------------------------

    fn emit_state(&self, dest: &mut DestState<E>, batch: &mut Batch) {
        let Some(grip) = self.cfg.state_grip else { return };
        let Some(ctx) = dest.context.upgrade() else { return };
        let snapshot = AsyncRequestState {
            state: dest.state.clone(),
            request_key: dest.request_key.clone(),
            has_listeners: dest.has_listeners(),
            history: dest.history.snapshot(),
        };
        let mut updates = GripUpdates::new();
        updates.set_value(grip, Arc::new(snapshot));
        batch.push(ctx, updates);
    }

    fn emit_controller(&self, dest: &DestState<E>, live: bool, batch: &mut Batch) {
        let Some(grip) = self.cfg.controller_grip else { return };
        let Some(ctx) = dest.context.upgrade() else { return };
        let controller = if live {
            match self.controller_ops.get() {
                Some(ops) => AsyncTapController::live(Arc::downgrade(ops), ctx.id()),
                None => AsyncTapController::noop(),
            }
        } else {
            AsyncTapController::noop()
        };
        let mut updates = GripUpdates::new();
        updates.set_value(grip, Arc::new(controller));
        batch.push(ctx, updates);
    }

    fn default_updates(&self) -> GripUpdates {
        let mut updates = GripUpdates::new();
        for provided in &self.cfg.provides {
            updates.set_value(provided.id, Arc::clone(&provided.default));
        }
        updates
    }
}

/// Producer that drives an external fetch through its full lifecycle and
/// exposes that lifecycle (and a control surface) to consumers.
///
/// `R` is the fetch result type shared through the cache; `E` is the
/// fetcher's error type, surfaced inside state snapshots.
pub struct AsyncTap<R, E> {
    inner: Arc<TapInner<R, E>>,
}

impl<R, E> Clone for AsyncTap<R, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R, E> fmt::Debug for AsyncTap<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTap")
            .field("provides", &self.inner.cfg.provides.len())
            .field("latest_only", &self.inner.cfg.latest_only)
            .finish()
    }
}

impl<R, E> AsyncTap<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> AsyncTapBuilder<R, E> {
        AsyncTapBuilder::new()
    }

    /// Resource boundary: the tap joins the graph at `home` and publishes
    /// through `publisher` from now on.
    pub fn on_attach(&self, home: ContextRef, publisher: Arc<dyn Publisher>) {
        self.inner.attach(home, publisher);
    }

    /// Resource boundary: clears every timer and aborts every in-flight
    /// request, deterministically.
    pub fn on_detach(&self) {
        self.inner.detach();
    }

    /// A destination subscribed to one of this tap's grips.
    pub fn on_connect(&self, dest: &ContextRef, grip: GripId) {
        self.inner.connect(dest, grip);
    }

    /// A destination dropped one of this tap's grips.
    pub fn on_disconnect(&self, dest: &ContextRef, grip: GripId) {
        self.inner.disconnect(dest, grip);
    }

    /// Nudge recomputation for a destination, e.g. after its parameters
    /// changed.
    pub fn produce(&self, dest: &ContextRef) {
        self.inner.produce(dest);
    }

    /// Synchronous read of the destination's current snapshot.
    pub fn request_state(&self, dest: &ContextRef) -> AsyncRequestState<E> {
        self.inner.request_state(dest.id())
    }

    /// Aggregated output-grip listener total for a request key, across all
    /// destinations of this tap.
    pub fn key_listener_count(&self, key: &str) -> usize {
        self.inner.key_listener_count(key)
    }

    /// The request cache this tap consults, shared across its destinations.
    pub fn cache(&self) -> Arc<dyn RequestCache<R>> {
        Arc::clone(&self.inner.cache)
    }
}

/// Builder for [`AsyncTap`]. Validates its inputs on [`build`](Self::build).
pub struct AsyncTapBuilder<R, E> {
    provides: Vec<ProvidedGrip>,
    state_grip: Option<GripId>,
    controller_grip: Option<GripId>,
    dest_params: Vec<GripId>,
    home_params: Vec<GripId>,
    request_key_of: Option<KeyFn>,
    fetcher: Option<Arc<dyn Fetch<R, E>>>,
    map_result: Option<MapFn<R, E>>,
    shared_cache: Option<Arc<dyn RequestCache<R>>>,
    cache_capacity: usize,
    cache_ttl: Option<Duration>,
    refresh_before_expiry: Option<Duration>,
    latest_only: bool,
    history_size: usize,
    retry: RetryConfig<E>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
}

impl<R, E> AsyncTapBuilder<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            provides: Vec::new(),
            state_grip: None,
            controller_grip: None,
            dest_params: Vec::new(),
            home_params: Vec::new(),
            request_key_of: None,
            fetcher: None,
            map_result: None,
            shared_cache: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: None,
            refresh_before_expiry: None,
            latest_only: true,
            history_size: DEFAULT_HISTORY_SIZE,
            retry: RetryConfig::default(),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
        }
    }

    /// Declare an output grip. The grip's default is what destinations see
    /// after a reset or key change drops previously published data.
    pub fn provides<T: Clone + Send + Sync + 'static>(mut self, grip: &Grip<T>) -> Self {
        self.provides.push(ProvidedGrip { id: grip.id(), default: grip.default_erased() });
        self
    }

    /// Publish lifecycle snapshots on this grip.
    pub fn state_grip(mut self, grip: &Grip<AsyncRequestState<E>>) -> Self {
        self.state_grip = Some(grip.id());
        self
    }

    /// Publish the per-destination control handle on this grip.
    pub fn controller_grip(mut self, grip: &Grip<AsyncTapController>) -> Self {
        self.controller_grip = Some(grip.id());
        self
    }

    /// Declare a parameter resolved from the destination context.
    pub fn dest_param<T: Clone + Send + Sync + 'static>(mut self, grip: &Grip<T>) -> Self {
        self.dest_params.push(grip.id());
        self
    }

    /// Declare a parameter resolved from the tap's home context.
    pub fn home_param<T: Clone + Send + Sync + 'static>(mut self, grip: &Grip<T>) -> Self {
        self.home_params.push(grip.id());
        self
    }

    /// Fingerprint function. Returning `None` means the parameters do not
    /// resolve to a request; the destination idles.
    pub fn request_key_of<F>(mut self, f: F) -> Self
    where
        F: Fn(&Params) -> Option<RequestKey> + Send + Sync + 'static,
    {
        self.request_key_of = Some(Arc::new(f));
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetch<R, E>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Fetcher from an async closure.
    pub fn fetch_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Params, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.fetcher = Some(Arc::new(FnFetcher::new(f)));
        self
    }

    /// Map a fetch result onto output grip values. A mapping error is
    /// treated as a failure of the request.
    pub fn map_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> Result<GripUpdates, E> + Send + Sync + 'static,
    {
        self.map_result = Some(Arc::new(f));
        self
    }

    /// Use a caller-owned cache, e.g. shared across taps.
    pub fn shared_cache(mut self, cache: Arc<dyn RequestCache<R>>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    /// Capacity of the tap-owned cache built when no shared cache is given.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Schedule a refresh this long before a cached entry expires.
    pub fn refresh_before_expiry(mut self, lead: Duration) -> Self {
        self.refresh_before_expiry = Some(lead);
        self
    }

    /// Whether completions of superseded requests are discarded (default)
    /// or applied in arrival order.
    pub fn latest_only(mut self, latest_only: bool) -> Self {
        self.latest_only = latest_only;
        self
    }

    /// Bound of the per-destination history ring; 0 disables history.
    pub fn history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn retry(mut self, retry: RetryConfig<E>) -> Self {
        self.retry = retry;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the timer scheduler (useful for virtual-time tests).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn build(self) -> Result<AsyncTap<R, E>, BuildError> {
        if self.provides.is_empty() {
            return Err(BuildError::NoOutputGrips);
        }
        let request_key_of = self.request_key_of.ok_or(BuildError::MissingRequestKeyFn)?;
        let fetcher = self.fetcher.ok_or(BuildError::MissingFetcher)?;
        let map_result = self.map_result.ok_or(BuildError::MissingResultMapper)?;
        if self.retry.backoff_multiplier() < 1.0 {
            return Err(BuildError::InvalidBackoffMultiplier(self.retry.backoff_multiplier()));
        }
        if self.refresh_before_expiry.is_some() && self.cache_ttl.is_none() {
            return Err(BuildError::RefreshWithoutTtl);
        }
        let cache = match self.shared_cache {
            Some(cache) => cache,
            None => Arc::new(LruTtlCache::with_clock(
                self.cache_capacity,
                Arc::clone(&self.clock),
            )),
        };
        let inner = Arc::new(TapInner {
            cfg: TapConfig {
                provides: self.provides,
                state_grip: self.state_grip,
                controller_grip: self.controller_grip,
                dest_params: self.dest_params,
                home_params: self.home_params,
                request_key_of,
                fetcher,
                map_result,
                cache_ttl: self.cache_ttl,
                refresh_before_expiry: self.refresh_before_expiry,
                latest_only: self.latest_only,
                history_size: self.history_size,
                retry: self.retry,
            },
            clock: self.clock,
            scheduler: self.scheduler,
            cache,
            state: Mutex::new(TapState::new()),
            controller_ops: OnceLock::new(),
        });
        let dispatch: Arc<dyn ControllerOps> =
            Arc::new(ControllerDispatch { inner: Arc::downgrade(&inner) });
        let _ = inner.controller_ops.set(dispatch);
        Ok(AsyncTap { inner })
    }
}

impl<R, E> Default for AsyncTapBuilder<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn value_grip() -> Grip<u32> {
        Grip::new("value", 0)
    }

    fn minimal_builder() -> AsyncTapBuilder<u32, io::Error> {
        let value = value_grip();
        AsyncTap::builder()
            .provides(&value)
            .request_key_of(|_| Some("k".into()))
            .fetch_with(|_, _| async { Ok(1u32) })
            .map_result(move |_| Ok(GripUpdates::new()))
    }

    #[test]
    fn build_requires_output_grips() {
        let result: Result<AsyncTap<u32, io::Error>, _> = AsyncTap::builder()
            .request_key_of(|_| None)
            .fetch_with(|_, _| async { Ok(1u32) })
            .map_result(|_| Ok(GripUpdates::new()))
            .build();
        assert_eq!(result.err(), Some(BuildError::NoOutputGrips));
    }

    #[test]
    fn build_requires_fetcher_and_key_fn_and_mapper() {
        let value = value_grip();
        let missing_key: Result<AsyncTap<u32, io::Error>, _> = AsyncTap::builder()
            .provides(&value)
            .fetch_with(|_, _| async { Ok(1u32) })
            .map_result(|_| Ok(GripUpdates::new()))
            .build();
        assert_eq!(missing_key.err(), Some(BuildError::MissingRequestKeyFn));

        let missing_fetcher: Result<AsyncTap<u32, io::Error>, _> = AsyncTap::builder()
            .provides(&value)
            .request_key_of(|_| None)
            .map_result(|_| Ok(GripUpdates::new()))
            .build();
        assert_eq!(missing_fetcher.err(), Some(BuildError::MissingFetcher));

        let missing_mapper: Result<AsyncTap<u32, io::Error>, _> = AsyncTap::builder()
            .provides(&value)
            .request_key_of(|_| None)
            .fetch_with(|_, _| async { Ok(1u32) })
            .build();
        assert_eq!(missing_mapper.err(), Some(BuildError::MissingResultMapper));
    }

    #[test]
    fn build_rejects_sub_one_multiplier() {
        let result = minimal_builder()
            .retry(RetryConfig::new().with_backoff_multiplier(0.5))
            .build();
        assert!(matches!(result.err(), Some(BuildError::InvalidBackoffMultiplier(_))));
    }

    #[test]
    fn build_rejects_refresh_lead_without_ttl() {
        let result = minimal_builder()
            .refresh_before_expiry(Duration::from_millis(200))
            .build();
        assert_eq!(result.err(), Some(BuildError::RefreshWithoutTtl));
    }

    #[test]
    fn build_accepts_a_minimal_tap() {
        let tap = minimal_builder().build().expect("valid tap");
        assert_eq!(tap.key_listener_count("k"), 0);
    }

    #[tokio::test]
    async fn unknown_destination_reads_default_snapshot() {
        let tap = minimal_builder().build().expect("valid tap");
        let dest = crate::context::Context::root();
        let snapshot = tap.request_state(&dest);
        assert!(snapshot.state.is_idle());
        assert_eq!(snapshot.request_key, None);
        assert!(!snapshot.has_listeners);
        assert!(snapshot.history.is_empty());
    }
}
