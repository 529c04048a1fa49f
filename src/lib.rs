#![forbid(unsafe_code)]

//! # grip-async
//!
//! Async request-state core for the GRIP reactive data graph: taps that
//! drive external fetches through their full lifecycle (idle → loading →
//! success/error → stale refresh → retry) and publish that lifecycle back
//! through the graph they participate in.
//!
//! ## Features
//!
//! - **Six-variant request states** with immutable published snapshots
//! - **Shared LRU+TTL cache** keyed by request fingerprint
//! - **Exponential-backoff retries** gated on live listeners
//! - **Pre-expiry TTL refresh** producing stale-while-revalidate transitions
//! - **Latest-only completion routing** with cancellation of superseded work
//! - **Per-destination controllers** (retry / refresh / cancel / reset)
//! - **Injectable clock and timers** for deterministic virtual-time tests
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use grip_async::{
//!     AsyncRequestState, AsyncTap, AsyncTapController, Context, ContextRef, Grip,
//!     GripUpdates, Publisher, RetryConfig,
//! };
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("user service unavailable")]
//! struct FetchError;
//!
//! struct Sink;
//! impl Publisher for Sink {
//!     fn publish(&self, _dest: &ContextRef, _updates: GripUpdates) {}
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let user_id: Grip<Option<u64>> = Grip::new("user_id", None);
//!     let user_name: Grip<String> = Grip::new("user_name", String::new());
//!     let state: Grip<AsyncRequestState<FetchError>> =
//!         Grip::new("user_state", AsyncRequestState::default());
//!     let controller: Grip<AsyncTapController> =
//!         Grip::new("user_controller", AsyncTapController::noop());
//!
//!     let name_of = user_name.clone();
//!     let id_of = user_id.clone();
//!     let tap: AsyncTap<String, FetchError> = AsyncTap::builder()
//!         .provides(&user_name)
//!         .state_grip(&state)
//!         .controller_grip(&controller)
//!         .dest_param(&user_id)
//!         .request_key_of(move |params| {
//!             params.get(&id_of).map(|id| format!("user:{id}").into())
//!         })
//!         .fetch_with(|_params, _cancel| async { Ok("Ada Lovelace".to_string()) })
//!         .map_result(move |name: &String| {
//!             Ok(GripUpdates::new().with(&name_of, name.clone()))
//!         })
//!         .cache_ttl(Duration::from_secs(60))
//!         .retry(RetryConfig::new().with_max_retries(3))
//!         .build()
//!         .expect("valid tap");
//!
//!     let home = Context::root();
//!     tap.on_attach(home.clone(), Arc::new(Sink));
//!
//!     let dest = Context::child(&home);
//!     dest.put(&user_id, Some(7));
//!     tap.on_connect(&dest, user_name.id());
//!     assert!(tap.request_state(&dest).state.is_refreshing());
//! }
//! ```

mod cache;
mod cancel;
mod clock;
mod context;
mod controller;
mod dest;
mod fetch;
mod grip;
mod history;
mod jitter;
mod retry;
mod scheduler;
mod state;
mod tap;

// Re-exports
pub use cache::{CachedResult, LruTtlCache, RequestCache};
pub use cancel::CancelToken;
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use context::{Context, ContextId, ContextRef, Params, Publisher};
pub use controller::AsyncTapController;
pub use fetch::{Fetch, FnFetcher};
pub use grip::{Grip, GripId, GripUpdates, GripValue};
pub use history::{HistoryEntry, TransitionReason};
pub use jitter::Jitter;
pub use retry::RetryConfig;
pub use scheduler::{ManualScheduler, Scheduler, TimerCallback, TimerHandle, TokioScheduler};
pub use state::{AsyncRequestState, RequestKey, RequestState, StateKind};
pub use tap::{
    AsyncTap, AsyncTapBuilder, BuildError, DEFAULT_CACHE_CAPACITY, DEFAULT_HISTORY_SIZE,
};

pub mod prelude;
