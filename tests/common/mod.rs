//! Shared harness for async tap integration tests: a manual clock and
//! scheduler, a scripted fetcher the test resolves by hand, and a recording
//! publisher to observe everything the tap emits.
#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use grip_async::{
    AsyncRequestState, AsyncTap, AsyncTapBuilder, AsyncTapController, CancelToken, Context,
    ContextId, ContextRef, Fetch, Grip, GripUpdates, ManualClock, ManualScheduler, Params,
    Publisher,
};

/// Sentinel fetch value the harness mapper refuses to map.
pub const MAP_FAIL: u64 = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl TestError {
    pub fn new(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// One fetch the tap dispatched; resolved explicitly by the test.
pub struct FetchCall {
    pub params: Params,
    pub cancel: CancelToken,
    sender: Option<oneshot::Sender<Result<u64, TestError>>>,
}

/// Fetcher that parks every call until the test resolves it.
#[derive(Default)]
pub struct ScriptedFetcher {
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn cancelled(&self, index: usize) -> bool {
        self.calls.lock().unwrap()[index].cancel.is_cancelled()
    }

    /// Complete call `index` with `outcome`. Resolving twice is a no-op.
    pub fn resolve(&self, index: usize, outcome: Result<u64, TestError>) {
        let sender = self.calls.lock().unwrap()[index].sender.take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

#[async_trait]
impl Fetch<u64, TestError> for ScriptedFetcher {
    async fn fetch(&self, params: Params, cancel: CancelToken) -> Result<u64, TestError> {
        let (sender, receiver) = oneshot::channel();
        self.calls
            .lock()
            .unwrap()
            .push(FetchCall { params, cancel, sender: Some(sender) });
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TestError::new("script dropped the call")),
        }
    }
}

/// Publisher that records every emission, addressable by destination.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(ContextId, GripUpdates)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Every value published for `grip` to `dest`, in publish order.
    pub fn values_for<T: Clone + Send + Sync + 'static>(
        &self,
        dest: ContextId,
        grip: &Grip<T>,
    ) -> Vec<T> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == dest)
            .filter_map(|(_, updates)| updates.get(grip))
            .collect()
    }

    pub fn last_for<T: Clone + Send + Sync + 'static>(
        &self,
        dest: ContextId,
        grip: &Grip<T>,
    ) -> Option<T> {
        self.values_for(dest, grip).pop()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, dest: &ContextRef, updates: GripUpdates) {
        self.events.lock().unwrap().push((dest.id(), updates));
    }
}

/// Let spawned fetch tasks and completion routing run on the current-thread
/// test runtime.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// A fully wired tap over controllable time, timers, fetching, and output.
pub struct Harness {
    pub clock: ManualClock,
    pub scheduler: ManualScheduler,
    pub fetcher: Arc<ScriptedFetcher>,
    pub publisher: Arc<RecordingPublisher>,
    pub tap: AsyncTap<u64, TestError>,
    pub home: ContextRef,
    pub value: Grip<u64>,
    pub state: Grip<AsyncRequestState<TestError>>,
    pub controller: Grip<AsyncTapController>,
    pub user: Grip<Option<u32>>,
}

impl Harness {
    pub fn build<F>(configure: F) -> Self
    where
        F: FnOnce(
            AsyncTapBuilder<u64, TestError>,
        ) -> AsyncTapBuilder<u64, TestError>,
    {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::new(clock.clone());
        let fetcher = ScriptedFetcher::new();
        let publisher = RecordingPublisher::new();

        let value: Grip<u64> = Grip::new("value", 0);
        let state: Grip<AsyncRequestState<TestError>> =
            Grip::new("request_state", AsyncRequestState::default());
        let controller: Grip<AsyncTapController> =
            Grip::new("request_controller", AsyncTapController::noop());
        let user: Grip<Option<u32>> = Grip::new("user_id", None);

        let key_of = user.clone();
        let value_out = value.clone();
        let builder = AsyncTap::builder()
            .provides(&value)
            .state_grip(&state)
            .controller_grip(&controller)
            .dest_param(&user)
            .request_key_of(move |params: &Params| {
                params.get(&key_of).map(|id| format!("user:{id}").into())
            })
            .fetcher(fetcher.clone() as Arc<dyn Fetch<u64, TestError>>)
            .map_result(move |v: &u64| {
                if *v == MAP_FAIL {
                    return Err(TestError::new("unmappable result"));
                }
                Ok(GripUpdates::new().with(&value_out, *v))
            })
            .clock(Arc::new(clock.clone()))
            .scheduler(Arc::new(scheduler.clone()));

        let tap = configure(builder).build().expect("harness tap builds");

        let home = Context::root();
        tap.on_attach(home.clone(), publisher.clone());

        Self {
            clock,
            scheduler,
            fetcher,
            publisher,
            tap,
            home,
            value,
            state,
            controller,
            user,
        }
    }

    /// A destination context whose params resolve to `user:<id>`.
    pub fn dest(&self, user: u32) -> ContextRef {
        let ctx = Context::child(&self.home);
        ctx.put(&self.user, Some(user));
        ctx
    }

    /// A destination context whose params do not resolve to a key.
    pub fn unresolved_dest(&self) -> ContextRef {
        Context::child(&self.home)
    }

    pub fn connect(&self, dest: &ContextRef) {
        self.tap.on_connect(dest, self.value.id());
    }

    pub fn disconnect(&self, dest: &ContextRef) {
        self.tap.on_disconnect(dest, self.value.id());
    }

    /// Published state snapshots for a destination, oldest first.
    pub fn states(&self, dest: &ContextRef) -> Vec<AsyncRequestState<TestError>> {
        self.publisher.values_for(dest.id(), &self.state)
    }

    pub fn last_state(&self, dest: &ContextRef) -> AsyncRequestState<TestError> {
        self.publisher
            .last_for(dest.id(), &self.state)
            .expect("at least one state snapshot published")
    }

    /// Published output values for a destination, oldest first.
    pub fn outputs(&self, dest: &ContextRef) -> Vec<u64> {
        self.publisher.values_for(dest.id(), &self.value)
    }

    pub fn last_controller(&self, dest: &ContextRef) -> AsyncTapController {
        self.publisher
            .last_for(dest.id(), &self.controller)
            .expect("at least one controller published")
    }

    /// Reasons recorded in the destination's history, oldest first.
    pub fn history_reasons(&self, dest: &ContextRef) -> Vec<grip_async::TransitionReason> {
        self.tap
            .request_state(dest)
            .history
            .iter()
            .map(|entry| entry.reason)
            .collect()
    }

    /// Advance the clock and run every timer that became due.
    pub fn advance_and_fire(&self, to: u64) {
        self.clock.set(to);
        self.scheduler.fire_due();
    }
}

/// Shorthands used across scenario assertions.
pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}
