//! Per-destination control handle published on the controller grip.
//!
//! The controller is a stateless projection: it closes over the destination
//! identity and dispatches through the tap's current per-destination record.
//! When the destination has no output-grip listeners, a no-op handle is
//! published instead, so stale references cannot resurrect work on a dead
//! destination. The live handle is reinstated on the next output-grip
//! subscription.

use std::fmt;
use std::sync::Weak;

use crate::context::ContextId;

/// Dispatch surface the controller calls into. Implemented by the tap.
pub(crate) trait ControllerOps: Send + Sync {
    fn retry(&self, dest: ContextId, force: bool);
    fn refresh(&self, dest: ContextId, force: bool);
    fn cancel_retry(&self, dest: ContextId);
    fn reset(&self, dest: ContextId);
}

enum Handle {
    Noop,
    Live { ops: Weak<dyn ControllerOps>, dest: ContextId },
}

/// Control handle for one destination of an async tap.
///
/// All methods return silently when the handle is a no-op or the tap has
/// been dropped.
#[derive(Clone)]
pub struct AsyncTapController {
    handle: Handle,
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        match self {
            Handle::Noop => Handle::Noop,
            Handle::Live { ops, dest } => Handle::Live { ops: Weak::clone(ops), dest: *dest },
        }
    }
}

impl AsyncTapController {
    /// Inert handle; every method is a silent no-op.
    pub fn noop() -> Self {
        Self { handle: Handle::Noop }
    }

    pub(crate) fn live(ops: Weak<dyn ControllerOps>, dest: ContextId) -> Self {
        Self { handle: Handle::Live { ops, dest } }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.handle, Handle::Noop)
    }

    /// Abort any in-flight request, bump the retry counter, and start a new
    /// request. `force` bypasses the cache. Error-recovery semantics.
    pub fn retry(&self, force: bool) {
        if let Handle::Live { ops, dest } = &self.handle {
            if let Some(ops) = ops.upgrade() {
                ops.retry(*dest, force);
            }
        }
    }

    /// Abort any in-flight request and start a new one without touching the
    /// retry counter. `force` bypasses the cache. Freshness semantics.
    pub fn refresh(&self, force: bool) {
        if let Handle::Live { ops, dest } = &self.handle {
            if let Some(ops) = ops.upgrade() {
                ops.refresh(*dest, force);
            }
        }
    }

    /// Cancel scheduled retry and refresh timers without starting anything.
    pub fn cancel_retry(&self) {
        if let Handle::Live { ops, dest } = &self.handle {
            if let Some(ops) = ops.upgrade() {
                ops.cancel_retry(*dest);
            }
        }
    }

    /// Abort everything, clear history, and return the destination to idle.
    pub fn reset(&self) {
        if let Handle::Live { ops, dest } = &self.handle {
            if let Some(ops) = ops.upgrade() {
                ops.reset(*dest);
            }
        }
    }
}

impl Default for AsyncTapController {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for AsyncTapController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handle {
            Handle::Noop => f.write_str("AsyncTapController::Noop"),
            Handle::Live { dest, .. } => {
                f.debug_struct("AsyncTapController").field("dest", dest).finish()
            }
        }
    }
}
