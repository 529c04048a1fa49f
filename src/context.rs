//! Contexts, parameter resolution, and the publish contract.
//!
//! The context graph itself lives in the host runtime; this module carries
//! the minimal contract the async core consumes: a hierarchical scope node
//! where grips resolve to values, a resolved-parameter view handed to key
//! functions and fetchers, and the publish operation used to deliver values
//! to a specific destination.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::grip::{Grip, GripId, GripUpdates, GripValue};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a context node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a context node.
pub type ContextRef = Arc<Context>;

/// A node in the hierarchical scope graph. Grip lookups walk the parent
/// chain; writes land on the node itself.
pub struct Context {
    id: ContextId,
    parent: Option<ContextRef>,
    values: RwLock<HashMap<GripId, GripValue>>,
}

impl Context {
    pub fn root() -> ContextRef {
        Arc::new(Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            parent: None,
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn child(parent: &ContextRef) -> ContextRef {
        Arc::new(Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            parent: Some(Arc::clone(parent)),
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Set a grip value on this node.
    pub fn put<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>, value: T) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(grip.id(), Arc::new(value));
    }

    /// Remove a grip value from this node, exposing the parent's value or
    /// the grip default again.
    pub fn remove<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>) {
        self.values.write().unwrap_or_else(PoisonError::into_inner).remove(&grip.id());
    }

    /// Resolve a grip to a typed value, falling back to the grip default.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>) -> T {
        self.lookup(grip.id())
            .and_then(|v| v.downcast_ref::<T>().cloned())
            .unwrap_or_else(|| grip.default_value())
    }

    /// Walk the parent chain for the nearest value of `id`.
    pub fn lookup(&self, id: GripId) -> Option<GripValue> {
        let local =
            self.values.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned();
        match local {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.lookup(id)),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

/// Parameter values resolved for one destination at one instant.
///
/// Handed to the request key function and the fetcher; immutable once built.
#[derive(Clone, Default)]
pub struct Params {
    values: HashMap<GripId, GripValue>,
}

impl Params {
    /// Resolve declared parameter grips: destination-scoped grips from the
    /// destination's chain, home-scoped grips from the tap's home chain.
    pub fn resolve(
        dest: &Context,
        home: Option<&ContextRef>,
        dest_grips: &[GripId],
        home_grips: &[GripId],
    ) -> Self {
        let mut values = HashMap::new();
        for id in dest_grips {
            if let Some(value) = dest.lookup(*id) {
                values.insert(*id, value);
            }
        }
        for id in home_grips {
            if let Some(value) = home.and_then(|h| h.lookup(*id)) {
                values.insert(*id, value);
            }
        }
        Self { values }
    }

    /// Typed read with fallback to the grip default.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>) -> T {
        self.get_opt(grip).unwrap_or_else(|| grip.default_value())
    }

    /// Typed read; `None` when the parameter was absent or of another type.
    pub fn get_opt<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>) -> Option<T> {
        self.values.get(&grip.id()).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    pub fn contains(&self, id: GripId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values.keys()).finish()
    }
}

/// Delivery of published values to a specific destination.
///
/// Implemented by the host graph runtime; the async core only ever emits
/// through this trait, after its own bookkeeping is complete.
pub trait Publisher: Send + Sync {
    fn publish(&self, dest: &ContextRef, updates: GripUpdates);
}

impl fmt::Debug for dyn Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Publisher")
    }
}
