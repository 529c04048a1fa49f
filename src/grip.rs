//! Typed keys and heterogeneous update batches.
//!
//! A [`Grip`] is a typed, immutable identifier for a data channel. It carries
//! a default value, which consumers see whenever no tap has published to the
//! channel yet. Taps hand values back to the graph as [`GripUpdates`]
//! batches keyed by [`GripId`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GRIP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a grip.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GripId(u64);

impl GripId {
    fn next() -> Self {
        Self(NEXT_GRIP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for GripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GripId({})", self.0)
    }
}

impl fmt::Display for GripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased grip value as stored in contexts and update batches.
pub type GripValue = Arc<dyn Any + Send + Sync>;

/// A typed key with a default value.
///
/// Cloning a grip clones the handle: both clones address the same channel.
#[derive(Clone)]
pub struct Grip<T> {
    id: GripId,
    name: Arc<str>,
    default: T,
}

impl<T: Clone + Send + Sync + 'static> Grip<T> {
    pub fn new(name: impl Into<Arc<str>>, default: T) -> Self {
        Self { id: GripId::next(), name: name.into(), default }
    }

    pub fn id(&self) -> GripId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> T {
        self.default.clone()
    }

    pub(crate) fn default_erased(&self) -> GripValue {
        Arc::new(self.default.clone())
    }
}

impl<T> fmt::Debug for Grip<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grip").field("id", &self.id).field("name", &self.name).finish()
    }
}

/// A batch of `grip → value` assignments published in one step.
///
/// Later writes to the same grip win; readers see the last value set.
#[derive(Clone, Default)]
pub struct GripUpdates {
    entries: Vec<(GripId, GripValue)>,
}

impl GripUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a typed value. Returns `self` for chaining in mapper closures.
    pub fn with<T: Send + Sync + 'static>(mut self, grip: &Grip<T>, value: T) -> Self
    where
        T: Clone,
    {
        self.set(grip, value);
        self
    }

    pub fn set<T: Clone + Send + Sync + 'static>(&mut self, grip: &Grip<T>, value: T) {
        self.entries.push((grip.id(), Arc::new(value)));
    }

    /// Set an already-erased value. Taps use this to publish snapshot and
    /// controller values addressed by id alone.
    pub fn set_value(&mut self, id: GripId, value: GripValue) {
        self.entries.push((id, value));
    }

    /// Read back the typed value for a grip, if this batch carries one.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, grip: &Grip<T>) -> Option<T> {
        self.get_value(grip.id()).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    pub fn get_value(&self, id: GripId) -> Option<&GripValue> {
        self.entries.iter().rev().find(|(entry_id, _)| *entry_id == id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: GripId) -> bool {
        self.entries.iter().any(|(entry_id, _)| *entry_id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = GripId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for GripUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
