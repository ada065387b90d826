//! Source Trait and Subscription Plumbing
//!
//! A [`Source`] is a read-only observable cell: a current value plus a
//! monotonically increasing version stamp. Everything else in the reactive
//! module (values, transforms, tuples) speaks this interface.
//!
//! # Version stamps
//!
//! `mods()` starts at 0 ("never changed") and increments exactly once per
//! accepted mutation. Consumers compare stamps instead of values for cheap
//! "did this change" checks; `subscribe` accepts the consumer's last-seen
//! stamp and replays the current value once, synchronously, if it differs.
//!
//! # Identity
//!
//! Every source carries a process-unique `id`. Identity drives
//! [`Source::depends_on`] (transitive upstream checks used to order tuple
//! slots) and the container's tuple cache. IDs come from one atomic counter
//! shared by all source kinds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ReactiveError;

/// Counter for generating unique source IDs.
static SOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique source ID.
pub(crate) fn next_source_id() -> u64 {
    SOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Change notification callback: receives the new value and its stamp.
pub type ChangeCallback<T> = Arc<dyn Fn(&T, u64) + Send + Sync>;

/// Wrap a closure as a [`ChangeCallback`].
pub fn callback<T>(f: impl Fn(&T, u64) + Send + Sync + 'static) -> ChangeCallback<T> {
    Arc::new(f)
}

/// Handle returned by [`Source::subscribe`]; call [`Disconnector::disconnect`]
/// to remove the subscription. Dropping it without disconnecting leaves the
/// subscription alive (subscriptions are counted, disposal of a subscribed
/// value is an error).
pub struct Disconnector(Option<Box<dyn FnOnce() + Send>>);

impl Disconnector {
    pub fn noop() -> Self {
        Self(None)
    }

    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn disconnect(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Disconnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Disconnector")
            .field(&self.0.is_some())
            .finish()
    }
}

/// A read-only observable cell.
pub trait Source<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Process-unique identity of this source.
    fn id(&self) -> u64;

    /// Human-readable name, used in error messages and logs.
    fn name(&self) -> &str;

    /// Current value (clones out). Derived sources actualize lazily first.
    fn get(&self) -> T;

    /// Version stamp; 0 means the value has never changed.
    fn mods(&self) -> u64;

    /// Register a change callback. If `last_mods` is given and differs from
    /// the current stamp, the current value is replayed synchronously once
    /// before the callback is registered.
    fn subscribe(&self, cb: ChangeCallback<T>, last_mods: Option<u64>) -> Disconnector;

    /// Whether the source identified by `id` is a (transitive) upstream of
    /// this one. Used purely for ordering; sources are built bottom-up, so
    /// the upstream relation is acyclic by construction.
    fn depends_on(&self, id: u64) -> bool;
}

/// Type-erased shared handle to a source.
pub type SharedSource<T> = Arc<dyn Source<T>>;

/// An entity with an explicit, idempotent teardown operation. The container
/// stores its members through this trait.
pub trait Disposable: Send + Sync {
    /// Graph key for this disposable inside the owning container.
    fn node_id(&self) -> u64;

    /// Tear down. Idempotent; fails if the entity still has subscribers.
    fn dispose(&self) -> Result<(), ReactiveError>;
}

/// Disposer invoked for superseded or rejected values.
pub type Disposer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Equality predicate used to reject "unchanged" mutations.
pub type EqPredicate<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Merge policy applied when a value is accepted: `(old, new) -> stored`.
pub type Setter<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// Cell state distinguishing "never computed" from any legitimate value.
#[derive(Debug, Clone)]
pub(crate) enum Cell<T> {
    Uncomputed,
    Computed(T),
}

impl<T> Cell<T> {
    pub(crate) fn is_computed(&self) -> bool {
        matches!(self, Cell::Computed(_))
    }

    pub(crate) fn as_ref(&self) -> Option<&T> {
        match self {
            Cell::Uncomputed => None,
            Cell::Computed(v) => Some(v),
        }
    }
}

/// Shared mutable heart of every value-like source: the cell, the stamp,
/// the handler registry, and the mutation policy.
pub(crate) struct ValueCore<T> {
    id: u64,
    name: String,
    state: RwLock<CoreState<T>>,
    handlers: RwLock<Vec<(u64, ChangeCallback<T>)>>,
    next_handler: AtomicU64,
    eq: Option<EqPredicate<T>>,
    setter: Option<Setter<T>>,
    disposer: Option<Disposer<T>>,
}

struct CoreState<T> {
    cell: Cell<T>,
    mods: u64,
}

impl<T> ValueCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        cell: Cell<T>,
        eq: Option<EqPredicate<T>>,
        setter: Option<Setter<T>>,
        disposer: Option<Disposer<T>>,
    ) -> Self {
        Self {
            id: next_source_id(),
            name,
            state: RwLock::new(CoreState { cell, mods: 0 }),
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(0),
            eq,
            setter,
            disposer,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mods(&self) -> u64 {
        self.state.read().mods
    }

    pub(crate) fn is_computed(&self) -> bool {
        self.state.read().cell.is_computed()
    }

    /// Current value; panics if read after dispose or before first compute.
    /// Callers actualize first, so this fires only on misuse.
    pub(crate) fn get(&self) -> T {
        self.state
            .read()
            .cell
            .as_ref()
            .cloned()
            .unwrap_or_else(|| panic!("value '{}' read while uncomputed or disposed", self.name))
    }

    pub(crate) fn cell_value(&self) -> Option<T> {
        self.state.read().cell.as_ref().cloned()
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn is_same(&self, candidate: &T) -> bool {
        let state = self.state.read();
        match (&state.cell, &self.eq) {
            (Cell::Computed(current), Some(eq)) => eq(current, candidate),
            _ => false,
        }
    }

    pub(crate) fn dispose_candidate(&self, value: &T) {
        if let Some(disposer) = &self.disposer {
            disposer(value);
        }
    }

    /// Accept a mutation unconditionally: dispose the superseded value,
    /// merge through the setter, bump the stamp, notify synchronously.
    fn set_impl(&self, new_value: T) {
        let (stored, mods) = {
            let mut state = self.state.write();
            let old_cell = std::mem::replace(&mut state.cell, Cell::Uncomputed);
            // Disposer and setter run under the state lock and must not
            // reenter this value.
            let stored = match old_cell {
                Cell::Computed(old) => {
                    self.dispose_candidate(&old);
                    match &self.setter {
                        Some(setter) => setter(old, new_value),
                        None => new_value,
                    }
                }
                Cell::Uncomputed => new_value,
            };
            state.cell = Cell::Computed(stored.clone());
            state.mods += 1;
            (stored, state.mods)
        };
        self.notify(&stored, mods);
    }

    /// `set` contract: no-op when the candidate is unchanged per `eq`; a
    /// first write onto an uncomputed cell lands silently (no stamp bump,
    /// no notification).
    pub(crate) fn set(&self, new_value: T) {
        if !self.is_computed() {
            self.state.write().cell = Cell::Computed(new_value);
            return;
        }
        if self.is_same(&new_value) {
            return;
        }
        self.set_impl(new_value);
    }

    /// Like `set`, but an `eq`-rejected candidate is disposed instead of
    /// silently dropped. Used by transform recomputation and async writes.
    pub(crate) fn set_or_dispose(&self, new_value: T) {
        if !self.is_computed() {
            self.state.write().cell = Cell::Computed(new_value);
            return;
        }
        if self.is_same(&new_value) {
            self.dispose_candidate(&new_value);
            return;
        }
        self.set_impl(new_value);
    }

    fn notify(&self, value: &T, mods: u64) {
        // Snapshot so re-entrant subscribe/unsubscribe during notification
        // cannot corrupt the handler list.
        let snapshot: Vec<ChangeCallback<T>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb(value, mods);
        }
    }

    /// Register a handler after optionally replaying a missed value.
    /// Returns the handler key used by the disconnector.
    pub(crate) fn add_handler(&self, cb: ChangeCallback<T>, last_mods: Option<u64>) -> u64 {
        if let Some(last) = last_mods {
            let (value, mods) = {
                let state = self.state.read();
                (state.cell.as_ref().cloned(), state.mods)
            };
            if last != mods {
                if let Some(v) = value {
                    cb(&v, mods);
                }
            }
        }
        let key = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((key, cb));
        key
    }

    /// Remove a handler; returns how many remain.
    pub(crate) fn remove_handler(&self, key: u64) -> usize {
        let mut handlers = self.handlers.write();
        handlers.retain(|(k, _)| *k != key);
        handlers.len()
    }

    /// Tear down the held value. Fails while subscribers remain; idempotent
    /// otherwise.
    pub(crate) fn dispose(&self) -> Result<(), ReactiveError> {
        if self.has_subscribers() {
            return Err(ReactiveError::DisposeWhileSubscribed {
                name: self.name.clone(),
            });
        }
        let old = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.cell, Cell::Uncomputed)
        };
        if let Cell::Computed(v) = old {
            self.dispose_candidate(&v);
        }
        Ok(())
    }
}

/// An immutable source: fixed value, stamp pinned at 0, subscription is a
/// no-op. Carries a disposer so owned resources are still released when the
/// containing scope tears down.
pub struct ConstSource<T> {
    inner: Arc<ConstInner<T>>,
}

struct ConstInner<T> {
    id: u64,
    name: String,
    value: RwLock<Option<T>>,
    disposer: Option<Disposer<T>>,
}

impl<T> ConstSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, value: T, disposer: Option<Disposer<T>>) -> Self {
        Self {
            inner: Arc::new(ConstInner {
                id: next_source_id(),
                name: name.into(),
                value: RwLock::new(Some(value)),
                disposer,
            }),
        }
    }

    pub fn as_source(&self) -> SharedSource<T> {
        Arc::new(self.clone())
    }
}

impl<T> Clone for ConstSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Source<T> for ConstSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn get(&self) -> T {
        self.inner
            .value
            .read()
            .as_ref()
            .cloned()
            .unwrap_or_else(|| panic!("const source '{}' read after dispose", self.inner.name))
    }

    fn mods(&self) -> u64 {
        0
    }

    fn subscribe(&self, _cb: ChangeCallback<T>, _last_mods: Option<u64>) -> Disconnector {
        Disconnector::noop()
    }

    fn depends_on(&self, _id: u64) -> bool {
        false
    }
}

impl<T> Disposable for ConstSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.id
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        if let Some(v) = self.inner.value.write().take() {
            if let Some(disposer) = &self.inner.disposer {
                disposer(&v);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn source_ids_are_unique() {
        let a = ConstSource::new("a", 1, None);
        let b = ConstSource::new("b", 1, None);
        assert_ne!(Source::id(&a), Source::id(&b));
    }

    #[test]
    fn const_source_never_changes() {
        let c = ConstSource::new("c", 7, None);
        assert_eq!(c.get(), 7);
        assert_eq!(c.mods(), 0);
        assert!(!c.depends_on(12345));

        let fired = Arc::new(AtomicI32::new(0));
        let fired2 = fired.clone();
        let disc = c.subscribe(callback(move |_: &i32, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }), None);
        disc.disconnect();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn const_source_dispose_runs_disposer() {
        let dropped = Arc::new(AtomicI32::new(0));
        let dropped2 = dropped.clone();
        let c = ConstSource::new(
            "c",
            9,
            Some(Arc::new(move |_: &i32| {
                dropped2.fetch_add(1, Ordering::SeqCst);
            }) as Disposer<i32>),
        );
        c.dispose().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        // Idempotent.
        c.dispose().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
