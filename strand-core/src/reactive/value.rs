//! Value Implementation
//!
//! A [`Value`] is the fundamental mutable cell. It owns its current value,
//! an equality predicate that rejects unchanged writes, a merge policy
//! applied to accepted writes, and a disposer invoked for every superseded
//! or rejected value.
//!
//! # Mutation contract
//!
//! - `set` is a no-op when the candidate is unchanged per `eq`; otherwise
//!   the old value is disposed first, the setter merges old and new, the
//!   version stamp bumps exactly once, and all subscribers are notified
//!   synchronously in registration order.
//! - A value is never replaced without first disposing what it supersedes.
//! - `set_future_or_dispose` is the single async-race primitive: if the
//!   stamp moved while the future was pending, the produced candidate is
//!   disposed and the write reports `false` (last synchronous writer wins).
//!
//! # Sharing
//!
//! `Value` is a cheap handle; clones share state. Disposal is only legal
//! while the subscriber count is zero.

use std::future::Future;
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::error::ReactiveError;
use crate::reactive::source::{
    Cell, ChangeCallback, Disconnector, Disposable, Disposer, EqPredicate, Setter, SharedSource,
    Source, ValueCore,
};

/// Tagged configuration for a [`Value`], with named defaults: no equality
/// predicate (every write is a change), replace-setter, no-op disposer.
pub struct ValueBuilder<T> {
    name: String,
    value: T,
    eq: Option<EqPredicate<T>>,
    setter: Option<Setter<T>>,
    disposer: Option<Disposer<T>>,
}

impl<T> ValueBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            value,
            eq: None,
            setter: None,
            disposer: None,
        }
    }

    /// Custom equality predicate; `set` with an equal candidate is rejected.
    pub fn eq(mut self, eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.eq = Some(Arc::new(eq));
        self
    }

    /// Use `PartialEq` as the equality predicate.
    pub fn eq_partial(self) -> Self
    where
        T: PartialEq,
    {
        self.eq(|l, r| l == r)
    }

    /// Merge policy for accepted writes: `(old, new) -> stored`.
    pub fn setter(mut self, setter: impl Fn(T, T) -> T + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Disposer invoked for superseded and rejected values.
    pub fn disposer(mut self, disposer: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    pub fn build(self) -> Value<T> {
        Value {
            inner: Arc::new(ValueCore::new(
                self.name,
                Cell::Computed(self.value),
                self.eq,
                self.setter,
                self.disposer,
            )),
        }
    }
}

/// A mutable observable cell. Clones share state.
pub struct Value<T> {
    inner: Arc<ValueCore<T>>,
}

impl<T> Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a value with default policies.
    pub fn new(name: impl Into<String>, value: T) -> Self {
        ValueBuilder::new(name, value).build()
    }

    /// Type-erased shared handle, for wiring into transforms and tuples.
    pub fn as_source(&self) -> SharedSource<T> {
        Arc::new(self.clone())
    }

    /// Replace the value unless `eq` judges it unchanged.
    pub fn set(&self, value: T) {
        trace!(name = self.inner.name(), "value set");
        self.inner.set(value);
    }

    /// Functional update through `set`.
    pub fn mod_value(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.get());
        self.set(next);
    }

    /// Clone-mutate-store update through `set`.
    pub fn mod_in_place(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.inner.get();
        f(&mut next);
        self.set(next);
    }

    /// Apply an async mutation, racing the version stamp. If the stamp moved
    /// while the future was pending, the candidate is disposed and `false`
    /// is returned; otherwise the candidate is applied via the same
    /// dispose-if-equal policy as `set` and `true` is returned.
    pub async fn set_future_or_dispose<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = T>,
    {
        let start_mods = self.inner.mods();
        let candidate = f(self.inner.get()).await;
        if self.inner.mods() != start_mods {
            self.inner.dispose_candidate(&candidate);
            false
        } else {
            self.inner.set_or_dispose(candidate);
            true
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    /// Explicit teardown; fails while subscribers remain.
    pub fn dispose(&self) -> Result<(), ReactiveError> {
        self.inner.dispose()
    }
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Source<T> for Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self) -> T {
        self.inner.get()
    }

    fn mods(&self) -> u64 {
        self.inner.mods()
    }

    fn subscribe(&self, cb: ChangeCallback<T>, last_mods: Option<u64>) -> Disconnector {
        let key = self.inner.add_handler(cb, last_mods);
        let weak: Weak<ValueCore<T>> = Arc::downgrade(&self.inner);
        Disconnector::new(move || {
            if let Some(core) = weak.upgrade() {
                core.remove_handler(key);
            }
        })
    }

    fn depends_on(&self, _id: u64) -> bool {
        // Plain values are terminal nodes.
        false
    }
}

impl<T> Disposable for Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.id()
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        Value::dispose(self)
    }
}

impl<T> std::fmt::Debug for Value<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("name", &self.inner.name())
            .field("mods", &self.inner.mods())
            .field("subscribers", &self.inner.subscriber_count())
            .finish()
    }
}
