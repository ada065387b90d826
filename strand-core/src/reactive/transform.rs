//! Transform Value Implementation
//!
//! A [`TransformValue`] is a derived cell recomputed from one upstream
//! [`Source`] by a pure transformer. It picks its evaluation mode
//! automatically:
//!
//! - *Active* (at least one subscriber): the first subscription actualizes
//!   the cell and subscribes to the upstream, so recomputation happens
//!   eagerly on every upstream notification.
//!
//! - *Lazy* (no subscribers): recomputation is deferred until `get()` or
//!   `mods()` is called, and runs only if the cached upstream stamp differs
//!   from the current one. A value nobody observes is never recomputed.
//!
//! The cell starts [`Cell::Uncomputed`], which is a distinct state rather
//! than a sentinel value, so the first computed result always lands even
//! for transformers whose output equals a default.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::ReactiveError;
use crate::reactive::source::{
    Cell, ChangeCallback, Disconnector, Disposable, Disposer, EqPredicate, SharedSource, Source,
    ValueCore,
};

type Transformer<S, D> = Arc<dyn Fn(S, Option<D>) -> D + Send + Sync>;

pub(crate) struct TransformInner<S, D> {
    core: ValueCore<D>,
    source: SharedSource<S>,
    transformer: Transformer<S, D>,
    last_src_mods: Mutex<Option<u64>>,
    upstream: Mutex<Option<Disconnector>>,
}

/// A derived value over one upstream source. Clones share state.
pub struct TransformValue<S, D> {
    inner: Arc<TransformInner<S, D>>,
}

impl<S, D> Clone for TransformValue<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, D> TransformValue<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Derive from `source` with a pure transformer. The cell starts
    /// uncomputed and fills on first read or first subscription.
    pub fn new(
        name: impl Into<String>,
        source: SharedSource<S>,
        transformer: impl Fn(S) -> D + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, source, Cell::Uncomputed, None, None, move |s, _| {
            transformer(s)
        })
    }

    /// Derive with an explicit initial value and a transformer that also
    /// sees the previous output. Used for accumulating or clamping
    /// derivations (for example monotonic progress).
    pub fn new_self(
        name: impl Into<String>,
        source: SharedSource<S>,
        initial: D,
        transformer: impl Fn(S, D) -> D + Send + Sync + 'static,
    ) -> Self {
        let seed = initial.clone();
        Self::build(
            name,
            source,
            Cell::Computed(initial),
            None,
            None,
            move |s, prev| transformer(s, prev.unwrap_or_else(|| seed.clone())),
        )
    }

    /// Derive with explicit equality and disposer policy for the computed
    /// value.
    pub fn with_policy(
        name: impl Into<String>,
        source: SharedSource<S>,
        eq: Option<EqPredicate<D>>,
        disposer: Option<Disposer<D>>,
        transformer: impl Fn(S) -> D + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, source, Cell::Uncomputed, eq, disposer, move |s, _| {
            transformer(s)
        })
    }

    pub(crate) fn build(
        name: impl Into<String>,
        source: SharedSource<S>,
        cell: Cell<D>,
        eq: Option<EqPredicate<D>>,
        disposer: Option<Disposer<D>>,
        transformer: impl Fn(S, Option<D>) -> D + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(TransformInner {
                core: ValueCore::new(name.into(), cell, eq, None, disposer),
                source,
                transformer: Arc::new(transformer),
                last_src_mods: Mutex::new(None),
                upstream: Mutex::new(None),
            }),
        }
    }

    pub fn as_source(&self) -> SharedSource<D> {
        Arc::new(self.clone())
    }

    /// Overwrite the derived value directly. Mostly used by owners that
    /// treat the transform as a writable slot (for example progress info).
    pub fn set(&self, value: D) {
        self.inner.core.set(value);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    pub fn dispose(&self) -> Result<(), ReactiveError> {
        self.inner.core.dispose()
    }
}

impl<S, D> TransformInner<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Recompute from an upstream snapshot and record its stamp.
    fn apply(&self, src_value: S, src_mods: u64) {
        trace!(name = self.core.name(), src_mods, "transform recompute");
        let prev = self.core.cell_value();
        let next = (self.transformer)(src_value, prev);
        self.core.set_or_dispose(next);
        *self.last_src_mods.lock() = Some(src_mods);
    }

    /// Lazy path: recompute only when unobserved-and-stale or never
    /// computed. With subscribers the cell is kept fresh eagerly.
    fn actualize(&self) {
        if self.core.has_subscribers() && self.core.is_computed() {
            return;
        }
        let src_mods = self.source.mods();
        if *self.last_src_mods.lock() != Some(src_mods) {
            self.apply(self.source.get(), src_mods);
        }
    }

    fn first_subscribe(self: &Arc<Self>) {
        self.actualize();
        let weak: Weak<TransformInner<S, D>> = Arc::downgrade(self);
        let last = *self.last_src_mods.lock();
        let disc = self.source.subscribe(
            Arc::new(move |v: &S, mods| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply(v.clone(), mods);
                }
            }),
            last,
        );
        *self.upstream.lock() = Some(disc);
    }

    fn last_disconnect(&self) {
        if let Some(disc) = self.upstream.lock().take() {
            disc.disconnect();
        }
    }
}

impl<S, D> Source<D> for TransformValue<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.core.id()
    }

    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn get(&self) -> D {
        self.inner.actualize();
        self.inner.core.get()
    }

    fn mods(&self) -> u64 {
        self.inner.actualize();
        self.inner.core.mods()
    }

    fn subscribe(&self, cb: ChangeCallback<D>, last_mods: Option<u64>) -> Disconnector {
        if !self.inner.core.has_subscribers() {
            self.inner.first_subscribe();
        }
        let key = self.inner.core.add_handler(cb, last_mods);
        let weak = Arc::downgrade(&self.inner);
        Disconnector::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.core.remove_handler(key) == 0 {
                    inner.last_disconnect();
                }
            }
        })
    }

    fn depends_on(&self, id: u64) -> bool {
        self.inner.source.id() == id || self.inner.source.depends_on(id)
    }
}

impl<S, D> Disposable for TransformValue<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.core.id()
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        TransformValue::dispose(self)
    }
}

impl<S, D> std::fmt::Debug for TransformValue<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformValue")
            .field("name", &self.inner.core.name())
            .field("mods", &self.inner.core.mods())
            .field("subscribers", &self.inner.core.subscriber_count())
            .finish()
    }
}
