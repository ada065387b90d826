//! Async Transform Value Implementation
//!
//! Like [`TransformValue`](crate::reactive::TransformValue), but the
//! transformer is asynchronous. Every reload carries a monotonically
//! increasing request id; when a reload resolves after a newer one has
//! already started, its result is disposed instead of applied. The newest
//! request always wins, regardless of resolution order.
//!
//! Lazy reads cannot await, so `get()`/`mods()` on a stale cell spawn the
//! reload on the current tokio runtime (when one exists) and return the
//! cached value; [`TransformValueAsync::force_reload`] is the deterministic,
//! awaitable path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::ReactiveError;
use crate::reactive::source::{
    Cell, ChangeCallback, Disconnector, Disposable, Disposer, SharedSource, Source, ValueCore,
};

type AsyncTransformer<S, D> = Arc<dyn Fn(S) -> BoxFuture<'static, D> + Send + Sync>;

pub(crate) struct TransformAsyncInner<S, D> {
    core: ValueCore<D>,
    source: SharedSource<S>,
    transformer: AsyncTransformer<S, D>,
    last_src_mods: Mutex<Option<u64>>,
    request: AtomicU64,
    upstream: Mutex<Option<Disconnector>>,
}

/// An asynchronously derived value. Clones share state.
pub struct TransformValueAsync<S, D> {
    inner: Arc<TransformAsyncInner<S, D>>,
}

impl<S, D> Clone for TransformValueAsync<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, D> TransformValueAsync<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Derive with an uncomputed cell; the first read or subscription
    /// triggers the initial reload.
    pub fn new(
        name: impl Into<String>,
        source: SharedSource<S>,
        transformer: impl Fn(S) -> BoxFuture<'static, D> + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, source, Cell::Uncomputed, None, None, transformer)
    }

    /// Derive with an already-computed initial value stamped against the
    /// upstream version it was computed from.
    pub fn with_initial(
        name: impl Into<String>,
        source: SharedSource<S>,
        initial: D,
        initial_src_mods: u64,
        disposer: Option<Disposer<D>>,
        transformer: impl Fn(S) -> BoxFuture<'static, D> + Send + Sync + 'static,
    ) -> Self {
        let t = Self::build(
            name,
            source,
            Cell::Computed(initial),
            None,
            disposer,
            transformer,
        );
        *t.inner.last_src_mods.lock() = Some(initial_src_mods);
        t
    }

    fn build(
        name: impl Into<String>,
        source: SharedSource<S>,
        cell: Cell<D>,
        eq: Option<crate::reactive::source::EqPredicate<D>>,
        disposer: Option<Disposer<D>>,
        transformer: impl Fn(S) -> BoxFuture<'static, D> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(TransformAsyncInner {
                core: ValueCore::new(name.into(), cell, eq, None, disposer),
                source,
                transformer: Arc::new(transformer),
                last_src_mods: Mutex::new(None),
                request: AtomicU64::new(0),
                upstream: Mutex::new(None),
            }),
        }
    }

    pub fn as_source(&self) -> SharedSource<D> {
        Arc::new(self.clone())
    }

    /// Reload from the current upstream value and wait for the result to be
    /// applied (or discarded, if a newer reload started meanwhile).
    pub async fn force_reload(&self) {
        let src = self.inner.source.get();
        let mods = self.inner.source.mods();
        self.inner.reload(src, mods).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    /// Teardown. Bumps the request id first so an in-flight reload can
    /// never resurrect the disposed value.
    pub fn dispose(&self) -> Result<(), ReactiveError> {
        self.inner.request.fetch_add(1, Ordering::SeqCst);
        self.inner.core.dispose()
    }
}

impl<S, D> TransformAsyncInner<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Claim the next request id and stamp the upstream version this reload
    /// answers. Ids are claimed synchronously in notification order, so a
    /// later reload outranks an earlier one even when their futures resolve
    /// out of order.
    fn begin_reload(&self, src_mods: u64) -> u64 {
        let id = self.request.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_src_mods.lock() = Some(src_mods);
        id
    }

    async fn finish_reload(&self, id: u64, src_value: S) {
        let next = (self.transformer)(src_value).await;
        if self.request.load(Ordering::SeqCst) != id {
            trace!(name = self.core.name(), id, "stale async reload discarded");
            self.core.dispose_candidate(&next);
        } else {
            self.core.set_or_dispose(next);
        }
    }

    async fn reload(&self, src_value: S, src_mods: u64) {
        let id = self.begin_reload(src_mods);
        self.finish_reload(id, src_value).await;
    }

    fn spawn_reload(self: &Arc<Self>, src_value: S, src_mods: u64) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let id = self.begin_reload(src_mods);
            let inner = Arc::clone(self);
            handle.spawn(async move {
                inner.finish_reload(id, src_value).await;
            });
        }
    }

    /// Lazy path: kick off a reload for a stale cell. The caller keeps the
    /// cached value until the reload lands.
    fn actualize(self: &Arc<Self>) {
        if self.core.has_subscribers() && self.core.is_computed() {
            return;
        }
        let src_mods = self.source.mods();
        if *self.last_src_mods.lock() != Some(src_mods) {
            self.spawn_reload(self.source.get(), src_mods);
        }
    }

    fn first_subscribe(self: &Arc<Self>) {
        self.actualize();
        let weak: Weak<TransformAsyncInner<S, D>> = Arc::downgrade(self);
        let last = *self.last_src_mods.lock();
        let disc = self.source.subscribe(
            Arc::new(move |v: &S, mods| {
                if let Some(inner) = weak.upgrade() {
                    inner.spawn_reload(v.clone(), mods);
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

impl<S, D> Source<D> for TransformValueAsync<S, D>
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

impl<S, D> Disposable for TransformValueAsync<S, D>
where
    S: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.core.id()
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        TransformValueAsync::dispose(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::value::Value;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn force_reload_applies_transformed_value() {
        let src = Value::new("src", 3);
        let t = TransformValueAsync::new("t", src.as_source(), |x: i32| {
            Box::pin(async move { x * 2 })
        });

        t.force_reload().await;
        assert_eq!(t.inner.core.get(), 6);
    }

    #[tokio::test]
    async fn with_initial_skips_reload_for_unchanged_upstream() {
        let count = Arc::new(AtomicI32::new(0));
        let count2 = count.clone();
        let src = Value::new("src", 3);
        let t = TransformValueAsync::with_initial(
            "t",
            src.as_source(),
            6,
            src.mods(),
            None,
            move |x: i32| {
                count2.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { x * 2 })
            },
        );

        assert_eq!(t.get(), 6);
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_reload_is_discarded() {
        let src = Value::new("src", 0);
        let disposed = Arc::new(StdMutex::new(Vec::new()));
        let disposed2 = disposed.clone();

        // First reload parks on a gate until released; second resolves
        // immediately.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate_rx = Arc::new(StdMutex::new(Some(gate_rx)));
        let gate_rx2 = gate_rx.clone();

        let t = TransformValueAsync::with_initial(
            "t",
            src.as_source(),
            -1,
            src.mods(),
            Some(Arc::new(move |v: &i32| {
                disposed2.lock().unwrap().push(*v);
            }) as Disposer<i32>),
            move |x: i32| {
                let gate = gate_rx2.lock().unwrap().take();
                Box::pin(async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    x * 10
                })
            },
        );

        src.set(1);
        let slow = {
            let t = t.clone();
            tokio::spawn(async move { t.force_reload().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        src.set(2);
        t.force_reload().await;
        assert_eq!(t.inner.core.get(), 20);

        let _ = gate_tx.send(());
        slow.await.unwrap();

        // The first reload resolved late: its result was disposed, the
        // observable value stayed at the newer one.
        assert_eq!(t.inner.core.get(), 20);
        assert_eq!(*disposed.lock().unwrap(), vec![-1, 10]);
    }

    #[tokio::test]
    async fn notifications_claim_reload_ids_in_order() {
        let src = Value::new("src", 0);
        let t = TransformValueAsync::new("t", src.as_source(), |x: i32| {
            Box::pin(async move { x })
        });
        let disc = t.subscribe(Arc::new(|_: &i32, _| {}), None);

        // The subscription spawns the initial reload.
        assert_eq!(t.inner.request.load(Ordering::SeqCst), 1);
        src.set(1);
        src.set(2);
        // Ids are claimed at notification time, before any reload future has
        // run, so the last notification always wins.
        assert_eq!(t.inner.request.load(Ordering::SeqCst), 3);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(t.inner.core.get(), 2);
        disc.disconnect();
    }

    #[tokio::test]
    async fn active_mode_reloads_on_upstream_change() {
        let src = Value::new("src", 1);
        let t = TransformValueAsync::new("t", src.as_source(), |x: i32| {
            Box::pin(async move { x + 100 })
        });

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = t.subscribe(
            Arc::new(move |v: &i32, _| seen2.lock().unwrap().push(*v)),
            None,
        );

        // Initial lazy reload was spawned by the subscription.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        src.set(2);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(t.inner.core.get(), 102);
        assert!(seen.lock().unwrap().contains(&102));
        disc.disconnect();
    }

    #[tokio::test]
    async fn dispose_invalidates_in_flight_reload() {
        let src = Value::new("src", 1);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate_rx = Arc::new(StdMutex::new(Some(gate_rx)));
        let gate_rx2 = gate_rx.clone();

        let t = TransformValueAsync::new("t", src.as_source(), move |x: i32| {
            let gate = gate_rx2.lock().unwrap().take();
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                x
            })
        });

        let pending = {
            let t = t.clone();
            tokio::spawn(async move { t.force_reload().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        t.dispose().unwrap();
        let _ = gate_tx.send(());
        pending.await.unwrap();

        // The late result was discarded; the cell stays uncomputed.
        assert!(t.inner.core.cell_value().is_none());
    }
}
