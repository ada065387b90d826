//! Values Container Implementation
//!
//! A [`ValuesContainer`] is a disposal scope: every cell created through its
//! factory methods becomes a node in an internal [`DirectionalGraph`], and
//! each factory records an edge `derived -> source` whenever the source
//! lives in the same container. Teardown walks the graph descendants-first,
//! so a derived value is always disposed before the source it was computed
//! from.
//!
//! Containers form a tree. Disposing a container disposes its children
//! first, then its own nodes. Registering a child under an already-used name
//! disposes the previous child before replacing it.
//!
//! `dispose()` is deferred by one scheduling round so a teardown triggered
//! from inside a change notification cannot reenter the graph mid-mutation;
//! [`ValuesContainer::dispose_now`] is the immediate synchronous form.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::ReactiveError;
use crate::graph::DirectionalGraph;
use crate::reactive::proxy::ProxyValue;
use crate::reactive::source::{
    next_source_id, ChangeCallback, ConstSource, Disconnector, Disposable, Disposer, SharedSource,
    Source,
};
use crate::reactive::transform::TransformValue;
use crate::reactive::transform_async::TransformValueAsync;
use crate::reactive::tuple::Tuple;
use crate::reactive::value::{Value, ValueBuilder};

/// One cached tuple: the slot ids in requested order plus the type-erased
/// [`Tuple`] handle.
struct TupleCacheEntry {
    ids: Vec<u64>,
    erased: Arc<dyn Any + Send + Sync>,
}

struct ContainerState {
    graph: DirectionalGraph<u64>,
    nodes: HashMap<u64, Arc<dyn Disposable>>,
    children: IndexMap<String, ValuesContainer>,
    tuple_cache: Vec<TupleCacheEntry>,
    disposed: bool,
}

struct ContainerInner {
    name: String,
    state: Mutex<ContainerState>,
}

/// A disposal scope owning reactive cells and the dependency graph among
/// them. Clones share state.
pub struct ValuesContainer {
    inner: Arc<ContainerInner>,
}

impl Clone for ValuesContainer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ValuesContainer {
    /// Create an owning root scope.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                name: name.into(),
                state: Mutex::new(ContainerState {
                    graph: DirectionalGraph::new(),
                    nodes: HashMap::new(),
                    children: IndexMap::new(),
                    tuple_cache: Vec::new(),
                    disposed: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of owned graph nodes (children not included).
    pub fn len(&self) -> usize {
        self.inner.state.lock().graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create (or replace) a child scope. A previous child under the same
    /// name is disposed before the new one takes its slot.
    pub fn child(&self, name: impl Into<String>) -> ValuesContainer {
        let name = name.into();
        debug!(container = self.inner.name, child = name, "create child scope");
        let fresh = ValuesContainer::root(name.clone());
        let prev = self
            .inner
            .state
            .lock()
            .children
            .insert(name, fresh.clone());
        if let Some(prev) = prev {
            prev.dispose_deferred();
        }
        fresh
    }

    // -- registration --------------------------------------------------

    fn register(&self, node: Arc<dyn Disposable>) {
        let mut state = self.inner.state.lock();
        state.graph.add_node(node.node_id());
        state.nodes.insert(node.node_id(), node);
    }

    /// Add a `dependent -> dependency` edge when the dependency is itself a
    /// member of this container.
    fn link_if_member(&self, dependent: u64, dependency: u64) {
        let mut state = self.inner.state.lock();
        if state.graph.contains(dependency) {
            state.graph.add(dependent, dependency);
        }
    }

    /// Register an externally built disposable.
    pub fn add_disposable(&self, node: Arc<dyn Disposable>) {
        self.register(node);
    }

    /// Own a disconnector: it runs when the container is disposed.
    pub fn add_disconnector(&self, disc: Disconnector) {
        self.register(Arc::new(DisconnectorNode::new(disc)));
    }

    /// Declare an explicit cross-cell dependency between two member nodes.
    /// Fails if the edge would close a cycle.
    pub fn bind(&self, dependent: u64, dependency: u64) -> Result<(), ReactiveError> {
        let mut state = self.inner.state.lock();
        state.graph.add(dependent, dependency);
        if state.graph.find_cycle().is_some() {
            state.graph.remove_edge(dependent, dependency);
            return Err(ReactiveError::CyclicBinding);
        }
        Ok(())
    }

    // -- factories -----------------------------------------------------

    /// An immutable source owned by this scope.
    pub fn constant<T>(
        &self,
        name: impl Into<String>,
        value: T,
        disposer: Option<Disposer<T>>,
    ) -> SharedSource<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let src = ConstSource::new(name, value, disposer);
        self.register(Arc::new(src.clone()));
        src.as_source()
    }

    /// A mutable cell owned by this scope.
    pub fn value<T>(&self, name: impl Into<String>, initial: T) -> Value<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.value_with(ValueBuilder::new(name, initial))
    }

    /// A mutable cell with explicit equality/setter/disposer policy.
    pub fn value_with<T>(&self, builder: ValueBuilder<T>) -> Value<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let v = builder.build();
        self.register(Arc::new(v.clone()));
        v
    }

    /// A cell mirroring externally owned state: pulled at construction,
    /// re-pulled whenever the external signal fires while subscribed.
    pub fn proxied<T>(
        &self,
        name: impl Into<String>,
        puller: impl Fn() -> T + Send + Sync + 'static,
        connector: impl Fn(Arc<dyn Fn() + Send + Sync>) -> Disconnector + Send + Sync + 'static,
    ) -> ProxyValue<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let p = ProxyValue::new(name, puller, connector);
        self.register(Arc::new(p.clone()));
        p
    }

    /// A synchronously derived cell; starts uncomputed.
    pub fn transformed<S, D>(
        &self,
        name: impl Into<String>,
        source: SharedSource<S>,
        transformer: impl Fn(S) -> D + Send + Sync + 'static,
    ) -> TransformValue<S, D>
    where
        S: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let src_id = source.id();
        let t = TransformValue::new(name, source, transformer);
        self.register(Arc::new(t.clone()));
        self.link_if_member(Source::id(&t), src_id);
        t
    }

    /// [`ValuesContainer::transformed`] with explicit equality and disposer
    /// policy for the derived value.
    pub fn transformed_with<S, D>(
        &self,
        name: impl Into<String>,
        source: SharedSource<S>,
        eq: Option<crate::reactive::source::EqPredicate<D>>,
        disposer: Option<Disposer<D>>,
        transformer: impl Fn(S) -> D + Send + Sync + 'static,
    ) -> TransformValue<S, D>
    where
        S: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let src_id = source.id();
        let t = TransformValue::with_policy(name, source, eq, disposer, transformer);
        self.register(Arc::new(t.clone()));
        self.link_if_member(Source::id(&t), src_id);
        t
    }

    /// Projects a part out of a composite source. Sugar over
    /// [`ValuesContainer::transformed_with`] with `PartialEq` change
    /// suppression, so observers only fire when the projected part differs.
    pub fn projected<S, D>(
        &self,
        name: impl Into<String>,
        source: SharedSource<S>,
        projector: impl Fn(S) -> D + Send + Sync + 'static,
    ) -> TransformValue<S, D>
    where
        S: Clone + Send + Sync + 'static,
        D: Clone + PartialEq + Send + Sync + 'static,
    {
        self.transformed_with(
            name,
            source,
            Some(Arc::new(|a: &D, b: &D| a == b)
                as crate::reactive::source::EqPredicate<D>),
            None,
            projector,
        )
    }

    /// A synchronously derived cell that folds its own previous value.
    pub fn transformed_self<S, D>(
        &self,
        name: impl Into<String>,
        source: SharedSource<S>,
        initial: D,
        transformer: impl Fn(S, D) -> D + Send + Sync + 'static,
    ) -> TransformValue<S, D>
    where
        S: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let src_id = source.id();
        let t = TransformValue::new_self(name, source, initial, transformer);
        self.register(Arc::new(t.clone()));
        self.link_if_member(Source::id(&t), src_id);
        t
    }

    /// A derived cell over the joined value of several same-typed sources.
    pub fn transformed_tuple<T, D>(
        &self,
        name: impl Into<String>,
        sources: Vec<SharedSource<T>>,
        transformer: impl Fn(Vec<T>) -> D + Send + Sync + 'static,
    ) -> Result<TransformValue<Vec<T>, D>, ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let joined = self.tuple(sources)?;
        Ok(self.transformed(name, joined, transformer))
    }

    pub fn transformed_self_tuple<T, D>(
        &self,
        name: impl Into<String>,
        sources: Vec<SharedSource<T>>,
        initial: D,
        transformer: impl Fn(Vec<T>, D) -> D + Send + Sync + 'static,
    ) -> Result<TransformValue<Vec<T>, D>, ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let joined = self.tuple(sources)?;
        Ok(self.transformed_self(name, joined, initial, transformer))
    }

    /// An asynchronously derived cell. The initial value is computed (and
    /// awaited) here, so the cell is never observed uncomputed.
    pub async fn transformed_async<S, D>(
        &self,
        name: impl Into<String>,
        source: SharedSource<S>,
        transformer: impl Fn(S) -> BoxFuture<'static, D> + Send + Sync + 'static,
        disposer: Option<Disposer<D>>,
    ) -> TransformValueAsync<S, D>
    where
        S: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let src_id = source.id();
        let initial = transformer(source.get()).await;
        let initial_mods = source.mods();
        let t = TransformValueAsync::with_initial(
            name,
            source,
            initial,
            initial_mods,
            disposer,
            transformer,
        );
        self.register(Arc::new(t.clone()));
        self.link_if_member(Source::id(&t), src_id);
        t
    }

    pub async fn transformed_async_tuple<T, D>(
        &self,
        name: impl Into<String>,
        sources: Vec<SharedSource<T>>,
        transformer: impl Fn(Vec<T>) -> BoxFuture<'static, D> + Send + Sync + 'static,
        disposer: Option<Disposer<D>>,
    ) -> Result<TransformValueAsync<Vec<T>, D>, ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let joined = self.tuple(sources)?;
        Ok(self
            .transformed_async(name, joined, transformer, disposer)
            .await)
    }

    /// Join several sources into one cached tuple source. The cache holds at
    /// most one tuple per exact ordered slot set: the same slots requested
    /// again return the identical tuple, the same slots in a different order
    /// are a consistency error.
    pub fn tuple<T>(
        &self,
        sources: Vec<SharedSource<T>>,
    ) -> Result<SharedSource<Vec<T>>, ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let ids: Vec<u64> = sources.iter().map(|s| s.id()).collect();
        {
            let deduped: std::collections::HashSet<u64> = ids.iter().copied().collect();
            if deduped.len() != ids.len() {
                return Err(ReactiveError::DuplicateTupleSources);
            }
        }

        let mut state = self.inner.state.lock();
        for entry in &state.tuple_cache {
            if entry.ids == ids {
                if let Some(cached) = entry.erased.downcast_ref::<Tuple<T>>() {
                    return Ok(cached.as_source());
                }
                return Err(ReactiveError::TupleOrderMismatch);
            }
            if entry.ids.len() == ids.len() && ids.iter().all(|id| entry.ids.contains(id)) {
                return Err(ReactiveError::TupleOrderMismatch);
            }
        }

        let name = format!(
            "tuple({})",
            sources
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let tuple = Tuple::new(name, sources);
        let tuple_id = Source::id(&tuple);
        state.tuple_cache.push(TupleCacheEntry {
            ids: ids.clone(),
            erased: Arc::new(tuple.clone()),
        });
        state.graph.add_node(tuple_id);
        state
            .nodes
            .insert(tuple_id, Arc::new(tuple.clone()) as Arc<dyn Disposable>);
        for slot in tuple.sources() {
            if state.graph.contains(slot.id()) {
                state.graph.add(tuple_id, slot.id());
            }
        }
        Ok(tuple.as_source())
    }

    // -- subscriptions -------------------------------------------------

    /// Subscribe a callback whose disconnector is owned by this scope: it is
    /// disconnected during disposal, before the source itself is torn down.
    pub fn subscribed<T>(&self, source: &SharedSource<T>, cb: ChangeCallback<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let disc = source.subscribe(cb, None);
        let node = Arc::new(DisconnectorNode::new(disc));
        let node_id = node.node_id();
        self.register(node);
        self.link_if_member(node_id, source.id());
    }

    /// Join the sources, invoke the handler once with the current joined
    /// value, then keep invoking it on changes. The caller owns the
    /// disconnector.
    pub fn handle<T>(
        &self,
        sources: Vec<SharedSource<T>>,
        handler: impl Fn(&Vec<T>) + Send + Sync + 'static,
    ) -> Result<Disconnector, ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let joined = self.tuple(sources)?;
        handler(&joined.get());
        Ok(joined.subscribe(Arc::new(move |v: &Vec<T>, _| handler(v)), None))
    }

    /// Like [`ValuesContainer::handle`], but the subscription is owned by
    /// this scope instead of the caller.
    pub fn handle_standalone<T>(
        &self,
        sources: Vec<SharedSource<T>>,
        handler: impl Fn(&Vec<T>) + Send + Sync + 'static,
    ) -> Result<(), ReactiveError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let joined = self.tuple(sources)?;
        let joined_id = joined.id();
        handler(&joined.get());
        let disc = joined.subscribe(Arc::new(move |v: &Vec<T>, _| handler(v)), None);
        let node = Arc::new(DisconnectorNode::new(disc));
        let node_id = node.node_id();
        self.register(node);
        self.link_if_member(node_id, joined_id);
        Ok(())
    }

    /// A bare multicast signal owned by this scope. Disposal fails while
    /// connections remain, like any subscribed cell.
    pub fn signal<T>(&self, name: impl Into<String>) -> Signal<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let signal = Signal::new(name);
        self.register(Arc::new(signal.clone()));
        signal
    }

    // -- lifecycle -----------------------------------------------------

    /// Run scoped setup; on failure the container (and everything created so
    /// far) is disposed before the error is handed back.
    pub fn initialize<T, E>(
        &self,
        init: impl FnOnce(&ValuesContainer) -> Result<T, E>,
    ) -> Result<T, E> {
        match init(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Err(err) = self.dispose_now() {
                    warn!(container = self.inner.name, error = %err, "dispose after failed init");
                }
                Err(e)
            }
        }
    }

    pub async fn initialize_async<T, E, Fut>(
        &self,
        init: impl FnOnce(ValuesContainer) -> Fut,
    ) -> Result<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        match init(self.clone()).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Err(err) = self.dispose_now() {
                    warn!(container = self.inner.name, error = %err, "dispose after failed init");
                }
                Err(e)
            }
        }
    }

    /// Deferred teardown: yields one scheduling round first, so a dispose
    /// triggered inside a notification handler never reenters the graph
    /// mid-mutation.
    pub async fn dispose(&self) -> Result<(), ReactiveError> {
        tokio::task::yield_now().await;
        self.dispose_now()
    }

    /// Fire-and-forget deferred teardown; falls back to immediate teardown
    /// when no runtime is driving.
    pub(crate) fn dispose_deferred(&self) {
        let this = self.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = this.dispose().await {
                    warn!(container = this.inner.name, error = %err, "deferred dispose failed");
                }
            });
        } else if let Err(err) = self.dispose_now() {
            warn!(container = self.inner.name, error = %err, "dispose failed");
        }
    }

    /// Immediate teardown: children first (recursively), then own nodes in
    /// dependency order. Idempotent; fails on the first node that refuses to
    /// dispose (for example one with live external subscribers).
    pub fn dispose_now(&self) -> Result<(), ReactiveError> {
        // Take everything out under the lock, dispose outside it, so node
        // disposers may touch other containers without deadlocking.
        let (children, ordered) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            let children: Vec<ValuesContainer> =
                state.children.drain(..).map(|(_, c)| c).collect();
            let order = state.graph.ordered_all();
            let ordered: Vec<Arc<dyn Disposable>> = order
                .into_iter()
                .filter_map(|id| state.nodes.remove(&id))
                .collect();
            state.graph.clear();
            state.tuple_cache.clear();
            (children, ordered)
        };
        debug!(
            container = self.inner.name,
            children = children.len(),
            nodes = ordered.len(),
            "dispose scope"
        );
        for child in children {
            child.dispose_now()?;
        }
        for node in ordered {
            node.dispose()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ValuesContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ValuesContainer")
            .field("name", &self.inner.name)
            .field("nodes", &state.graph.len())
            .field("children", &state.children.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Container node wrapping a subscription disconnector.
struct DisconnectorNode {
    id: u64,
    disc: Mutex<Option<Disconnector>>,
}

impl DisconnectorNode {
    fn new(disc: Disconnector) -> Self {
        Self {
            id: next_source_id(),
            disc: Mutex::new(Some(disc)),
        }
    }
}

impl Disposable for DisconnectorNode {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        if let Some(disc) = self.disc.lock().take() {
            disc.disconnect();
        }
        Ok(())
    }
}

type SignalHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    id: u64,
    name: String,
    handlers: RwLock<Vec<(u64, SignalHandler<T>)>>,
    next_handler: AtomicU64,
}

/// A plain multicast callback list with no value or version stamp. Clones
/// share state.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: next_source_id(),
                name: name.into(),
                handlers: RwLock::new(Vec::new()),
                next_handler: AtomicU64::new(0),
            }),
        }
    }

    pub fn connect(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Disconnector {
        let key = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push((key, Arc::new(handler)));
        let weak = Arc::downgrade(&self.inner);
        Disconnector::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.write().retain(|(k, _)| *k != key);
            }
        })
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<SignalHandler<T>> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

impl<T> Disposable for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.id
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        if !self.inner.handlers.read().is_empty() {
            return Err(ReactiveError::DisposeWhileSubscribed {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::source::callback;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn factories_register_nodes() {
        let c = ValuesContainer::root("root");
        let _a = c.value("a", 1);
        let _k = c.constant("k", 2, None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn tuple_cache_returns_identical_source() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let b = c.value("b", 2);

        let t1 = c.tuple(vec![a.as_source(), b.as_source()]).unwrap();
        let t2 = c.tuple(vec![a.as_source(), b.as_source()]).unwrap();
        assert_eq!(t1.id(), t2.id());
    }

    #[test]
    fn tuple_same_set_different_order_is_an_error() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let b = c.value("b", 2);

        c.tuple(vec![a.as_source(), b.as_source()]).unwrap();
        let err = c.tuple(vec![b.as_source(), a.as_source()]).err().unwrap();
        assert_eq!(err, ReactiveError::TupleOrderMismatch);
    }

    #[test]
    fn tuple_duplicate_sources_is_an_error() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let err = c.tuple(vec![a.as_source(), a.as_source()]).err().unwrap();
        assert_eq!(err, ReactiveError::DuplicateTupleSources);
    }

    #[test]
    fn proxied_value_follows_external_signal() {
        let c = ValuesContainer::root("root");
        let signal = c.signal::<()>("ext-change");
        let backing = Arc::new(AtomicI32::new(1));

        let b = backing.clone();
        let sig = signal.clone();
        let p = c.proxied(
            "mirror",
            move || b.load(Ordering::SeqCst),
            move |wake| sig.connect(move |_: &()| wake()),
        );
        assert_eq!(p.get(), 1);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = p.subscribe(
            callback(move |v: &i32, _| seen2.lock().unwrap().push(*v)),
            Some(p.mods()),
        );

        backing.store(7, Ordering::SeqCst);
        signal.emit(&());
        assert_eq!(p.get(), 7);
        assert_eq!(*seen.lock().unwrap(), vec![7]);

        disc.disconnect();
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn projected_suppresses_unchanged_parts() {
        let c = ValuesContainer::root("root");
        let pair = c.value("pair", (1i32, "a".to_string()));
        let left = c.projected("left", pair.as_source(), |(n, _)| n);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = left.subscribe(
            callback(move |v: &i32, _| seen2.lock().unwrap().push(*v)),
            Some(left.mods()),
        );

        pair.set((1, "b".to_string()));
        pair.set((2, "b".to_string()));
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(left.mods(), 1);
        disc.disconnect();
    }

    #[test]
    fn transformed_tuple_recomputes_with_one_notification() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let b = c.value("b", 2);
        let sum = c
            .transformed_tuple("sum", vec![a.as_source(), b.as_source()], |vs: Vec<i32>| {
                vs.iter().sum::<i32>()
            })
            .unwrap();
        assert_eq!(sum.get(), 3);

        let fired = Arc::new(AtomicI32::new(0));
        let fired2 = fired.clone();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = sum.subscribe(
            callback(move |v: &i32, _| {
                fired2.fetch_add(1, Ordering::SeqCst);
                seen2.lock().unwrap().push(*v);
            }),
            None,
        );

        a.set(10);
        assert_eq!(sum.get(), 12);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![12]);
        disc.disconnect();
    }

    #[test]
    fn dispose_now_tears_down_derivations_before_sources() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let c = ValuesContainer::root("root");

        let order_a = order.clone();
        let a = c.value_with(
            ValueBuilder::new("a", 1).disposer(move |_: &i32| order_a.lock().unwrap().push("a")),
        );
        let order_b = order.clone();
        let b = c.transformed_with(
            "b",
            a.as_source(),
            None,
            Some(Arc::new(move |_: &i32| order_b.lock().unwrap().push("b")) as Disposer<i32>),
            |x: i32| x + 1,
        );
        let order_c = order.clone();
        let cc = c.transformed_with(
            "c",
            b.as_source(),
            None,
            Some(Arc::new(move |_: &i32| order_c.lock().unwrap().push("c")) as Disposer<i32>),
            |x: i32| x + 1,
        );
        // Compute both so their disposers observe a value.
        assert_eq!(cc.get(), 3);

        c.dispose_now().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn child_replacement_disposes_previous() {
        let dropped = Arc::new(AtomicI32::new(0));
        let c = ValuesContainer::root("root");

        let child = c.child("sub");
        let dropped2 = dropped.clone();
        let _v = child.value_with(
            ValueBuilder::new("v", 1).disposer(move |_: &i32| {
                dropped2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // No runtime here, so replacement tears the old child down inline.
        let _fresh = c.child("sub");
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initialize_disposes_on_error() {
        let dropped = Arc::new(AtomicI32::new(0));
        let c = ValuesContainer::root("root");
        let dropped2 = dropped.clone();

        let result: Result<(), &str> = c.initialize(|scope| {
            let _v = scope.value_with(ValueBuilder::new("v", 1).disposer(move |_: &i32| {
                dropped2.fetch_add(1, Ordering::SeqCst);
            }));
            Err("setup failed")
        });

        assert_eq!(result, Err("setup failed"));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn bind_rejects_cycles() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let b = c.value("b", 2);
        c.bind(Source::id(&a), Source::id(&b)).unwrap();
        let err = c.bind(Source::id(&b), Source::id(&a)).unwrap_err();
        assert_eq!(err, ReactiveError::CyclicBinding);
    }

    #[test]
    fn signal_dispose_fails_while_connected() {
        let c = ValuesContainer::root("root");
        let s: Signal<i32> = c.signal("sig");

        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();
        let disc = s.connect(move |v| {
            seen2.store(*v, Ordering::SeqCst);
        });
        s.emit(&7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        assert!(c.dispose_now().is_err());
        disc.disconnect();
    }

    #[tokio::test]
    async fn deferred_dispose_runs_after_yield() {
        let dropped = Arc::new(AtomicI32::new(0));
        let c = ValuesContainer::root("root");
        let dropped2 = dropped.clone();
        let _v = c.value_with(ValueBuilder::new("v", 1).disposer(move |_: &i32| {
            dropped2.fetch_add(1, Ordering::SeqCst);
        }));

        c.dispose().await.unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_fires_immediately_then_on_change() {
        let c = ValuesContainer::root("root");
        let a = c.value("a", 1);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();

        let disc = c
            .handle(vec![a.as_source()], move |vs: &Vec<i32>| {
                seen2.lock().unwrap().push(vs[0]);
            })
            .unwrap();

        a.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        disc.disconnect();
    }
}
