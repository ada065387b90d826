//! Tuple Source Implementation
//!
//! A [`Tuple`] joins several sources of the same value type into one source
//! whose value is the `Vec` of slot values, in the caller's slot order.
//! Subscriptions are wired dependency-first (a slot that depends on another
//! is subscribed after it), so a single upstream change that ripples through
//! several slots settles into one consistent final notification.
//!
//! Each slot carries its own last-seen stamp; a rebuild copies only the
//! slots whose stamp moved.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::ReactiveError;
use crate::reactive::source::{
    Cell, ChangeCallback, Disconnector, Disposable, Disposer, EqPredicate, SharedSource, Source,
    ValueCore,
};

/// Last-seen stamp per slot; `None` until the slot has been read once.
type SlotMods = SmallVec<[Option<u64>; 4]>;

struct TupleInner<T> {
    core: ValueCore<Vec<T>>,
    // Slot order as requested; the joined value follows this order.
    sources: Vec<SharedSource<T>>,
    // Subscription order: slot indexes with dependents after dependencies.
    order: Vec<usize>,
    slot_mods: Mutex<SlotMods>,
    upstream: Mutex<Vec<Disconnector>>,
}

/// A source joining the current values of several slots. Clones share state.
pub struct Tuple<T> {
    inner: Arc<TupleInner<T>>,
}

impl<T> Clone for Tuple<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Tuple<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, sources: Vec<SharedSource<T>>) -> Self {
        Self::build(name, sources, None, None)
    }

    pub(crate) fn build(
        name: impl Into<String>,
        sources: Vec<SharedSource<T>>,
        eq: Option<EqPredicate<Vec<T>>>,
        disposer: Option<Disposer<Vec<T>>>,
    ) -> Self {
        let mut order: Vec<usize> = (0..sources.len()).collect();
        // Stable sort on the number of sibling slots each slot depends on;
        // `depends_on` is transitive, so dependents always rank above their
        // dependencies.
        order.sort_by_key(|&i| {
            sources
                .iter()
                .filter(|s| sources[i].depends_on(s.id()))
                .count()
        });
        let slot_mods: SlotMods = sources.iter().map(|_| None).collect();
        Self {
            inner: Arc::new(TupleInner {
                core: ValueCore::new(name.into(), Cell::Uncomputed, eq, None, disposer),
                sources,
                order,
                slot_mods: Mutex::new(slot_mods),
                upstream: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn as_source(&self) -> SharedSource<Vec<T>> {
        Arc::new(self.clone())
    }

    /// Slot sources in the caller's order.
    pub(crate) fn sources(&self) -> &[SharedSource<T>] {
        &self.inner.sources
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    pub fn dispose(&self) -> Result<(), ReactiveError> {
        self.inner.core.dispose()
    }
}

impl<T> TupleInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Rebuild the joined value when some slot's stamp moved, copying only
    /// the changed slots into the previous value.
    fn actualize(&self) {
        let mut changed: SmallVec<[usize; 4]> = SmallVec::new();
        {
            let mut slot_mods = self.slot_mods.lock();
            for (i, src) in self.sources.iter().enumerate() {
                let mods = src.mods();
                if slot_mods[i] != Some(mods) {
                    slot_mods[i] = Some(mods);
                    changed.push(i);
                }
            }
        }
        if !self.core.is_computed() {
            let joined: Vec<T> = self.sources.iter().map(|s| s.get()).collect();
            self.core.set_or_dispose(joined);
        } else if !changed.is_empty() {
            let mut joined = self.core.get();
            for &i in &changed {
                joined[i] = self.sources[i].get();
            }
            self.core.set_or_dispose(joined);
        }
    }

    fn first_subscribe(self: &Arc<Self>) {
        self.actualize();
        let mut upstream = self.upstream.lock();
        for &i in &self.order {
            let src = &self.sources[i];
            let weak: Weak<TupleInner<T>> = Arc::downgrade(self);
            let last = self.slot_mods.lock()[i];
            let disc = src.subscribe(
                Arc::new(move |_: &T, _| {
                    if let Some(inner) = weak.upgrade() {
                        inner.actualize();
                    }
                }),
                last,
            );
            upstream.push(disc);
        }
    }

    fn last_disconnect(&self) {
        for disc in self.upstream.lock().drain(..) {
            disc.disconnect();
        }
    }
}

impl<T> Source<Vec<T>> for Tuple<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.core.id()
    }

    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn get(&self) -> Vec<T> {
        if !self.inner.core.has_subscribers() {
            self.inner.actualize();
        }
        self.inner.core.get()
    }

    fn mods(&self) -> u64 {
        if !self.inner.core.has_subscribers() {
            self.inner.actualize();
        }
        self.inner.core.mods()
    }

    fn subscribe(&self, cb: ChangeCallback<Vec<T>>, last_mods: Option<u64>) -> Disconnector {
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
        self.inner
            .sources
            .iter()
            .any(|s| s.id() == id || s.depends_on(id))
    }
}

impl<T> Disposable for Tuple<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.core.id()
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        Tuple::dispose(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::source::callback;
    use crate::reactive::transform::TransformValue;
    use crate::reactive::value::Value;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingSource {
        inner: Value<i32>,
        gets: Arc<AtomicI32>,
    }

    impl Source<i32> for CountingSource {
        fn id(&self) -> u64 {
            Source::id(&self.inner)
        }

        fn name(&self) -> &str {
            Source::name(&self.inner)
        }

        fn get(&self) -> i32 {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get()
        }

        fn mods(&self) -> u64 {
            self.inner.mods()
        }

        fn subscribe(&self, cb: ChangeCallback<i32>, last_mods: Option<u64>) -> Disconnector {
            self.inner.subscribe(cb, last_mods)
        }

        fn depends_on(&self, id: u64) -> bool {
            self.inner.depends_on(id)
        }
    }

    #[test]
    fn joins_current_slot_values() {
        let a = Value::new("a", 1);
        let b = Value::new("b", 2);
        let t = Tuple::new("t", vec![a.as_source(), b.as_source()]);
        assert_eq!(t.get(), vec![1, 2]);
    }

    #[test]
    fn lazy_rebuild_only_when_a_slot_changed() {
        let a = Value::new("a", 1);
        let b = Value::new("b", 2);
        let t = Tuple::new("t", vec![a.as_source(), b.as_source()]);

        assert_eq!(t.get(), vec![1, 2]);
        let mods = t.mods();
        assert_eq!(t.get(), vec![1, 2]);
        assert_eq!(t.mods(), mods);

        a.set(10);
        assert_eq!(t.get(), vec![10, 2]);
        assert!(t.mods() > mods);
    }

    #[test]
    fn rebuild_reads_only_changed_slots() {
        let a = Value::new("a", 1);
        let b = Value::new("b", 2);
        let gets = Arc::new(AtomicI32::new(0));
        let counted: SharedSource<i32> = Arc::new(CountingSource {
            inner: b.clone(),
            gets: gets.clone(),
        });
        let t = Tuple::new("t", vec![a.as_source(), counted]);

        assert_eq!(t.get(), vec![1, 2]);
        let after_build = gets.load(Ordering::SeqCst);

        a.set(10);
        assert_eq!(t.get(), vec![10, 2]);
        assert_eq!(gets.load(Ordering::SeqCst), after_build);
    }

    #[test]
    fn slot_order_follows_request_order() {
        let a = Value::new("a", 2);
        let doubled = TransformValue::new("doubled", a.as_source(), |x: i32| x * 2);
        // Derived slot requested first stays first in the joined value.
        let t = Tuple::new("t", vec![doubled.as_source(), a.as_source()]);
        assert_eq!(t.get(), vec![4, 2]);
    }

    #[test]
    fn dependent_first_request_still_settles() {
        let a = Value::new("a", 1);
        let doubled = TransformValue::new("doubled", a.as_source(), |x: i32| x * 2);
        let t = Tuple::new("t", vec![doubled.as_source(), a.as_source()]);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = t.subscribe(
            callback(move |v: &Vec<i32>, _| seen2.lock().unwrap().push(v.clone())),
            None,
        );

        a.set(5);
        assert_eq!(seen.lock().unwrap().last().unwrap(), &vec![10, 5]);
        disc.disconnect();
    }

    #[test]
    fn active_tuple_notifies_with_settled_value() {
        let a = Value::new("a", 1);
        let doubled = TransformValue::new("doubled", a.as_source(), |x: i32| x * 2);
        let t = Tuple::new("t", vec![a.as_source(), doubled.as_source()]);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = t.subscribe(
            callback(move |v: &Vec<i32>, _| seen2.lock().unwrap().push(v.clone())),
            None,
        );

        a.set(3);
        // Both slots fire; the final notification carries the settled pair.
        assert_eq!(seen.lock().unwrap().last().unwrap(), &vec![3, 6]);
        assert_eq!(t.get(), vec![3, 6]);
        disc.disconnect();
    }

    #[test]
    fn subscribe_replays_when_behind() {
        let a = Value::new("a", 1);
        let t = Tuple::new("t", vec![a.as_source()]);
        let _ = t.get();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = t.subscribe(
            callback(move |v: &Vec<i32>, _| seen2.lock().unwrap().push(v.clone())),
            Some(999),
        );
        assert_eq!(*seen.lock().unwrap(), vec![vec![1]]);
        disc.disconnect();
    }

    #[test]
    fn depends_on_covers_all_slots_transitively() {
        let a = Value::new("a", 1);
        let b = TransformValue::new("b", a.as_source(), |x: i32| x + 1);
        let c = Value::new("c", 2);
        let t = Tuple::new("t", vec![b.as_source(), c.as_source()]);

        assert!(t.depends_on(Source::id(&a)));
        assert!(t.depends_on(Source::id(&b)));
        assert!(t.depends_on(Source::id(&c)));
        assert!(!t.depends_on(999_999));
    }
}
