//! Proxy Value Implementation
//!
//! A [`ProxyValue`] mirrors state that lives outside the reactive graph.
//! Construction pulls the initial value; while at least one subscriber is
//! attached, an external wakeup signal is connected, and every fire pulls
//! the backing state again and runs it through the normal `set` policy.
//! With no subscribers the external connection is torn down and `get()`
//! keeps returning the last pulled value.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::ReactiveError;
use crate::reactive::source::{
    Cell, ChangeCallback, Disconnector, Disposable, Disposer, EqPredicate, SharedSource, Source,
    ValueCore,
};

/// Pulls the current backing state.
pub type Puller<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Connects a wakeup callback to the external change signal; the returned
/// [`Disconnector`] severs it again.
pub type SignalConnector = Arc<dyn Fn(Arc<dyn Fn() + Send + Sync>) -> Disconnector + Send + Sync>;

struct ProxyInner<T> {
    core: ValueCore<T>,
    puller: Puller<T>,
    connector: SignalConnector,
    upstream: Mutex<Option<Disconnector>>,
}

/// A value mirroring externally owned state. Clones share state.
pub struct ProxyValue<T> {
    inner: Arc<ProxyInner<T>>,
}

impl<T> Clone for ProxyValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ProxyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        puller: impl Fn() -> T + Send + Sync + 'static,
        connector: impl Fn(Arc<dyn Fn() + Send + Sync>) -> Disconnector + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, Arc::new(puller), Arc::new(connector), None, None)
    }

    pub(crate) fn build(
        name: impl Into<String>,
        puller: Puller<T>,
        connector: SignalConnector,
        eq: Option<EqPredicate<T>>,
        disposer: Option<Disposer<T>>,
    ) -> Self {
        let initial = puller();
        Self {
            inner: Arc::new(ProxyInner {
                core: ValueCore::new(name.into(), Cell::Computed(initial), eq, None, disposer),
                puller,
                connector,
                upstream: Mutex::new(None),
            }),
        }
    }

    pub fn as_source(&self) -> SharedSource<T> {
        Arc::new(self.clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    pub fn dispose(&self) -> Result<(), ReactiveError> {
        self.inner.core.dispose()
    }
}

impl<T> ProxyInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn first_subscribe(self: &Arc<Self>) {
        let weak: Weak<ProxyInner<T>> = Arc::downgrade(self);
        let disc = (self.connector)(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.core.set((inner.puller)());
            }
        }));
        *self.upstream.lock() = Some(disc);
    }

    fn last_disconnect(&self) {
        if let Some(disc) = self.upstream.lock().take() {
            disc.disconnect();
        }
    }
}

impl<T> Source<T> for ProxyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.core.id()
    }

    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn get(&self) -> T {
        self.inner.core.get()
    }

    fn mods(&self) -> u64 {
        self.inner.core.mods()
    }

    fn subscribe(&self, cb: ChangeCallback<T>, last_mods: Option<u64>) -> Disconnector {
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

    fn depends_on(&self, _id: u64) -> bool {
        false
    }
}

impl<T> Disposable for ProxyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> u64 {
        self.inner.core.id()
    }

    fn dispose(&self) -> Result<(), ReactiveError> {
        ProxyValue::dispose(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::source::callback;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;

    type WakeSlot = Arc<StdMutex<Option<Arc<dyn Fn() + Send + Sync>>>>;

    // A fake external signal: remembers the wakeup it was handed and counts
    // connections.
    fn fake_signal() -> (WakeSlot, Arc<AtomicI32>, SignalConnector) {
        let slot: WakeSlot = Arc::new(StdMutex::new(None));
        let connected = Arc::new(AtomicI32::new(0));
        let slot2 = slot.clone();
        let connected2 = connected.clone();
        let connector: SignalConnector = Arc::new(move |wake| {
            connected2.fetch_add(1, Ordering::SeqCst);
            *slot2.lock().unwrap() = Some(wake);
            let slot = slot2.clone();
            Disconnector::new(move || {
                slot.lock().unwrap().take();
            })
        });
        (slot, connected, connector)
    }

    #[test]
    fn pulls_initial_value_without_connecting() {
        let (_slot, connected, connector) = fake_signal();
        let backing = Arc::new(AtomicI32::new(3));
        let b = backing.clone();
        let p = ProxyValue::build(
            "p",
            Arc::new(move || b.load(Ordering::SeqCst)),
            connector,
            None,
            None,
        );

        assert_eq!(p.get(), 3);
        assert_eq!(p.mods(), 0);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn signal_fire_pulls_and_notifies_while_subscribed() {
        let (slot, connected, connector) = fake_signal();
        let backing = Arc::new(AtomicI32::new(1));
        let b = backing.clone();
        let p = ProxyValue::build(
            "p",
            Arc::new(move || b.load(Ordering::SeqCst)),
            connector,
            None,
            None,
        );

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let disc = p.subscribe(
            callback(move |v: &i32, _| seen2.lock().unwrap().push(*v)),
            Some(p.mods()),
        );
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        backing.store(5, Ordering::SeqCst);
        let wake = slot.lock().unwrap().clone().unwrap();
        wake();

        assert_eq!(p.get(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![5]);
        disc.disconnect();
    }

    #[test]
    fn last_disconnect_severs_the_external_connection() {
        let (slot, connected, connector) = fake_signal();
        let p = ProxyValue::build("p", Arc::new(|| 0), connector, None, None);

        let d1 = p.subscribe(callback(|_: &i32, _| {}), Some(0));
        let d2 = p.subscribe(callback(|_: &i32, _| {}), Some(0));
        // One external connection regardless of subscriber count.
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        d1.disconnect();
        assert!(slot.lock().unwrap().is_some());
        d2.disconnect();
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn stale_value_stays_readable_after_disconnect() {
        let (slot, _connected, connector) = fake_signal();
        let backing = Arc::new(AtomicI32::new(1));
        let b = backing.clone();
        let p = ProxyValue::build(
            "p",
            Arc::new(move || b.load(Ordering::SeqCst)),
            connector,
            None,
            None,
        );

        let disc = p.subscribe(callback(|_: &i32, _| {}), Some(0));
        backing.store(9, Ordering::SeqCst);
        let wake = slot.lock().unwrap().clone().unwrap();
        wake();
        disc.disconnect();

        // No connection remains; the last pulled value is still served.
        backing.store(11, Ordering::SeqCst);
        assert_eq!(p.get(), 9);
    }
}
