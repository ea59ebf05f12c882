use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Callback<T>>>,
}

/// Registry of observers notified, in subscription order, of every published value.
pub struct Subscribers<T> {
    inner: Arc<Registry<T>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Registry { next: AtomicU64::new(0), subscribers: Default::default() }),
        }
    }
}

/// Handle returned by [`Subscribers::subscribe`]. Dropping it does not unsubscribe.
pub struct Unsubscribe<T> {
    id: u64,
    registry: Weak<Registry<T>>,
}

impl<T> Unsubscribe<T> {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut subs) = registry.subscribers.lock() {
                subs.remove(&self.id);
            }
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn subscribe<F>(&self, f: F) -> Unsubscribe<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.insert(id, Arc::new(f));
        }
        Unsubscribe { id, registry: Arc::downgrade(&self.inner) }
    }

    /// Calls every subscriber with `value`. Callbacks run outside the registry lock, so a
    /// subscriber may unsubscribe itself.
    pub fn publish(&self, value: &T) {
        let subs: Vec<Callback<T>> = match self.inner.subscribers.lock() {
            Ok(subs) => subs.values().cloned().collect(),
            Err(_) => return,
        };
        for sub in subs {
            sub(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribe_stops_delivery() {
        let subs = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let first = subs.subscribe(move |v| s1.lock().unwrap().push(("first", *v)));
        let s2 = seen.clone();
        let _second = subs.subscribe(move |v| s2.lock().unwrap().push(("second", *v)));

        subs.publish(&1);
        first.unsubscribe();
        subs.publish(&2);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("second", 1), ("second", 2)]);
        assert_eq!(subs.len(), 1);
    }
}
