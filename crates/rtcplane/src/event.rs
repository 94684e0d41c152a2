//! Handler bags backing the `on_*` methods of every resource.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Keeps an event handler registered. Dropping it removes the handler;
/// call [`HandlerId::detach`] to keep the handler for the resource's
/// whole lifetime.
#[must_use = "the handler is removed as soon as the HandlerId is dropped"]
pub struct HandlerId {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HandlerId {
    /// Keep the handler registered without holding on to this id.
    pub fn detach(mut self) {
        self.remove.take();
    }

    fn new<T: Send + 'static>(slots: Weak<Mutex<Slots<T>>>, key: u64) -> Self {
        Self {
            remove: Some(Box::new(move || {
                if let Some(slots) = slots.upgrade() {
                    slots.lock().entries.retain(|(k, _)| *k != key);
                }
            })),
        }
    }
}

impl Drop for HandlerId {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerId")
            .field("attached", &self.remove.is_some())
            .finish()
    }
}

struct Slots<T> {
    next_key: u64,
    entries: Vec<(u64, T)>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            next_key: 0,
            entries: Vec::new(),
        }
    }
}

impl<T: Send + 'static> Slots<T> {
    fn insert(this: &Arc<Mutex<Self>>, value: T) -> HandlerId {
        let key = {
            let mut slots = this.lock();
            let key = slots.next_key;
            slots.next_key += 1;
            slots.entries.push((key, value));
            key
        };
        HandlerId::new(Arc::downgrade(this), key)
    }
}

/// Handlers that may fire many times, called in registration order.
pub(crate) struct Bag<F: ?Sized> {
    slots: Arc<Mutex<Slots<Arc<F>>>>,
}

impl<F: ?Sized> Default for Bag<F> {
    fn default() -> Self {
        Self {
            slots: Arc::default(),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Bag<F> {
    pub(crate) fn add(&self, handler: Arc<F>) -> HandlerId {
        Slots::insert(&self.slots, handler)
    }

    /// Call every handler. The bag is not locked while handlers run, so a
    /// handler may register or drop handlers of the same bag.
    pub(crate) fn call(&self, apply: impl Fn(&F)) {
        let handlers: Vec<Arc<F>> = self
            .slots
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            apply(&handler);
        }
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().entries.clear();
    }
}

/// Handlers that fire at most once, for close-style events.
pub(crate) struct BagOnce<F: ?Sized> {
    slots: Arc<Mutex<Slots<Box<F>>>>,
}

impl<F: ?Sized> Default for BagOnce<F> {
    fn default() -> Self {
        Self {
            slots: Arc::default(),
        }
    }
}

impl<F: ?Sized + Send + 'static> BagOnce<F> {
    pub(crate) fn add(&self, handler: Box<F>) -> HandlerId {
        Slots::insert(&self.slots, handler)
    }

    /// Remove every handler and pass each one to `apply`.
    pub(crate) fn call(&self, apply: impl Fn(Box<F>)) {
        let entries = mem::take(&mut self.slots.lock().entries);
        for (_, handler) in entries {
            apply(handler);
        }
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().entries.clear();
    }
}

impl BagOnce<dyn FnOnce() + Send> {
    pub(crate) fn call_simple(&self) {
        self.call(|handler| handler());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn bag_calls_in_registration_order() {
        let bag: Bag<dyn Fn(&mut Vec<u32>) + Send + Sync> = Bag::default();
        let _a = bag.add(Arc::new(|out: &mut Vec<u32>| out.push(1)));
        let _b = bag.add(Arc::new(|out: &mut Vec<u32>| out.push(2)));

        let out = Mutex::new(Vec::new());
        bag.call(|handler| handler(&mut *out.lock()));
        assert_eq!(*out.lock(), vec![1, 2]);
    }

    #[test]
    fn dropping_id_removes_handler() {
        let bag: Bag<dyn Fn() + Send + Sync> = Bag::default();
        let count = Arc::new(AtomicUsize::new(0));

        let id = bag.add(Arc::new({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }));
        bag.call(|handler| handler());
        drop(id);
        bag.call(|handler| handler());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_handler_stays() {
        let bag: Bag<dyn Fn() + Send + Sync> = Bag::default();
        let count = Arc::new(AtomicUsize::new(0));

        bag.add(Arc::new({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .detach();
        bag.call(|handler| handler());
        bag.call(|handler| handler());

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_bag_fires_once() {
        let bag: BagOnce<dyn FnOnce() + Send> = BagOnce::default();
        let count = Arc::new(AtomicUsize::new(0));

        bag.add(Box::new({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .detach();
        bag.call_simple();
        bag.call_simple();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_touch_its_own_bag() {
        let bag: Arc<Bag<dyn Fn() + Send + Sync>> = Arc::new(Bag::default());
        let inner = Arc::clone(&bag);
        bag.add(Arc::new(move || inner.clear())).detach();

        bag.call(|handler| handler());
        bag.call(|handler| handler());
    }
}
