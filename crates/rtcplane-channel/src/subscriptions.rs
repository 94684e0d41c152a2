use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::message::Notification;

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;
type Table = Mutex<HashMap<String, Vec<(u64, Callback)>>>;

/// Per-resource notification listeners.
#[derive(Default)]
pub(crate) struct Subscriptions {
    table: Arc<Table>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub(crate) fn subscribe(&self, target: String, callback: Callback) -> SubscriptionHandler {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .lock()
            .entry(target.clone())
            .or_default()
            .push((id, callback));

        SubscriptionHandler {
            table: Arc::downgrade(&self.table),
            target,
            id,
        }
    }

    /// Invoke every listener registered for the notification's target.
    ///
    /// Listeners run without the table lock held, so they may subscribe or
    /// unsubscribe freely.
    pub(crate) fn dispatch(&self, notification: &Notification) {
        let callbacks: Vec<Callback> = match self.table.lock().get(&notification.handler_id) {
            Some(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => {
                tracing::trace!(
                    target_id = %notification.handler_id,
                    event = ?notification.event,
                    "notification without subscribers"
                );
                return;
            }
        };

        for callback in callbacks {
            callback(notification);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().values().map(Vec::len).sum()
    }
}

/// Keeps a notification subscription alive. Dropping it unsubscribes.
#[must_use = "the subscription ends when the handler is dropped"]
pub struct SubscriptionHandler {
    table: Weak<Table>,
    target: String,
    id: u64,
}

impl SubscriptionHandler {
    /// Resource id this subscription listens to.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for SubscriptionHandler {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock();
        if let Some(entries) = table.get_mut(&self.target) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                table.remove(&self.target);
            }
        }
    }
}

impl fmt::Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandler")
            .field("target", &self.target)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::message::Event;

    fn notification(target: &str) -> Notification {
        Notification {
            handler_id: target.into(),
            event: Event::ProducerScore,
            data: None,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let callback: Callback = Arc::new(move |_: &Notification| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn dispatch_reaches_only_matching_target() {
        let subs = Subscriptions::default();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let _a = subs.subscribe("a".into(), a);
        let _b = subs.subscribe("b".into(), b);

        subs.dispatch(&notification("a"));
        subs.dispatch(&notification("a"));
        subs.dispatch(&notification("c"));

        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_handler_unsubscribes() {
        let subs = Subscriptions::default();
        let (count, cb) = counter();
        let handler = subs.subscribe("a".into(), cb);
        assert_eq!(subs.len(), 1);

        drop(handler);
        subs.dispatch(&notification("a"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn handler_outliving_table_is_harmless() {
        let subs = Subscriptions::default();
        let (_count, cb) = counter();
        let handler = subs.subscribe("a".into(), cb);
        drop(subs);
        drop(handler);
    }
}
