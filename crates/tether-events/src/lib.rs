//! Synchronous event dispatch for Tether.
//!
//! An [`EventDispatcher`] fans one event out to every subscriber, in
//! subscription order, on the thread that called
//! [`publish`](EventDispatcher::publish). There is no queue: when `publish`
//! returns, every handler has run.
//!
//! Handlers may subscribe or unsubscribe (themselves or others) while an
//! event is being dispatched. Dispatch works on a snapshot taken when
//! `publish` starts:
//!
//! - a handler added mid-dispatch first sees the *next* event
//! - a handler removed mid-dispatch that has not run yet is skipped
//!
//! ```
//! use tether_events::EventDispatcher;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let dispatcher = EventDispatcher::<u32>::new();
//! let total = Arc::new(AtomicUsize::new(0));
//! let sink = Arc::clone(&total);
//! let id = dispatcher.subscribe(move |n| {
//!     sink.fetch_add(*n as usize, Ordering::SeqCst);
//! });
//!
//! dispatcher.publish(&5);
//! assert!(dispatcher.unsubscribe(id));
//! dispatcher.publish(&5);
//! assert_eq!(total.load(Ordering::SeqCst), 5);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one subscription. Unique per dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E> {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    handler: Handler<E>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Fans events of type `E` out to subscribers.
///
/// Usually shared behind an `Arc` between the producer and whoever wires
/// up subscribers.
pub struct EventDispatcher<E> {
    subscribers: Mutex<Vec<Subscription<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E> EventDispatcher<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a handler. It runs after every handler subscribed before it.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscription {
            id,
            active: Arc::new(AtomicBool::new(true)),
            handler: Arc::new(handler),
        });
        tracing::trace!(%id, "subscribed");
        id
    }

    /// Removes exactly the subscription `id`. Returns `false` if it was
    /// already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let Some(pos) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = subscribers.remove(pos);
        removed.active.store(false, Ordering::Release);
        tracing::trace!(%id, "unsubscribed");
        true
    }

    /// Runs every current handler with `event`, in subscription order.
    ///
    /// The lock is not held while handlers run, so handlers may call back
    /// into the dispatcher.
    pub fn publish(&self, event: &E) {
        let snapshot: Vec<Subscription<E>> = self.lock().clone();
        for sub in &snapshot {
            if sub.active.load(Ordering::Acquire) {
                (sub.handler)(event);
            }
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        for sub in self.lock().drain(..) {
            sub.active.store(false, Ordering::Release);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription<E>>> {
        // A handler that panicked never ran while the lock was held, so the
        // list is still consistent.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_publish_runs_handlers_in_subscription_order() {
        let d = EventDispatcher::<&'static str>::new();
        let seen = log();
        for name in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            d.subscribe(move |e| seen.lock().unwrap().push(format!("{name}:{e}")));
        }

        d.publish(&"x");

        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "b:x", "c:x"]);
    }

    #[test]
    fn test_publish_with_no_subscribers_is_noop() {
        let d = EventDispatcher::<u8>::new();
        d.publish(&1);
        assert!(d.is_empty());
    }

    #[test]
    fn test_unsubscribe_removes_only_that_subscription() {
        let d = EventDispatcher::<u8>::new();
        let seen = log();
        let s1 = Arc::clone(&seen);
        let first = d.subscribe(move |_| s1.lock().unwrap().push("first".into()));
        let s2 = Arc::clone(&seen);
        d.subscribe(move |_| s2.lock().unwrap().push("second".into()));

        assert!(d.unsubscribe(first));
        assert!(!d.unsubscribe(first));
        d.publish(&0);

        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_subscribe_during_dispatch_sees_next_event_only() {
        let d = Arc::new(EventDispatcher::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(AtomicBool::new(false));

        let inner_d = Arc::clone(&d);
        let inner_seen = Arc::clone(&seen);
        d.subscribe(move |_| {
            if !added.swap(true, Ordering::SeqCst) {
                let seen = Arc::clone(&inner_seen);
                inner_d.subscribe(move |e| seen.lock().unwrap().push(*e));
            }
        });

        d.publish(&1);
        d.publish(&2);

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_skips_pending_handler() {
        let d = Arc::new(EventDispatcher::<u32>::new());
        let seen = log();
        let victim = Arc::new(Mutex::new(None));

        let inner_d = Arc::clone(&d);
        let inner_victim = Arc::clone(&victim);
        d.subscribe(move |_| {
            if let Some(id) = inner_victim.lock().unwrap().take() {
                inner_d.unsubscribe(id);
            }
        });
        let s = Arc::clone(&seen);
        let id = d.subscribe(move |_| s.lock().unwrap().push("victim ran".into()));
        *victim.lock().unwrap() = Some(id);

        d.publish(&1);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_handler_can_unsubscribe_itself() {
        let d = Arc::new(EventDispatcher::<u32>::new());
        let count = Arc::new(AtomicU64::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let inner_d = Arc::clone(&d);
        let inner_id = Arc::clone(&own_id);
        let c = Arc::clone(&count);
        let id = d.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *inner_id.lock().unwrap() {
                inner_d.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);

        d.publish(&1);
        d.publish(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(d.is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let d = EventDispatcher::<u32>::new();
        d.subscribe(|_| panic!("cleared handler must not run"));
        d.subscribe(|_| panic!("cleared handler must not run"));
        d.clear();
        d.publish(&1);
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let d = EventDispatcher::<u32>::new();
        let a = d.subscribe(|_| {});
        let b = d.subscribe(|_| {});
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "sub-1");
    }
}
