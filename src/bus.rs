use crate::protocol::EventRecord;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Listener = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Destination for records decoded from worker output.
pub trait RecordSink: Send + Sync {
    fn publish(&self, record: &EventRecord);
}

#[derive(Clone)]
struct Entry {
    id: u64,
    event: Option<String>,
    once: bool,
    active: Arc<AtomicBool>,
    listener: Listener,
}

impl Entry {
    fn matches(&self, event: &str) -> bool {
        self.event.as_deref().map_or(true, |name| name == event)
    }
}

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.id != id);
    }
}

/// Publish/subscribe dispatcher keyed by event name.
///
/// Listeners for one record run synchronously on the publishing task, in
/// registration order. A panicking listener is logged and skipped; it never
/// stops its siblings or the publisher.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(
            Some(event.into()),
            false,
            Arc::new(move |record: &EventRecord| callback(&record.data)),
        )
    }

    pub fn subscribe_once<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        let slot = Mutex::new(Some(callback));
        self.register(
            Some(event.into()),
            true,
            Arc::new(move |record: &EventRecord| {
                let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(callback) = callback {
                    callback(&record.data);
                }
            }),
        )
    }

    /// Receives every published record regardless of its name.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.register(None, false, Arc::new(callback))
    }

    fn register(&self, event: Option<String>, once: bool, listener: Listener) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let entry = Entry {
            id,
            event,
            once,
            active: active.clone(),
            listener,
        };
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);

        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn publish(&self, record: &EventRecord) {
        let snapshot: Vec<Entry> = {
            let entries = self
                .registry
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|entry| entry.matches(&record.event))
                .cloned()
                .collect()
        };

        if snapshot.is_empty() {
            tracing::trace!(event = %record.event, "no listeners for worker event");
            return;
        }

        for entry in snapshot {
            if entry.once {
                if !entry.active.swap(false, Ordering::SeqCst) {
                    continue;
                }
                self.registry.remove(entry.id);
            } else if !entry.active.load(Ordering::SeqCst) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.listener)(record)));
            if let Err(panic) = outcome {
                tracing::error!(
                    event = %record.event,
                    subscription_id = entry.id,
                    panic = %panic_message(panic.as_ref()),
                    "event listener panicked"
                );
            }
        }
    }

    /// Named subscriptions currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.event.as_deref() == Some(event))
            .count()
    }
}

impl RecordSink for EventBus {
    fn publish(&self, record: &EventRecord) {
        EventBus::publish(self, record);
    }
}

/// Handle returned by every subscribe call.
///
/// The listener stays registered until [`Subscription::unsubscribe`] is
/// called; dropping the handle does not remove it.
#[derive(Debug, Clone)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Removes exactly this listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, Subscription};
    use crate::protocol::EventRecord;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex, OnceLock};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Value) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let log = log.clone();
            move |label: &str| -> Box<dyn Fn(&Value) + Send + Sync> {
                let log = log.clone();
                let label = label.to_string();
                Box::new(move |data: &Value| {
                    log.lock().expect("log lock").push(format!("{label}:{data}"));
                })
            }
        };
        (log, factory)
    }

    #[test]
    fn unsubscribe_twice_is_a_noop() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let subscription = bus.subscribe("x", listener("cb"));

        subscription.unsubscribe();
        subscription.unsubscribe();
        bus.publish(&EventRecord::new("x", json!(1)));

        assert!(log.lock().expect("log lock").is_empty());
        assert!(!subscription.is_active());
        assert_eq!(bus.listener_count("x"), 0);
    }

    #[test]
    fn fans_out_to_every_subscriber_and_unsubscribes_independently() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let first = bus.subscribe("sync", listener("a"));
        let _second = bus.subscribe("sync", listener("b"));

        bus.publish(&EventRecord::new("sync", json!({ "ok": true })));
        first.unsubscribe();
        bus.publish(&EventRecord::new("sync", json!({ "ok": false })));

        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                "a:{\"ok\":true}".to_string(),
                "b:{\"ok\":true}".to_string(),
                "b:{\"ok\":false}".to_string(),
            ]
        );
    }

    #[test]
    fn only_matching_names_are_invoked() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let _pong = bus.subscribe("pong", listener("pong"));
        let _sync = bus.subscribe("syncCompleted", listener("sync"));

        bus.publish(&EventRecord::new("pong", json!(null)));
        bus.publish(&EventRecord::new("nobody-listens", json!(null)));

        assert_eq!(*log.lock().expect("log lock"), vec!["pong:null".to_string()]);
    }

    #[test]
    fn panicking_listener_does_not_stop_siblings() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let _boom = bus.subscribe("x", |_: &Value| panic!("listener failure"));
        let _after = bus.subscribe("x", listener("after"));

        bus.publish(&EventRecord::new("x", json!(2)));
        bus.publish(&EventRecord::new("x", json!(3)));

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["after:2".to_string(), "after:3".to_string()]
        );
    }

    #[test]
    fn unsubscribe_during_dispatch_skips_pending_listener() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let victim: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let _killer = {
            let victim = victim.clone();
            bus.subscribe("x", move |_: &Value| {
                if let Some(subscription) = victim.get() {
                    subscription.unsubscribe();
                }
            })
        };
        let _ = victim.set(bus.subscribe("x", listener("victim")));

        bus.publish(&EventRecord::new("x", json!(1)));
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        let callback = listener("once");
        let subscription = bus.subscribe_once("syncCompleted", move |data: &Value| callback(data));

        bus.publish(&EventRecord::new("syncCompleted", json!(1)));
        bus.publish(&EventRecord::new("syncCompleted", json!(2)));

        assert_eq!(*log.lock().expect("log lock"), vec!["once:1".to_string()]);
        assert!(!subscription.is_active());
        assert_eq!(bus.listener_count("syncCompleted"), 0);
    }

    #[test]
    fn catch_all_listener_sees_every_record() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tap = {
            let seen = seen.clone();
            bus.subscribe_all(move |record: &EventRecord| {
                seen.lock().expect("seen lock").push(record.event.clone());
            })
        };

        bus.publish(&EventRecord::new("pong", json!({})));
        bus.publish(&EventRecord::new("error", json!({ "message": "boom" })));
        tap.unsubscribe();
        bus.publish(&EventRecord::new("pong", json!({})));

        assert_eq!(*seen.lock().expect("seen lock"), vec!["pong", "error"]);
        assert_eq!(bus.listener_count("pong"), 0);
    }

    #[test]
    fn unsubscribe_after_bus_is_dropped_is_harmless() {
        let bus = EventBus::new();
        let subscription = bus.subscribe("x", |_: &Value| {});
        drop(bus);
        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }
}
