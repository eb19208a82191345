use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::CacheFacade;
use crate::invalidation::InvalidationMap;
use crate::notify::NotificationSink;
use crate::types::PushEvent;

pub type RegistrationId = Uuid;

/// What a consumer handler sees for one delivered event.
pub struct ConsumerContext<'a> {
    pub event: &'a PushEvent,
    pub cache: &'a dyn CacheFacade,
    pub notifier: &'a dyn NotificationSink,
}

pub type Handler = Arc<dyn Fn(&ConsumerContext<'_>) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: RegistrationId,
    scope: Option<Arc<str>>,
    event_name: Arc<str>,
    handler: Handler,
}

/// Registrations are replaced wholesale on every change, so a dispatch in
/// progress keeps iterating the snapshot it started with.
type Registry = RwLock<Arc<Vec<Arc<Registration>>>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub invalidated: Vec<&'static str>,
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventDispatcher {
    mapping: InvalidationMap,
    cache: Arc<dyn CacheFacade>,
    notifier: Arc<dyn NotificationSink>,
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new(
        mapping: InvalidationMap,
        cache: Arc<dyn CacheFacade>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            mapping,
            cache,
            notifier,
            registry: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    /// Applies the mapping invalidations for `event`, then delivers it to every
    /// matching registration. Neither step can prevent the other.
    pub fn on_event(&self, event: &PushEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        for &class in self.mapping.keys_for(&event.name) {
            self.cache.invalidate(class);
            report.invalidated.push(class);
        }

        let snapshot = self.registry.read().clone();
        let ctx = ConsumerContext {
            event,
            cache: self.cache.as_ref(),
            notifier: self.notifier.as_ref(),
        };
        let mut scopes_handled: HashSet<Arc<str>> = HashSet::new();

        for registration in snapshot.iter() {
            if *registration.event_name != *event.name {
                continue;
            }
            // One live instance per scope handles the event.
            if let Some(scope) = &registration.scope {
                if !scopes_handled.insert(scope.clone()) {
                    continue;
                }
            }

            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(&ctx))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(event = %event.name, registration = %registration.id, error = %e, "consumer handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(event = %event.name, registration = %registration.id, "consumer handler panicked");
                }
            }
        }

        if report.invalidated.is_empty() && report.delivered == 0 && report.failed == 0 {
            debug!(event = %event.name, "ignoring unhandled event");
        } else {
            debug!(
                event = %event.name,
                invalidated = report.invalidated.len(),
                delivered = report.delivered,
                failed = report.failed,
                "dispatched event"
            );
        }
        report
    }

    pub fn subscribe<F>(&self, event_name: &str, handler: F) -> ConsumerHandle
    where
        F: Fn(&ConsumerContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, event_name, Arc::new(handler))
    }

    /// Like [`EventDispatcher::subscribe`], but while several registrations
    /// share `scope` and `event_name` only the oldest one receives events.
    pub fn subscribe_scoped<F>(&self, scope: &str, event_name: &str, handler: F) -> ConsumerHandle
    where
        F: Fn(&ConsumerContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(Arc::from(scope)), event_name, Arc::new(handler))
    }

    fn register(&self, scope: Option<Arc<str>>, event_name: &str, handler: Handler) -> ConsumerHandle {
        let id = Uuid::new_v4();
        let registration = Arc::new(Registration {
            id,
            scope,
            event_name: Arc::from(event_name),
            handler,
        });

        let mut guard = self.registry.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(registration);
        *guard = Arc::new(next);
        drop(guard);

        debug!(%id, event = event_name, "consumer registered");
        ConsumerHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn registration_count(&self, event_name: &str) -> usize {
        self.registry
            .read()
            .iter()
            .filter(|r| *r.event_name == *event_name)
            .count()
    }
}

/// Keeps a consumer registered until dropped or released.
#[must_use = "dropping the handle unregisters the consumer"]
pub struct ConsumerHandle {
    id: RegistrationId,
    registry: Weak<Registry>,
}

impl ConsumerHandle {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn release(self) {}
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut guard = registry.write();
        if guard.iter().any(|r| r.id == self.id) {
            let next: Vec<_> = guard.iter().filter(|r| r.id != self.id).cloned().collect();
            *guard = Arc::new(next);
            debug!(id = %self.id, "consumer unregistered");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::testing::{RecordingCache, RecordingSink};
    use super::*;
    use crate::invalidation::{keys, EventName};
    use crate::notify::{Notification, Variant};
    use crate::types::QueryKey;

    fn dispatcher() -> (EventDispatcher, Arc<RecordingCache>, Arc<RecordingSink>) {
        let cache = Arc::new(RecordingCache::default());
        let sink = Arc::new(RecordingSink::default());
        let d = EventDispatcher::new(InvalidationMap::standard(), cache.clone(), sink.clone());
        (d, cache, sink)
    }

    #[test]
    fn mapping_applies_without_consumers() {
        let map = InvalidationMap::standard();
        for event in map.events() {
            let (d, cache, _) = dispatcher();
            d.on_event(&PushEvent::new(event, json!({})));
            let got: HashSet<String> = cache.entries().into_iter().collect();
            let want: HashSet<String> = map.keys_for(event).iter().map(|k| k.to_string()).collect();
            assert_eq!(got, want, "{event}");
        }
    }

    #[test]
    fn mapping_applies_alongside_consumers() {
        let (d, cache, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _h = d.subscribe(EventName::ORDER_CONFIRMED, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = d.on_event(&PushEvent::new(EventName::ORDER_CONFIRMED, json!({})));
        assert_eq!(report.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains(keys::MY_ORDERS));
    }

    #[test]
    fn repeated_delivery_is_idempotent() {
        let (once, once_cache, _) = dispatcher();
        let (twice, twice_cache, _) = dispatcher();
        let event = PushEvent::new(EventName::PURCHASE_REQUEST_APPROVED, json!({}));

        once.on_event(&event);
        twice.on_event(&event);
        twice.on_event(&event);

        let once_set: HashSet<String> = once_cache.entries().into_iter().collect();
        let twice_set: HashSet<String> = twice_cache.entries().into_iter().collect();
        assert_eq!(once_set, twice_set);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let (d, cache, _) = dispatcher();
        let second = Arc::new(AtomicUsize::new(0));
        let s = second.clone();

        let _failing = d.subscribe(EventName::ORDER_CONFIRMED, |_| anyhow::bail!("boom"));
        let _panicking = d.subscribe(EventName::ORDER_CONFIRMED, |_| panic!("handler bug"));
        let _ok = d.subscribe(EventName::ORDER_CONFIRMED, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = d.on_event(&PushEvent::new(EventName::ORDER_CONFIRMED, json!({})));
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(cache.contains(keys::MY_ORDERS));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let (d, cache, sink) = dispatcher();
        let report = d.on_event(&PushEvent::new("user_banned", json!({ "id": 1 })));
        assert_eq!(report, DispatchReport::default());
        assert!(cache.entries().is_empty());
        assert!(sink.titles().is_empty());
    }

    #[test]
    fn handlers_run_in_registration_order_with_payload() {
        let (d, cache, sink) = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _a = d.subscribe(EventName::PURCHASE_REQUEST_APPROVED, move |ctx| {
            o.lock().push("a");
            assert_eq!(ctx.event.str_field("requestId"), Some("X"));
            ctx.cache.invalidate_key(&QueryKey::class(keys::AUTH));
            ctx.notifier
                .notify(Notification::new(Variant::Success, "approved"));
            Ok(())
        });
        let o = order.clone();
        let _b = d.subscribe(EventName::PURCHASE_REQUEST_APPROVED, move |_| {
            o.lock().push("b");
            Ok(())
        });

        d.on_event(&PushEvent::new(
            EventName::PURCHASE_REQUEST_APPROVED,
            json!({ "requestId": "X" }),
        ));

        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(
            cache.entries(),
            vec![keys::MY_PURCHASE_REQUESTS, keys::MY_PACKAGES, keys::AUTH]
        );
        assert_eq!(sink.titles(), vec!["approved"]);
    }

    #[test]
    fn dropping_the_handle_unregisters() {
        let (d, _, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = d.subscribe(EventName::MENU_LOCKED, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(d.registration_count(EventName::MENU_LOCKED), 1);

        handle.release();
        assert_eq!(d.registration_count(EventName::MENU_LOCKED), 0);
        d.on_event(&PushEvent::new(EventName::MENU_LOCKED, json!({})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scoped_registrations_are_not_double_handled() {
        let (d, _, sink) = dispatcher();
        let notify = |ctx: &ConsumerContext<'_>| -> anyhow::Result<()> {
            ctx.notifier
                .notify(Notification::new(Variant::Default, "new request"));
            Ok(())
        };

        let first = d.subscribe_scoped("admin_packages", EventName::PURCHASE_REQUEST_CREATED, notify);
        let second = d.subscribe_scoped("admin_packages", EventName::PURCHASE_REQUEST_CREATED, notify);

        d.on_event(&PushEvent::new(EventName::PURCHASE_REQUEST_CREATED, json!({})));
        assert_eq!(sink.titles().len(), 1);

        // The surviving instance takes over once the first unmounts.
        drop(first);
        d.on_event(&PushEvent::new(EventName::PURCHASE_REQUEST_CREATED, json!({})));
        assert_eq!(sink.titles().len(), 2);

        drop(second);
        d.on_event(&PushEvent::new(EventName::PURCHASE_REQUEST_CREATED, json!({})));
        assert_eq!(sink.titles().len(), 2);
    }

    #[test]
    fn registration_during_dispatch_applies_to_next_event() {
        let d = Arc::new(dispatcher().0);
        let late_calls = Arc::new(AtomicUsize::new(0));
        let handles = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&d);
        let (late, hs) = (late_calls.clone(), handles.clone());
        let _registrar = d.subscribe(EventName::MENU_UPDATED, move |_| {
            if let Some(d) = weak.upgrade() {
                let late = late.clone();
                hs.lock().push(d.subscribe(EventName::MENU_UPDATED, move |_| {
                    late.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            Ok(())
        });

        d.on_event(&PushEvent::new(EventName::MENU_UPDATED, json!({})));
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        d.on_event(&PushEvent::new(EventName::MENU_UPDATED, json!({})));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
        handles.lock().clear();
    }
}
