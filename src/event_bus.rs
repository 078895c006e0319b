//! Event bus
//!
//! Synchronous publish/subscribe dispatcher keyed by event name.
//!
//! # Delivery
//!
//! - Subscribers of one event fire in subscription order.
//! - [`EventBus::publish`] iterates a snapshot of the subscriber list taken at
//!   call time, so callbacks may subscribe or unsubscribe while being invoked.
//! - A callback that returns an error or panics is isolated: the failure is
//!   written to the audit log and dispatch continues with the next subscriber.
//! - No lock is held while callbacks run, so callbacks may publish again.
//!
//! # Example
//!
//! ```
//! use hubcore::event_bus::EventBus;
//! use serde_json::json;
//!
//! let bus = EventBus::default();
//! let handle = bus
//!     .subscribe("data.set", |event| {
//!         println!("{} -> {}", event.name, event.data);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(bus.publish("data.set", json!({ "key": "theme" })), 1);
//! assert!(handle.unsubscribe());
//! assert_eq!(bus.publish("data.set", json!(null)), 0);
//! ```

use crate::audit::{AuditInner, AuditKind, AuditLog};
use crate::error::{panic_message, HubError, ListenerError, Result};
use crate::interceptor;
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Default soft limit of listeners per event before a warning is emitted
pub const DEFAULT_MAX_LISTENERS: usize = 50;

/// Subscriber callback
pub type EventCallback = Arc<dyn Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync>;

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Identifier of a subscription, unique within its bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    callback: EventCallback,
    context: Option<String>,
    subscribed_at: DateTime<Utc>,
}

/// Read-only description of a registered listener
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerInfo {
    pub id: SubscriptionId,
    pub event_name: String,
    pub context: Option<String>,
    pub subscribed_at: DateTime<Utc>,
}

struct BusInner {
    listeners: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
    max_listeners: usize,
    debug: bool,
    audit: OnceCell<Weak<AuditInner>>,
}

/// Handle returned by [`EventBus::subscribe`]
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    event_name: String,
    id: SubscriptionId,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Remove this subscription; false if it was already gone or the bus dropped
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => EventBus { inner }.unsubscribe(&self.event_name, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner")
            .field("max_listeners", &self.max_listeners)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Publish/subscribe dispatcher; clones share the same listener table
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_count())
            .field("max_listeners", &self.inner.max_listeners)
            .finish()
    }
}

impl EventBus {
    /// Create a bus with a per-event soft listener limit
    pub fn new(max_listeners: usize, debug: bool) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_listeners,
                debug,
                audit: OnceCell::new(),
            }),
        }
    }

    /// Route listener failures into `audit`. Only the first call takes effect.
    pub fn attach_audit(&self, audit: &AuditLog) -> bool {
        self.inner.audit.set(audit.downgrade()).is_ok()
    }

    pub fn subscribe<F>(&self, event_name: &str, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.add_subscription(event_name, Arc::new(callback), None)
    }

    /// Subscribe with a label (usually the owning module id) used in diagnostics
    pub fn subscribe_with_context<F>(
        &self,
        event_name: &str,
        context: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.add_subscription(event_name, Arc::new(callback), Some(context.into()))
    }

    fn add_subscription(
        &self,
        event_name: &str,
        callback: EventCallback,
        context: Option<String>,
    ) -> Result<SubscriptionHandle> {
        if event_name.trim().is_empty() {
            return Err(HubError::EmptyEventName);
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut listeners = lock_or_recover(&self.inner.listeners);
            let list = listeners.entry(event_name.to_string()).or_default();
            list.push(Arc::new(Subscription {
                id,
                callback,
                context,
                subscribed_at: Utc::now(),
            }));
            list.len()
        };

        if count > self.inner.max_listeners {
            tracing::warn!(
                event = event_name,
                count,
                limit = self.inner.max_listeners,
                "Listener count exceeds soft limit, possible leak"
            );
        }
        tracing::trace!(event = event_name, %id, "Subscribed");

        Ok(SubscriptionHandle {
            event_name: event_name.to_string(),
            id,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Remove one subscription; returns whether it existed
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        let mut listeners = lock_or_recover(&self.inner.listeners);
        let Some(list) = listeners.get_mut(event_name) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event_name);
        }
        removed
    }

    /// Deliver `data` to every current subscriber of `event_name`.
    ///
    /// Returns the number of subscribers that completed without failing.
    /// Never panics because of a subscriber.
    pub fn publish(&self, event_name: &str, data: Value) -> usize {
        // Deliver audit entries the panic hook queued before this event
        if !event_name.starts_with("audit.") {
            if let Some(audit) = self.inner.audit.get().and_then(Weak::upgrade) {
                AuditLog::from_inner(audit).flush_pending();
            }
        }

        let snapshot: Vec<Arc<Subscription>> = lock_or_recover(&self.inner.listeners)
            .get(event_name)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            if self.inner.debug {
                tracing::debug!(event = event_name, "Published with no subscribers");
            }
            return 0;
        }

        let event = Event {
            name: event_name.to_string(),
            data,
            timestamp: Utc::now(),
        };

        let mut delivered = 0;
        for subscription in &snapshot {
            let outcome = interceptor::contain(|| (subscription.callback)(&event));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => self.report_failure(&event, subscription, e.to_string()),
                Err(payload) => self.report_failure(
                    &event,
                    subscription,
                    format!("listener panicked: {}", panic_message(payload.as_ref())),
                ),
            }
        }

        if self.inner.debug {
            tracing::debug!(
                event = event_name,
                delivered,
                total = snapshot.len(),
                "Published"
            );
        }
        delivered
    }

    fn report_failure(&self, event: &Event, subscription: &Subscription, error: String) {
        tracing::warn!(
            event = %event.name,
            subscription = %subscription.id,
            context = subscription.context.as_deref().unwrap_or("-"),
            "Listener failed: {}",
            error
        );

        // Failures while delivering audit events are only traced; auditing them
        // would publish another audit event to the same failing listener.
        if event.name.starts_with("audit.") {
            return;
        }
        if let Some(audit) = self.inner.audit.get().and_then(Weak::upgrade) {
            AuditLog::from_inner(audit).log(
                AuditKind::Error,
                format!("Listener failed for event '{}'", event.name),
                json!({
                    "event": event.name,
                    "subscriptionId": subscription.id.as_u64(),
                    "context": subscription.context,
                    "error": error,
                }),
            );
        }
    }

    /// Drop every listener of `event_name`; returns whether any existed
    pub fn clear_event(&self, event_name: &str) -> bool {
        let removed = lock_or_recover(&self.inner.listeners).remove(event_name);
        match removed {
            Some(list) => {
                tracing::debug!(event = event_name, removed = list.len(), "Cleared listeners");
                true
            }
            None => false,
        }
    }

    /// Drop every listener of every event
    pub fn clear_all(&self) {
        lock_or_recover(&self.inner.listeners).clear();
    }

    pub fn get_event_listeners(&self, event_name: &str) -> Vec<ListenerInfo> {
        lock_or_recover(&self.inner.listeners)
            .get(event_name)
            .map(|list| {
                list.iter()
                    .map(|s| ListenerInfo {
                        id: s.id,
                        event_name: event_name.to_string(),
                        context: s.context.clone(),
                        subscribed_at: s.subscribed_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        lock_or_recover(&self.inner.listeners)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Names of events with at least one listener, sorted
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_or_recover(&self.inner.listeners).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of events with at least one listener
    pub fn event_count(&self) -> usize {
        lock_or_recover(&self.inner.listeners).len()
    }

    pub fn max_listeners(&self) -> usize {
        self.inner.max_listeners
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LISTENERS, false)
    }
}
