//! Shared key/value store
//!
//! Short-lived data shared between modules, with provenance (who set it, when)
//! and optional expiry. Expiry is lazy: an expired entry is removed by the
//! first read that notices it, and behaves as absent from then on.

use crate::audit::{AuditKind, AuditLog};
use crate::event_bus::EventBus;
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DATA_SET_EVENT: &str = "data.set";
pub const DATA_DELETED_EVENT: &str = "data.deleted";
pub const DATA_CLEARED_EVENT: &str = "data.cleared";

/// A stored value with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedEntry {
    pub key: String,
    pub value: Value,
    /// Module id of the writer
    pub set_by: String,
    pub set_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl SharedEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| now >= expires)
    }
}

/// Options for [`SharedStore::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub module_id: String,
    pub ttl: Option<Duration>,
    pub metadata: Value,
}

impl SetOptions {
    /// Options for a write made by `module_id`
    pub fn by(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

struct StoreInner {
    entries: Mutex<HashMap<String, SharedEntry>>,
    bus: EventBus,
    audit: AuditLog,
}

/// Shared store handle; clones share the same map
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl SharedStore {
    pub fn new(bus: EventBus, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                bus,
                audit,
            }),
        }
    }

    /// Store `value` under `key`, replacing any previous entry
    pub fn set(&self, key: &str, value: Value, options: SetOptions) -> SharedEntry {
        let now = Utc::now();
        // A zero ttl, or one too large to represent, never expires
        let expires_at = options
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));

        let entry = SharedEntry {
            key: key.to_string(),
            value,
            set_by: options.module_id,
            set_at: now,
            expires_at,
            metadata: options.metadata,
        };
        lock_or_recover(&self.inner.entries).insert(key.to_string(), entry.clone());

        tracing::debug!(key, set_by = %entry.set_by, ttl = ?options.ttl, "Shared data set");
        self.inner.audit.log(
            AuditKind::Data,
            format!("Shared data set: {}", key),
            json!({ "key": key, "moduleId": entry.set_by, "expiresAt": entry.expires_at }),
        );
        self.inner.bus.publish(
            DATA_SET_EVENT,
            json!({
                "key": key,
                "value": entry.value,
                "moduleId": entry.set_by,
                "expiresAt": entry.expires_at,
            }),
        );
        entry
    }

    /// Current value for `key`, or `None` when missing or expired
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Full entry for `key`; expired entries are removed on the way
    pub fn get_entry(&self, key: &str) -> Option<SharedEntry> {
        let mut entries = lock_or_recover(&self.inner.entries);
        let expired = entries.get(key)?.is_expired_at(Utc::now());
        if expired {
            entries.remove(key);
            tracing::debug!(key, "Shared data expired");
            return None;
        }
        entries.get(key).cloned()
    }

    /// Remove `key`; announces `data.deleted` only when something was removed
    pub fn delete(&self, key: &str) -> bool {
        let removed = lock_or_recover(&self.inner.entries).remove(key);
        let Some(entry) = removed else {
            return false;
        };

        self.inner.audit.log(
            AuditKind::Data,
            format!("Shared data deleted: {}", key),
            json!({ "key": key, "setBy": entry.set_by }),
        );
        self.inner.bus.publish(DATA_DELETED_EVENT, json!({ "key": key }));
        true
    }

    /// Remove everything and announce `data.cleared`
    pub fn clear(&self) -> usize {
        let count = {
            let mut entries = lock_or_recover(&self.inner.entries);
            let count = entries.len();
            entries.clear();
            count
        };

        self.inner.audit.log(
            AuditKind::Data,
            "Shared data cleared",
            json!({ "count": count }),
        );
        self.inner.bus.publish(DATA_CLEARED_EVENT, json!({ "count": count }));
        count
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = lock_or_recover(&self.inner.entries);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }

    /// Keys of live entries, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = lock_or_recover(&self.inner.entries)
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored entries, including expired ones not yet read
    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store() -> (SharedStore, EventBus) {
        let bus = EventBus::default();
        let audit = AuditLog::with_bus(100, true, bus.clone());
        (SharedStore::new(bus.clone(), audit), bus)
    }

    #[test]
    fn test_set_and_get() {
        let (store, _) = store();
        let entry = store.set(
            "theme",
            json!("dark"),
            SetOptions::by("settings").with_metadata(json!({ "source": "user" })),
        );

        assert_eq!(entry.set_by, "settings");
        assert!(entry.expires_at.is_none());
        assert_eq!(store.get("theme"), Some(json!("dark")));
        assert_eq!(store.get_entry("theme").unwrap().metadata["source"], json!("user"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let (store, _) = store();
        store.set(
            "token",
            json!("abc"),
            SetOptions::by("auth").with_ttl(Duration::from_millis(100)),
        );
        assert_eq!(store.get("token"), Some(json!("abc")));

        thread::sleep(Duration::from_millis(150));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("token"), None);
        assert_eq!(store.len(), 0);
        assert_eq!(store.get("token"), None);
    }

    #[test]
    fn test_overwrite_resets_expiry() {
        let (store, _) = store();
        store.set("k", json!(1), SetOptions::by("a").with_ttl(Duration::from_millis(50)));
        store.set("k", json!(2), SetOptions::by("b"));

        thread::sleep(Duration::from_millis(80));
        let entry = store.get_entry("k").unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(entry.set_by, "b");
    }

    #[test]
    fn test_delete_announces_only_existing() {
        let (store, bus) = store();
        let deleted = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&deleted);
        bus.subscribe(DATA_DELETED_EVENT, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

        store.set("k", json!(true), SetOptions::by("a"));
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert_eq!(*deleted.lock().unwrap(), 1);
    }

    #[test]
    fn test_clear_and_purge() {
        let (store, bus) = store();
        let cleared = Arc::new(Mutex::new(Value::Null));
        let sink = Arc::clone(&cleared);
        bus.subscribe(DATA_CLEARED_EVENT, move |event| {
            *sink.lock().unwrap() = event.data.clone();
            Ok(())
        })
        .unwrap();

        store.set("a", json!(1), SetOptions::by("m").with_ttl(Duration::from_millis(10)));
        store.set("b", json!(2), SetOptions::by("m"));
        thread::sleep(Duration::from_millis(30));

        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert_eq!(*cleared.lock().unwrap(), json!({ "count": 1 }));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let (store, _) = store();
        let entry = store.set("kept", json!(1), SetOptions::by("m").with_ttl(Duration::ZERO));
        assert_eq!(entry.expires_at, None);
        assert_eq!(store.get("kept"), Some(json!(1)));
        assert_eq!(store.purge_expired(), 0);
    }
}
