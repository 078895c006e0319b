//! Module registry
//!
//! Tracks the feature modules known to the hub, their liveness, and the
//! optional [`Module`] implementations that make them callable through
//! [`Hub::call_module`](crate::hub::Hub::call_module).
//!
//! Every getter returns an owned copy; records can only change through the
//! registry's own operations.

use crate::audit::{AuditKind, AuditLog};
use crate::error::ModuleError;
use crate::event_bus::EventBus;
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const MODULE_REGISTERED_EVENT: &str = "module.registered";
pub const MODULE_UNREGISTERED_EVENT: &str = "module.unregistered";

/// Liveness of a registered module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Active,
    Stale,
    Unknown,
}

impl ModuleStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ModuleStatus::Active)
    }
}

/// Registration data supplied by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Free-form extra data
    #[serde(default)]
    pub extra: Value,
}

impl ModuleMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: BTreeSet::new(),
            extra: Value::Null,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A registered module as seen by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: ModuleStatus,
    pub capabilities: BTreeSet<String>,
    pub metadata: Value,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ModuleRecord {
    fn new(id: &str, metadata: ModuleMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: metadata.name,
            version: metadata.version,
            status: ModuleStatus::Active,
            capabilities: metadata.capabilities,
            metadata: metadata.extra,
            registered_at: now,
            last_activity: now,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Callable surface a module exposes to other modules
///
/// # Example
///
/// ```
/// use hubcore::registry::Module;
/// use hubcore::error::ModuleError;
/// use serde_json::{json, Value};
///
/// struct Billing;
///
/// impl Module for Billing {
///     fn methods(&self) -> &[&'static str] {
///         &["total"]
///     }
///
///     fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, ModuleError> {
///         match method {
///             "total" => Ok(json!(args.iter().filter_map(Value::as_f64).sum::<f64>())),
///             _ => Err(ModuleError::CallFailed {
///                 method: method.to_string(),
///                 reason: "unsupported".to_string(),
///             }),
///         }
///     }
/// }
/// ```
pub trait Module: Send + Sync {
    /// Methods callable from other modules
    fn methods(&self) -> &[&'static str];

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, ModuleError>;

    fn exposes(&self, method: &str) -> bool {
        self.methods().iter().any(|m| *m == method)
    }
}

struct RegistryInner {
    records: Mutex<HashMap<String, ModuleRecord>>,
    instances: Mutex<HashMap<String, Arc<dyn Module>>>,
    bus: EventBus,
    audit: AuditLog,
}

/// Registry handle; clones share the same table
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new(bus: EventBus, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: Mutex::new(HashMap::new()),
                instances: Mutex::new(HashMap::new()),
                bus,
                audit,
            }),
        }
    }

    /// Register (or overwrite) a module without a callable implementation
    pub fn register_module(&self, id: &str, metadata: ModuleMetadata) -> ModuleRecord {
        self.register(id, metadata, None)
    }

    /// Register (or overwrite) a module together with its implementation
    pub fn register_module_with(
        &self,
        id: &str,
        metadata: ModuleMetadata,
        instance: Arc<dyn Module>,
    ) -> ModuleRecord {
        self.register(id, metadata, Some(instance))
    }

    fn register(
        &self,
        id: &str,
        metadata: ModuleMetadata,
        instance: Option<Arc<dyn Module>>,
    ) -> ModuleRecord {
        let record = ModuleRecord::new(id, metadata.clone());
        let replaced = lock_or_recover(&self.inner.records)
            .insert(id.to_string(), record.clone())
            .is_some();
        {
            let mut instances = lock_or_recover(&self.inner.instances);
            match instance {
                Some(instance) => {
                    instances.insert(id.to_string(), instance);
                }
                None => {
                    instances.remove(id);
                }
            }
        }

        if replaced {
            tracing::warn!(module = id, "Module already registered, overwriting");
        } else {
            tracing::info!(module = id, name = %record.name, version = %record.version, "Module registered");
        }

        self.inner.audit.log(
            AuditKind::Module,
            format!("Module registered: {}", id),
            json!({ "moduleId": id, "name": record.name, "replaced": replaced }),
        );
        self.inner.bus.publish(
            MODULE_REGISTERED_EVENT,
            json!({ "moduleId": id, "metadata": metadata }),
        );
        record
    }

    /// Remove a module and its implementation; false for unknown ids
    pub fn unregister_module(&self, id: &str) -> bool {
        let removed = lock_or_recover(&self.inner.records).remove(id);
        lock_or_recover(&self.inner.instances).remove(id);
        let Some(record) = removed else {
            return false;
        };

        tracing::info!(module = id, "Module unregistered");
        self.inner.audit.log(
            AuditKind::Module,
            format!("Module unregistered: {}", id),
            json!({ "moduleId": id, "name": record.name }),
        );
        self.inner
            .bus
            .publish(MODULE_UNREGISTERED_EVENT, json!({ "moduleId": id }));
        true
    }

    /// Refresh `last_activity`; returns false (and does nothing) for unknown ids
    pub fn update_module_activity(&self, id: &str) -> bool {
        let mut records = lock_or_recover(&self.inner.records);
        match records.get_mut(id) {
            Some(record) => {
                record.last_activity = Utc::now();
                record.status = ModuleStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Flag a module as stale; used by the health monitor
    pub fn mark_stale(&self, id: &str) -> bool {
        let mut records = lock_or_recover(&self.inner.records);
        match records.get_mut(id) {
            Some(record) => {
                record.status = ModuleStatus::Stale;
                true
            }
            None => false,
        }
    }

    pub fn get_module(&self, id: &str) -> Option<ModuleRecord> {
        lock_or_recover(&self.inner.records).get(id).cloned()
    }

    /// All records, sorted by id
    pub fn get_all_modules(&self) -> Vec<ModuleRecord> {
        let mut modules: Vec<ModuleRecord> = lock_or_recover(&self.inner.records)
            .values()
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<ModuleRecord> {
        self.get_all_modules()
            .into_iter()
            .filter(|m| m.has_capability(capability))
            .collect()
    }

    /// Callable implementation attached to `id`, if any
    pub fn instance(&self, id: &str) -> Option<Arc<dyn Module>> {
        lock_or_recover(&self.inner.instances).get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_or_recover(&self.inner.records).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use pretty_assertions::assert_eq;

    struct Echo;

    impl Module for Echo {
        fn methods(&self) -> &[&'static str] {
            &["echo"]
        }

        fn invoke(&self, _method: &str, args: &[Value]) -> Result<Value, ModuleError> {
            Ok(Value::Array(args.to_vec()))
        }
    }

    fn registry() -> (ModuleRegistry, EventBus, AuditLog) {
        let bus = EventBus::default();
        let audit = AuditLog::with_bus(100, true, bus.clone());
        (ModuleRegistry::new(bus.clone(), audit.clone()), bus, audit)
    }

    #[test]
    fn test_register_and_get() {
        let (registry, _, audit) = registry();
        let record = registry.register_module(
            "billing",
            ModuleMetadata::new("Billing", "1.2.0").with_capabilities(["invoices", "payments"]),
        );

        assert_eq!(record.status, ModuleStatus::Active);
        assert_eq!(registry.get_module("billing"), Some(record));
        assert!(registry.get_module("missing").is_none());
        assert_eq!(
            audit.entries(&AuditQuery::new().kind(AuditKind::Module)).len(),
            1
        );
    }

    #[test]
    fn test_reregistration_last_write_wins() {
        let (registry, _, _) = registry();
        registry.register_module("billing", ModuleMetadata::new("Billing", "1.0.0"));
        registry.register_module("billing", ModuleMetadata::new("Billing v2", "2.0.0"));

        let record = registry.get_module("billing").unwrap();
        assert_eq!(record.name, "Billing v2");
        assert_eq!(record.version, "2.0.0");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregistration_without_instance_drops_old_instance() {
        let (registry, _, _) = registry();
        registry.register_module_with("echo", ModuleMetadata::new("Echo", "1"), Arc::new(Echo));
        assert!(registry.instance("echo").is_some());

        registry.register_module("echo", ModuleMetadata::new("Echo", "2"));
        assert!(registry.instance("echo").is_none());
    }

    #[test]
    fn test_returned_records_are_copies() {
        let (registry, _, _) = registry();
        registry.register_module("a", ModuleMetadata::new("A", "1"));

        let mut copy = registry.get_module("a").unwrap();
        copy.name = "mutated".to_string();
        copy.status = ModuleStatus::Stale;

        let stored = registry.get_module("a").unwrap();
        assert_eq!(stored.name, "A");
        assert_eq!(stored.status, ModuleStatus::Active);
    }

    #[test]
    fn test_activity_and_staleness() {
        let (registry, _, _) = registry();
        let record = registry.register_module("a", ModuleMetadata::new("A", "1"));

        assert!(registry.mark_stale("a"));
        assert_eq!(registry.get_module("a").unwrap().status, ModuleStatus::Stale);

        assert!(registry.update_module_activity("a"));
        let refreshed = registry.get_module("a").unwrap();
        assert_eq!(refreshed.status, ModuleStatus::Active);
        assert!(refreshed.last_activity >= record.last_activity);

        assert!(!registry.update_module_activity("ghost"));
        assert!(!registry.mark_stale("ghost"));
    }

    #[test]
    fn test_unregister_publishes_once() {
        let (registry, bus, _) = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(MODULE_UNREGISTERED_EVENT, move |event| {
            sink.lock().unwrap().push(event.data["moduleId"].clone());
            Ok(())
        })
        .unwrap();

        registry.register_module("a", ModuleMetadata::new("A", "1"));
        assert!(registry.unregister_module("a"));
        assert!(!registry.unregister_module("a"));
        assert_eq!(*seen.lock().unwrap(), vec![json!("a")]);
    }

    #[test]
    fn test_find_by_capability() {
        let (registry, _, _) = registry();
        registry.register_module("a", ModuleMetadata::new("A", "1").with_capability("search"));
        registry.register_module("b", ModuleMetadata::new("B", "1"));

        let found: Vec<String> = registry
            .find_by_capability("search")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(found, vec!["a".to_string()]);
    }
}
