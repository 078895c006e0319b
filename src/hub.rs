//! The hub: one explicit instance owning every component.
//!
//! A [`Hub`] is a cheap clone handle; construct it once at process start and
//! pass it to modules. Component handles are also reachable directly through
//! the accessor methods when a module only needs one of them.
//!
//! # Example
//!
//! ```
//! use hubcore::{Hub, HubConfig, ModuleMetadata};
//! use serde_json::json;
//!
//! let hub = Hub::new(HubConfig {
//!     auto_health_check: false,
//!     ..HubConfig::default()
//! });
//! hub.init();
//!
//! hub.register_module("billing", ModuleMetadata::new("Billing", "1.0.0"));
//! hub.publish("invoice.paid", json!({ "amount": 42 }));
//! assert_eq!(hub.get_stats().module_count, 2);
//! ```

use crate::audit::{AuditEntry, AuditExport, AuditKind, AuditLog, AuditQuery};
use crate::config::HubConfig;
use crate::error::{panic_message, HubError, ListenerError, ModuleError, Result};
use crate::event_bus::{Event, EventBus, ListenerInfo, SubscriptionHandle, SubscriptionId};
use crate::health::{HealthMonitor, HealthSnapshot, HttpProbe, OverallHealth};
use crate::interceptor::{self, ErrorInterceptor};
use crate::registry::{Module, ModuleMetadata, ModuleRecord, ModuleRegistry};
use crate::shared_store::{SetOptions, SharedStore};
use crate::workflow::{WorkflowEngine, WorkflowStep};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Id under which the hub registers itself
pub const CORE_MODULE_ID: &str = "hubcore";

pub const SYSTEM_READY_EVENT: &str = "system.ready";

/// Introspection counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub uptime_ms: u64,
    pub initialized: bool,
    pub module_count: usize,
    /// Event names with at least one subscriber
    pub event_count: usize,
    pub shared_entry_count: usize,
    pub audit_entry_count: usize,
    pub workflow_count: usize,
    pub health: OverallHealth,
}

struct HubInner {
    config: HubConfig,
    bus: EventBus,
    audit: AuditLog,
    registry: ModuleRegistry,
    store: SharedStore,
    health: HealthMonitor,
    workflows: WorkflowEngine,
    started_at: Instant,
    initialized: AtomicBool,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("initialized", &self.is_initialized())
            .field("modules", &self.inner.registry.len())
            .finish()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    /// Like [`new`](Self::new), but rejects a configuration that fails
    /// [`HubConfig::validate`].
    pub fn try_new(config: HubConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Wire up all components; nothing is started until [`init`](Self::init).
    ///
    /// The configuration is used as given. A zero health check interval keeps
    /// periodic monitoring from starting.
    pub fn new(config: HubConfig) -> Self {
        let bus = EventBus::new(config.max_event_listeners, config.enable_debug_mode);
        let audit = AuditLog::with_bus(config.audit_log_capacity, config.enable_audit_log, bus.clone());
        bus.attach_audit(&audit);

        let registry = ModuleRegistry::new(bus.clone(), audit.clone());
        let store = SharedStore::new(bus.clone(), audit.clone());
        let health = HealthMonitor::new(
            config.health_settings(),
            registry.clone(),
            bus.clone(),
            audit.clone(),
        );
        if let Some(endpoint) = &config.health_endpoint {
            health.set_probe(Arc::new(HttpProbe::new(endpoint.clone())));
        }
        let workflows = WorkflowEngine::new(bus.clone(), audit.clone());

        Self {
            inner: Arc::new(HubInner {
                config,
                bus,
                audit,
                registry,
                store,
                health,
                workflows,
                started_at: Instant::now(),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Bring the hub up. Only the first call has any effect; it returns true.
    ///
    /// Registers the hub as module `hubcore`, installs the panic interceptor,
    /// starts health monitoring when configured and publishes `system.ready`.
    pub fn init(&self) -> bool {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Hub already initialized");
            return false;
        }

        let version = env!("CARGO_PKG_VERSION");
        self.inner.registry.register_module(
            CORE_MODULE_ID,
            ModuleMetadata::new("Hub Core", version).with_capabilities([
                "events",
                "shared-data",
                "health",
                "audit",
                "workflows",
            ]),
        );
        self.inner.health.set_heartbeat_module(CORE_MODULE_ID);

        ErrorInterceptor::install(&self.inner.audit);

        let monitoring = self.inner.config.auto_health_check && self.inner.health.start();
        if self.inner.config.auto_health_check && !monitoring {
            tracing::warn!("Automatic health checks requested but monitoring did not start");
        }

        self.inner.audit.log(
            AuditKind::System,
            "Hub initialized",
            json!({ "version": version, "healthMonitoring": monitoring }),
        );
        tracing::info!(version, monitoring, "Hub initialized");

        self.inner.bus.publish(
            SYSTEM_READY_EVENT,
            json!({
                "version": version,
                "modules": self.inner.registry.len(),
                "timestamp": chrono::Utc::now(),
            }),
        );
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Stop health monitoring and stop recording host panics
    pub fn shutdown(&self) {
        self.inner.health.stop();
        ErrorInterceptor::detach();
        self.inner.audit.log(
            AuditKind::System,
            "Hub shut down",
            json!({ "uptimeMs": self.uptime_ms() }),
        );
        tracing::info!("Hub shut down");
    }

    /// Invoke `method` on a registered module.
    ///
    /// The module must be registered with an implementation exposing `method`.
    /// Errors and panics raised by the module come back as `Err`. A CALL audit
    /// entry is written whatever the outcome.
    pub fn call_module(&self, module_id: &str, method: &str, args: &[Value]) -> Result<Value> {
        let started = Instant::now();
        let result = self.dispatch_call(module_id, method, args);
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            Some(e) => tracing::warn!(module = module_id, method, "Module call failed: {}", e),
            None => tracing::debug!(module = module_id, method, duration_ms, "Module call"),
        }
        self.inner.audit.log(
            AuditKind::Call,
            format!("Module call: {}.{}", module_id, method),
            json!({
                "moduleId": module_id,
                "method": method,
                "success": error.is_none(),
                "error": error,
                "durationMs": duration_ms,
            }),
        );
        result
    }

    fn dispatch_call(&self, module_id: &str, method: &str, args: &[Value]) -> Result<Value> {
        if !self.inner.registry.contains(module_id) {
            return Err(HubError::ModuleNotFound {
                id: module_id.to_string(),
            });
        }
        let instance = self
            .inner
            .registry
            .instance(module_id)
            .filter(|m| m.exposes(method))
            .ok_or_else(|| HubError::MethodNotFound {
                id: module_id.to_string(),
                method: method.to_string(),
            })?;

        self.inner.registry.update_module_activity(module_id);

        match interceptor::contain(|| instance.invoke(method, args)) {
            Ok(result) => result.map_err(HubError::from),
            Err(payload) => Err(ModuleError::Panicked {
                method: method.to_string(),
                message: panic_message(payload.as_ref()),
            }
            .into()),
        }
    }

    pub fn get_stats(&self) -> HubStats {
        HubStats {
            uptime_ms: self.uptime_ms(),
            initialized: self.is_initialized(),
            module_count: self.inner.registry.len(),
            event_count: self.inner.bus.event_count(),
            shared_entry_count: self.inner.store.len(),
            audit_entry_count: self.inner.audit.len(),
            workflow_count: self.inner.workflows.len(),
            health: self.inner.health.get_overall_health(),
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.inner.started_at.elapsed().as_millis() as u64
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.inner.workflows
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    pub fn register_module(&self, id: &str, metadata: ModuleMetadata) -> ModuleRecord {
        self.inner.registry.register_module(id, metadata)
    }

    pub fn register_module_with(
        &self,
        id: &str,
        metadata: ModuleMetadata,
        instance: Arc<dyn Module>,
    ) -> ModuleRecord {
        self.inner.registry.register_module_with(id, metadata, instance)
    }

    pub fn unregister_module(&self, id: &str) -> bool {
        self.inner.registry.unregister_module(id)
    }

    pub fn get_module(&self, id: &str) -> Option<ModuleRecord> {
        self.inner.registry.get_module(id)
    }

    pub fn get_all_modules(&self) -> Vec<ModuleRecord> {
        self.inner.registry.get_all_modules()
    }

    pub fn update_module_activity(&self, id: &str) -> bool {
        self.inner.registry.update_module_activity(id)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, event_name: &str, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(event_name, callback)
    }

    pub fn subscribe_with_context<F>(
        &self,
        event_name: &str,
        context: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Event) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_with_context(event_name, context, callback)
    }

    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(event_name, id)
    }

    pub fn publish(&self, event_name: &str, data: Value) -> usize {
        self.inner.bus.publish(event_name, data)
    }

    pub fn clear_event(&self, event_name: &str) -> bool {
        self.inner.bus.clear_event(event_name)
    }

    pub fn get_event_listeners(&self, event_name: &str) -> Vec<ListenerInfo> {
        self.inner.bus.get_event_listeners(event_name)
    }

    // ------------------------------------------------------------------
    // Shared data
    // ------------------------------------------------------------------

    pub fn set_shared_data(&self, key: &str, value: Value, options: SetOptions) {
        self.inner.store.set(key, value, options);
    }

    pub fn get_shared_data(&self, key: &str) -> Option<Value> {
        self.inner.store.get(key)
    }

    pub fn delete_shared_data(&self, key: &str) -> bool {
        self.inner.store.delete(key)
    }

    pub fn clear_shared_data(&self) -> usize {
        self.inner.store.clear()
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn start_health_monitoring(&self) -> bool {
        self.inner.health.start()
    }

    pub fn stop_health_monitoring(&self) -> bool {
        self.inner.health.stop()
    }

    pub async fn perform_health_check(&self, force: bool) -> HealthSnapshot {
        self.inner.health.perform_health_check(force).await
    }

    pub fn get_health_status(&self) -> HealthSnapshot {
        self.inner.health.get_health_status()
    }

    pub fn get_overall_health(&self) -> OverallHealth {
        self.inner.health.get_overall_health()
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub fn log(
        &self,
        kind: impl Into<AuditKind>,
        message: impl Into<String>,
        data: Value,
    ) -> Option<AuditEntry> {
        self.inner.audit.log(kind, message, data)
    }

    pub fn get_audit_log(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.inner.audit.entries(query)
    }

    pub fn clear_audit_log(&self) -> usize {
        self.inner.audit.clear()
    }

    pub fn export_audit_log(&self) -> AuditExport {
        self.inner.audit.export()
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub fn create_workflow(&self, name: &str, steps: Vec<WorkflowStep>) -> Result<String> {
        self.inner.workflows.create_workflow(name, steps)
    }

    pub fn trigger_workflow(&self, id: &str, data: Value) -> Result<usize> {
        self.inner.workflows.trigger_workflow(id, data)
    }
}
