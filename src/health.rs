//! Health monitoring
//!
//! The [`HealthMonitor`] probes one external dependency and scans the module
//! registry for stale modules, either on demand or periodically on the tokio
//! runtime.
//!
//! # Aggregation
//!
//! | Condition                                  | Overall    |
//! |--------------------------------------------|------------|
//! | dependency offline, or more than 3 issues  | `critical` |
//! | dependency degraded, or any issue          | `degraded` |
//! | otherwise                                  | `healthy`  |
//!
//! Reading the last snapshot never triggers a probe.

use crate::audit::{AuditKind, AuditLog};
use crate::error::{panic_message, ProbeError};
use crate::event_bus::EventBus;
use crate::interceptor;
use crate::lock_or_recover;
use crate::registry::{ModuleRegistry, ModuleStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub const HEALTH_CHECKED_EVENT: &str = "health.checked";

/// Issues beyond this count make the overall status critical
const CRITICAL_ISSUE_COUNT: usize = 3;

/// Status of the probed dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Healthy,
    Degraded,
    Offline,
    Unknown,
}

/// Aggregate status of the whole hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
    /// No check has completed yet
    Unknown,
}

impl OverallHealth {
    fn aggregate(backend: BackendStatus, issues: usize) -> Self {
        if backend == BackendStatus::Offline || issues > CRITICAL_ISSUE_COUNT {
            OverallHealth::Critical
        } else if backend == BackendStatus::Degraded || issues > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
            OverallHealth::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub backend_status: BackendStatus,
    pub overall: OverallHealth,
    pub module_status: BTreeMap<String, ModuleStatus>,
    pub issues: Vec<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub probe_latency_ms: Option<u64>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            backend_status: BackendStatus::Unknown,
            overall: OverallHealth::Unknown,
            module_status: BTreeMap::new(),
            issues: Vec::new(),
            last_check: None,
            probe_latency_ms: None,
        }
    }
}

/// Successful probe answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResponse {
    Healthy,
    /// Reachable but reporting a problem
    Unhealthy(String),
}

/// A dependency check run by the monitor under its own timeout
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    fn probe(&self) -> BoxFuture<'_, Result<ProbeResponse, ProbeError>>;
}

/// Probes an HTTP endpoint: 2xx is healthy, any other status degraded,
/// transport failures offline.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HealthProbe for HttpProbe {
    fn name(&self) -> &str {
        &self.url
    }

    fn probe(&self) -> BoxFuture<'_, Result<ProbeResponse, ProbeError>> {
        async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
            let status = response.status();
            if status.is_success() {
                Ok(ProbeResponse::Healthy)
            } else {
                Ok(ProbeResponse::Unhealthy(format!("HTTP {}", status)))
            }
        }
        .boxed()
    }
}

/// Adapts an async closure into a [`HealthProbe`]
pub struct FnProbe<F> {
    name: String,
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResponse, ProbeError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResponse, ProbeError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> BoxFuture<'_, Result<ProbeResponse, ProbeError>> {
        (self.check)().boxed()
    }
}

/// Timing knobs for the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub stale_threshold: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

struct Ticker {
    stop: watch::Sender<bool>,
}

struct MonitorInner {
    settings: HealthSettings,
    probe: Mutex<Option<Arc<dyn HealthProbe>>>,
    snapshot: Mutex<HealthSnapshot>,
    /// Module kept alive by the monitor itself (the hub's own record)
    heartbeat_module: Mutex<Option<String>>,
    ticker: Mutex<Option<Ticker>>,
    registry: ModuleRegistry,
    bus: EventBus,
    audit: AuditLog,
}

/// Health monitor handle; clones share state
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.inner.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        settings: HealthSettings,
        registry: ModuleRegistry,
        bus: EventBus,
        audit: AuditLog,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                settings,
                probe: Mutex::new(None),
                snapshot: Mutex::new(HealthSnapshot::default()),
                heartbeat_module: Mutex::new(None),
                ticker: Mutex::new(None),
                registry,
                bus,
                audit,
            }),
        }
    }

    pub fn settings(&self) -> HealthSettings {
        self.inner.settings
    }

    /// Replace the dependency probe
    pub fn set_probe(&self, probe: Arc<dyn HealthProbe>) {
        tracing::info!(probe = probe.name(), "Health probe configured");
        *lock_or_recover(&self.inner.probe) = Some(probe);
    }

    pub fn clear_probe(&self) {
        *lock_or_recover(&self.inner.probe) = None;
    }

    /// Keep `module_id` active on every check instead of scanning it for staleness
    pub fn set_heartbeat_module(&self, module_id: impl Into<String>) {
        *lock_or_recover(&self.inner.heartbeat_module) = Some(module_id.into());
    }

    /// Start periodic checks on the current tokio runtime.
    ///
    /// The first check runs immediately. Returns false when already running,
    /// when the check interval is zero or when called outside a runtime.
    pub fn start(&self) -> bool {
        let mut ticker = lock_or_recover(&self.inner.ticker);
        if ticker.is_some() {
            return false;
        }
        if self.inner.settings.check_interval.is_zero() {
            tracing::warn!("Cannot start health monitoring with a zero check interval");
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Cannot start health monitoring outside a tokio runtime: {}", e);
                return false;
            }
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.check_interval;

        runtime.spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        // Not raced against stop: a check in flight runs to completion
                        HealthMonitor { inner }.perform_health_check(true).await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!("Health monitoring loop exited");
        });

        *ticker = Some(Ticker { stop: stop_tx });
        tracing::info!(interval_secs = interval.as_secs(), "Health monitoring started");
        true
    }

    /// Prevent further scheduled checks; returns false when not running
    pub fn stop(&self) -> bool {
        match lock_or_recover(&self.inner.ticker).take() {
            Some(ticker) => {
                let _ = ticker.stop.send(true);
                tracing::info!("Health monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.inner.ticker).is_some()
    }

    /// Run a check now.
    ///
    /// Unless `force` is set, a snapshot younger than the check interval is
    /// returned as-is without probing.
    pub async fn perform_health_check(&self, force: bool) -> HealthSnapshot {
        if !force {
            let current = self.get_health_status();
            if let Some(last) = current.last_check {
                let age = (Utc::now() - last).to_std().unwrap_or_default();
                if age < self.inner.settings.check_interval {
                    return current;
                }
            }
        }

        let (backend_status, probe_latency_ms, probe_issue) = self.probe_backend().await;
        let mut issues: Vec<String> = probe_issue.into_iter().collect();
        let module_status = self.scan_modules(&mut issues);
        let overall = OverallHealth::aggregate(backend_status, issues.len());

        let snapshot = HealthSnapshot {
            backend_status,
            overall,
            module_status,
            issues,
            last_check: Some(Utc::now()),
            probe_latency_ms,
        };

        let previous = {
            let mut current = lock_or_recover(&self.inner.snapshot);
            std::mem::replace(&mut *current, snapshot.clone()).overall
        };

        if previous != overall {
            tracing::info!(from = %previous, to = %overall, "Overall health changed");
            self.inner.audit.log(
                AuditKind::Health,
                format!("Health changed from {} to {}", previous, overall),
                json!({ "from": previous, "to": overall, "issues": snapshot.issues }),
            );
        }

        match serde_json::to_value(&snapshot) {
            Ok(payload) => {
                self.inner.bus.publish(HEALTH_CHECKED_EVENT, payload);
            }
            Err(e) => tracing::warn!("Failed to serialize health snapshot: {}", e),
        }
        snapshot
    }

    async fn probe_backend(&self) -> (BackendStatus, Option<u64>, Option<String>) {
        let probe = lock_or_recover(&self.inner.probe).clone();
        let Some(probe) = probe else {
            return (BackendStatus::Unknown, None, None);
        };

        let timeout = self.inner.settings.probe_timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, interceptor::contain_future(probe.probe())).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(ProbeError::Unreachable(format!(
                "probe panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => Err(ProbeError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(ProbeResponse::Healthy) => (BackendStatus::Healthy, Some(elapsed_ms), None),
            Ok(ProbeResponse::Unhealthy(reason)) => (
                BackendStatus::Degraded,
                Some(elapsed_ms),
                Some(format!("Dependency '{}' degraded: {}", probe.name(), reason)),
            ),
            Err(e) => {
                tracing::warn!(probe = probe.name(), "Health probe failed: {}", e);
                (
                    BackendStatus::Offline,
                    None,
                    Some(format!("Dependency '{}' offline: {}", probe.name(), e)),
                )
            }
        }
    }

    fn scan_modules(&self, issues: &mut Vec<String>) -> BTreeMap<String, ModuleStatus> {
        let heartbeat = lock_or_recover(&self.inner.heartbeat_module).clone();
        if let Some(id) = &heartbeat {
            self.inner.registry.update_module_activity(id);
        }

        let now = Utc::now();
        let threshold = self.inner.settings.stale_threshold;
        let mut statuses = BTreeMap::new();

        for module in self.inner.registry.get_all_modules() {
            let idle = (now - module.last_activity).to_std().unwrap_or_default();
            let status = if idle > threshold {
                self.inner.registry.mark_stale(&module.id);
                issues.push(format!(
                    "Module '{}' inactive for {}s",
                    module.id,
                    idle.as_secs()
                ));
                ModuleStatus::Stale
            } else {
                module.status
            };
            statuses.insert(module.id, status);
        }
        statuses
    }

    /// Last computed snapshot
    pub fn get_health_status(&self) -> HealthSnapshot {
        lock_or_recover(&self.inner.snapshot).clone()
    }

    pub fn get_overall_health(&self) -> OverallHealth {
        lock_or_recover(&self.inner.snapshot).overall
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleMetadata;

    fn monitor(settings: HealthSettings) -> (HealthMonitor, ModuleRegistry) {
        let bus = EventBus::default();
        let audit = AuditLog::with_bus(100, true, bus.clone());
        let registry = ModuleRegistry::new(bus.clone(), audit.clone());
        (
            HealthMonitor::new(settings, registry.clone(), bus, audit),
            registry,
        )
    }

    #[test]
    fn test_aggregate_rules() {
        use BackendStatus::*;
        assert_eq!(OverallHealth::aggregate(Healthy, 0), OverallHealth::Healthy);
        assert_eq!(OverallHealth::aggregate(Unknown, 0), OverallHealth::Healthy);
        assert_eq!(OverallHealth::aggregate(Healthy, 1), OverallHealth::Degraded);
        assert_eq!(OverallHealth::aggregate(Degraded, 0), OverallHealth::Degraded);
        assert_eq!(OverallHealth::aggregate(Healthy, 3), OverallHealth::Degraded);
        assert_eq!(OverallHealth::aggregate(Healthy, 4), OverallHealth::Critical);
        assert_eq!(OverallHealth::aggregate(Offline, 0), OverallHealth::Critical);
    }

    #[test]
    fn test_initial_snapshot_is_unknown() {
        let (monitor, _) = monitor(HealthSettings::default());
        let snapshot = monitor.get_health_status();
        assert_eq!(snapshot.overall, OverallHealth::Unknown);
        assert!(snapshot.last_check.is_none());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_healthy_probe() {
        let (monitor, registry) = monitor(HealthSettings::default());
        registry.register_module("a", ModuleMetadata::new("A", "1"));
        monitor.set_probe(Arc::new(FnProbe::new("ok", || async {
            Ok(ProbeResponse::Healthy)
        })));

        let snapshot = monitor.perform_health_check(true).await;
        assert_eq!(snapshot.backend_status, BackendStatus::Healthy);
        assert_eq!(snapshot.overall, OverallHealth::Healthy);
        assert_eq!(snapshot.module_status.get("a"), Some(&ModuleStatus::Active));
        assert!(snapshot.issues.is_empty());
        assert_eq!(monitor.get_health_status(), snapshot);
    }

    #[tokio::test]
    async fn test_unhealthy_response_is_degraded() {
        let (monitor, _) = monitor(HealthSettings::default());
        monitor.set_probe(Arc::new(FnProbe::new("api", || async {
            Ok(ProbeResponse::Unhealthy("HTTP 503".to_string()))
        })));

        let snapshot = monitor.perform_health_check(true).await;
        assert_eq!(snapshot.backend_status, BackendStatus::Degraded);
        assert_eq!(snapshot.overall, OverallHealth::Degraded);
        assert_eq!(snapshot.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_offline() {
        let settings = HealthSettings {
            probe_timeout: Duration::from_millis(20),
            ..HealthSettings::default()
        };
        let (monitor, _) = monitor(settings);
        monitor.set_probe(Arc::new(FnProbe::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProbeResponse::Healthy)
        })));

        let snapshot = monitor.perform_health_check(true).await;
        assert_eq!(snapshot.backend_status, BackendStatus::Offline);
        assert_eq!(snapshot.overall, OverallHealth::Critical);
        assert!(snapshot.issues[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_stale_module_detection() {
        let settings = HealthSettings {
            stale_threshold: Duration::from_millis(20),
            ..HealthSettings::default()
        };
        let (monitor, registry) = monitor(settings);
        registry.register_module("idle", ModuleMetadata::new("Idle", "1"));
        registry.register_module("core", ModuleMetadata::new("Core", "1"));
        monitor.set_heartbeat_module("core");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = monitor.perform_health_check(true).await;

        assert_eq!(snapshot.module_status.get("idle"), Some(&ModuleStatus::Stale));
        assert_eq!(snapshot.module_status.get("core"), Some(&ModuleStatus::Active));
        assert_eq!(registry.get_module("idle").unwrap().status, ModuleStatus::Stale);
        assert_eq!(snapshot.overall, OverallHealth::Degraded);
        assert_eq!(snapshot.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_unforced_check_reuses_recent_snapshot() {
        let (monitor, _) = monitor(HealthSettings::default());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        monitor.set_probe(Arc::new(FnProbe::new("counted", move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok(ProbeResponse::Healthy) }
        })));

        let first = monitor.perform_health_check(true).await;
        let second = monitor.perform_health_check(false).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        monitor.get_health_status();
        monitor.get_overall_health();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let settings = HealthSettings {
            check_interval: Duration::from_millis(20),
            ..HealthSettings::default()
        };
        let (monitor, _) = monitor(settings);

        assert!(monitor.start());
        assert!(!monitor.start());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.get_health_status().last_check.is_some());

        assert!(monitor.stop());
        assert!(!monitor.stop());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_zero_interval_refuses_to_start() {
        let (monitor, _) = monitor(HealthSettings {
            check_interval: Duration::ZERO,
            ..HealthSettings::default()
        });
        assert!(!monitor.start());
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (monitor, _) = monitor(HealthSettings::default());
        assert!(!monitor.start());
    }
}
