//! hubcore: in-process orchestration core
//!
//! Lets independently built feature modules of one application find each
//! other, exchange events, share short-lived data, run triggered multi-step
//! workflows and be health-checked, with every significant action kept in a
//! bounded audit log.
//!
//! Start from [`Hub`], which owns one instance of each component.

pub mod audit;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod hub;
pub mod interceptor;
pub mod logging;
pub mod registry;
pub mod shared_store;
pub mod workflow;

pub use audit::{AuditEntry, AuditExport, AuditKind, AuditLog, AuditQuery};
pub use config::HubConfig;
pub use error::{HubError, ListenerError, ModuleError, ProbeError, Result, StepError};
pub use event_bus::{Event, EventBus, ListenerInfo, SubscriptionHandle, SubscriptionId};
pub use health::{
    BackendStatus, FnProbe, HealthMonitor, HealthProbe, HealthSettings, HealthSnapshot,
    HttpProbe, OverallHealth, ProbeResponse,
};
pub use hub::{Hub, HubStats, CORE_MODULE_ID};
pub use interceptor::ErrorInterceptor;
pub use registry::{Module, ModuleMetadata, ModuleRecord, ModuleRegistry, ModuleStatus};
pub use shared_store::{SetOptions, SharedEntry, SharedStore};
pub use workflow::{StepContext, WorkflowEngine, WorkflowOutcome, WorkflowStep, WorkflowSummary};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a component mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
