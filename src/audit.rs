//! Audit log
//!
//! Bounded, most-recent-first history of significant actions. Entries are kept
//! in a ring buffer, mirrored to `tracing`, and republished on the event bus as
//! `audit.log` so observers can react without polling.

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

/// Event published for every appended entry
pub const AUDIT_LOG_EVENT: &str = "audit.log";
/// Event published when the log is cleared
pub const AUDIT_CLEARED_EVENT: &str = "audit.cleared";

/// Default number of entries retained
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Category of an audit entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuditKind {
    System,
    Module,
    Event,
    Error,
    Call,
    Workflow,
    Data,
    Health,
    /// Host-defined category, stored upper-cased
    Custom(String),
}

impl AuditKind {
    pub fn as_str(&self) -> &str {
        match self {
            AuditKind::System => "SYSTEM",
            AuditKind::Module => "MODULE",
            AuditKind::Event => "EVENT",
            AuditKind::Error => "ERROR",
            AuditKind::Call => "CALL",
            AuditKind::Workflow => "WORKFLOW",
            AuditKind::Data => "DATA",
            AuditKind::Health => "HEALTH",
            AuditKind::Custom(name) => name,
        }
    }
}

impl From<String> for AuditKind {
    fn from(s: String) -> Self {
        match s.to_uppercase().as_str() {
            "SYSTEM" => AuditKind::System,
            "MODULE" => AuditKind::Module,
            "EVENT" => AuditKind::Event,
            "ERROR" => AuditKind::Error,
            "CALL" => AuditKind::Call,
            "WORKFLOW" => AuditKind::Workflow,
            "DATA" => AuditKind::Data,
            "HEALTH" => AuditKind::Health,
            other => AuditKind::Custom(other.to_string()),
        }
    }
}

impl From<&str> for AuditKind {
    fn from(s: &str) -> Self {
        AuditKind::from(s.to_string())
    }
}

impl From<AuditKind> for String {
    fn from(kind: AuditKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number, unique per log
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub message: String,
    pub data: Value,
}

/// Filter for [`AuditLog::entries`]
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kind: Option<AuditKind>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: AuditKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Portable serialized form produced by [`AuditLog::export`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditExport {
    pub exported_at: DateTime<Utc>,
    pub count: usize,
    pub entries: Vec<AuditEntry>,
}

pub(crate) struct AuditInner {
    /// Front is the most recent entry
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    enabled: bool,
    next_id: AtomicU64,
    bus: Option<EventBus>,
    /// Entries recorded from the panic hook, not yet published as `audit.log`
    pending: Mutex<Vec<AuditEntry>>,
}

/// Bounded audit log handle; clones share the same buffer
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("enabled", &self.inner.enabled)
            .finish()
    }
}

impl AuditLog {
    /// Create a standalone log that does not republish entries
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, true, None)
    }

    /// Create a log that republishes every entry through `bus`
    pub fn with_bus(capacity: usize, enabled: bool, bus: EventBus) -> Self {
        Self::build(capacity, enabled, Some(bus))
    }

    fn build(capacity: usize, enabled: bool, bus: Option<EventBus>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(AuditInner {
                entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
                capacity,
                enabled,
                next_id: AtomicU64::new(1),
                bus,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<AuditInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<AuditInner> {
        Arc::downgrade(&self.inner)
    }

    /// Append an entry, evicting the oldest once over capacity.
    ///
    /// Returns `None` when auditing is disabled.
    pub fn log(
        &self,
        kind: impl Into<AuditKind>,
        message: impl Into<String>,
        data: Value,
    ) -> Option<AuditEntry> {
        if !self.inner.enabled {
            return None;
        }
        let entry = self.make_entry(kind.into(), message.into(), data);
        {
            let mut entries = lock_or_recover(&self.inner.entries);
            Self::push(&mut entries, entry.clone(), self.inner.capacity);
        }
        self.trace(&entry);
        self.flush_pending();
        self.publish(&entry);
        Some(entry)
    }

    /// Variant of [`log`](Self::log) that never blocks; used from the panic hook,
    /// which may fire while this thread already holds the buffer lock.
    ///
    /// Subscribers must not run inside the hook, so the `audit.log` event is
    /// queued and published by the next [`log`](Self::log), bus publish or
    /// [`flush_pending`](Self::flush_pending).
    pub(crate) fn try_log(
        &self,
        kind: AuditKind,
        message: String,
        data: Value,
    ) -> Option<AuditEntry> {
        if !self.inner.enabled {
            return None;
        }
        let entry = self.make_entry(kind, message, data);
        match self.inner.entries.try_lock() {
            Ok(mut entries) => Self::push(&mut entries, entry.clone(), self.inner.capacity),
            Err(TryLockError::Poisoned(poisoned)) => {
                Self::push(&mut poisoned.into_inner(), entry.clone(), self.inner.capacity)
            }
            Err(TryLockError::WouldBlock) => return None,
        }
        self.trace(&entry);
        if self.inner.bus.is_some() {
            match self.inner.pending.try_lock() {
                Ok(mut pending) => pending.push(entry.clone()),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().push(entry.clone()),
                Err(TryLockError::WouldBlock) => {
                    tracing::warn!(target: "hubcore::audit", id = entry.id, "audit.log event dropped")
                }
            }
        }
        Some(entry)
    }

    /// Publish `audit.log` for entries recorded from the panic hook.
    ///
    /// Returns how many were published.
    pub fn flush_pending(&self) -> usize {
        if self.inner.bus.is_none() {
            return 0;
        }
        let queued = std::mem::take(&mut *lock_or_recover(&self.inner.pending));
        for entry in &queued {
            self.publish(entry);
        }
        queued.len()
    }

    fn make_entry(&self, kind: AuditKind, message: String, data: Value) -> AuditEntry {
        AuditEntry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
            message,
            data,
        }
    }

    fn push(entries: &mut VecDeque<AuditEntry>, entry: AuditEntry, capacity: usize) {
        entries.push_front(entry);
        while entries.len() > capacity {
            entries.pop_back();
        }
    }

    fn trace(&self, entry: &AuditEntry) {
        if entry.kind == AuditKind::Error {
            tracing::error!(target: "hubcore::audit", id = entry.id, "{}", entry.message);
        } else {
            tracing::debug!(
                target: "hubcore::audit",
                id = entry.id,
                kind = %entry.kind,
                "{}",
                entry.message
            );
        }
    }

    fn publish(&self, entry: &AuditEntry) {
        if let Some(bus) = &self.inner.bus {
            match serde_json::to_value(entry) {
                Ok(payload) => {
                    bus.publish(AUDIT_LOG_EVENT, payload);
                }
                Err(e) => tracing::warn!("Failed to serialize audit entry {}: {}", entry.id, e),
            }
        }
    }

    /// Entries matching `query`, most recent first
    pub fn entries(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = lock_or_recover(&self.inner.entries);
        let filtered = entries
            .iter()
            .filter(|e| query.kind.as_ref().map_or(true, |k| &e.kind == k))
            .filter(|e| query.since.map_or(true, |since| e.timestamp >= since))
            .cloned();
        match query.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        }
    }

    /// Empty the log and announce it as `audit.cleared`
    pub fn clear(&self) -> usize {
        let removed = {
            let mut entries = lock_or_recover(&self.inner.entries);
            let removed = entries.len();
            entries.clear();
            removed
        };
        tracing::info!(removed, "Audit log cleared");
        if let Some(bus) = &self.inner.bus {
            bus.publish(
                AUDIT_CLEARED_EVENT,
                json!({ "count": removed, "timestamp": Utc::now() }),
            );
        }
        removed
    }

    /// Snapshot of the whole log
    pub fn export(&self) -> AuditExport {
        let entries = self.entries(&AuditQuery::default());
        AuditExport {
            exported_at: Utc::now(),
            count: entries.len(),
            entries,
        }
    }

    /// Snapshot serialized as pretty-printed JSON
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
