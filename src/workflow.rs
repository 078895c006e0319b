//! Workflow engine
//!
//! A workflow is a named, ordered list of steps bound to the private event
//! `workflow.{id}.trigger`. Each trigger spawns one run on the tokio runtime;
//! steps of a run execute strictly one after another, each receiving a
//! [`StepContext`] and the payload returned by the previous step.
//!
//! The first failing step (error or panic) ends the run: later steps are
//! skipped, an ERROR audit entry is written and `workflow.{id}.error` is
//! published. There is no retry and no rollback.

use crate::audit::{AuditKind, AuditLog};
use crate::error::{panic_message, HubError, ListenerError, Result, StepError};
use crate::event_bus::{EventBus, SubscriptionHandle};
use crate::interceptor;
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

pub fn trigger_event(workflow_id: &str) -> String {
    format!("workflow.{}.trigger", workflow_id)
}

pub fn complete_event(workflow_id: &str) -> String {
    format!("workflow.{}.complete", workflow_id)
}

pub fn error_event(workflow_id: &str) -> String {
    format!("workflow.{}.error", workflow_id)
}

/// What a step knows about its position in the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub workflow_id: String,
    pub workflow_name: String,
    /// Zero-based
    pub step_index: usize,
    pub step_name: String,
    pub total_steps: usize,
}

type StepFn = dyn Fn(StepContext, Value) -> BoxFuture<'static, std::result::Result<Value, StepError>>
    + Send
    + Sync;

/// One named step of a workflow
#[derive(Clone)]
pub struct WorkflowStep {
    name: String,
    run: Arc<StepFn>,
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep").field("name", &self.name).finish()
    }
}

impl WorkflowStep {
    /// Async step.
    ///
    /// The returned value replaces the payload: the next step receives it
    /// instead of the trigger data. A step that only reads its input should
    /// return it unchanged so later steps still see it.
    pub fn new<F, Fut>(name: impl Into<String>, step: F) -> Self
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |ctx, data| step(ctx, data).boxed()),
        }
    }

    /// Step that completes without awaiting anything
    pub fn sync<F>(name: impl Into<String>, step: F) -> Self
    where
        F: Fn(&StepContext, Value) -> std::result::Result<Value, StepError> + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        Self::new(name, move |ctx, data| {
            let step = Arc::clone(&step);
            async move { (*step)(&ctx, data) }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How a single run ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed { data: Value },
    Failed {
        step: usize,
        step_name: String,
        error: String,
    },
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkflowOutcome::Completed { .. })
    }
}

/// Read-only view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub steps: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub executions: u64,
}

struct Workflow {
    id: String,
    name: String,
    steps: Vec<WorkflowStep>,
    created_at: DateTime<Utc>,
    executions: AtomicU64,
    trigger: SubscriptionHandle,
}

impl Workflow {
    fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            steps: self.steps.iter().map(|s| s.name.clone()).collect(),
            created_at: self.created_at,
            executions: self.executions.load(Ordering::SeqCst),
        }
    }
}

struct EngineInner {
    workflows: Mutex<HashMap<String, Arc<Workflow>>>,
    bus: EventBus,
    audit: AuditLog,
}

/// Workflow engine handle; clones share the same workflows
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(bus: EventBus, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows: Mutex::new(HashMap::new()),
                bus,
                audit,
            }),
        }
    }

    /// Define a workflow and bind it to its trigger event; returns the new id
    pub fn create_workflow(&self, name: &str, steps: Vec<WorkflowStep>) -> Result<String> {
        if steps.is_empty() {
            return Err(HubError::EmptyWorkflow);
        }

        let id = format!("wf_{}", Uuid::new_v4().simple());
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let workflow_id = id.clone();
        let trigger = self.inner.bus.subscribe_with_context(
            &trigger_event(&id),
            "workflow",
            move |event| {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| ListenerError::new(format!("cannot run workflow: {}", e)))?;
                let engine = WorkflowEngine { inner };
                let id = workflow_id.clone();
                let data = event.data.clone();
                runtime.spawn(async move {
                    if let Err(e) = engine.run_workflow(&id, data).await {
                        tracing::warn!(workflow = %id, "Triggered workflow did not run: {}", e);
                    }
                });
                Ok(())
            },
        )?;

        let workflow = Workflow {
            id: id.clone(),
            name: name.to_string(),
            steps,
            created_at: Utc::now(),
            executions: AtomicU64::new(0),
            trigger,
        };
        let step_names: Vec<String> = workflow.steps.iter().map(|s| s.name.clone()).collect();
        lock_or_recover(&self.inner.workflows).insert(id.clone(), Arc::new(workflow));

        tracing::info!(workflow = %id, name, steps = step_names.len(), "Workflow created");
        self.inner.audit.log(
            AuditKind::Workflow,
            format!("Workflow created: {}", name),
            json!({ "workflowId": id, "name": name, "steps": step_names }),
        );
        Ok(id)
    }

    /// Publish the trigger event; the run itself happens on a spawned task.
    ///
    /// Returns the number of trigger handlers that accepted the event.
    pub fn trigger_workflow(&self, id: &str, data: Value) -> Result<usize> {
        if !self.contains(id) {
            return Err(HubError::WorkflowNotFound { id: id.to_string() });
        }
        Ok(self.inner.bus.publish(&trigger_event(id), data))
    }

    /// Execute one run inline and wait for it
    pub async fn run_workflow(&self, id: &str, data: Value) -> Result<WorkflowOutcome> {
        let workflow = lock_or_recover(&self.inner.workflows)
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::WorkflowNotFound { id: id.to_string() })?;

        let execution = workflow.executions.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(workflow = %workflow.id, execution, "Workflow started");
        self.inner.audit.log(
            AuditKind::Workflow,
            format!("Workflow started: {}", workflow.name),
            json!({ "workflowId": workflow.id, "execution": execution }),
        );

        let total_steps = workflow.steps.len();
        let mut payload = data;
        for (index, step) in workflow.steps.iter().enumerate() {
            let ctx = StepContext {
                workflow_id: workflow.id.clone(),
                workflow_name: workflow.name.clone(),
                step_index: index,
                step_name: step.name.clone(),
                total_steps,
            };
            tracing::debug!(workflow = %workflow.id, step = index, name = %step.name, "Running step");

            match Self::run_step(step, ctx, payload).await {
                Ok(next) => payload = next,
                Err(e) => return Ok(self.fail(&workflow, index, &step.name, e)),
            }
        }

        tracing::info!(workflow = %workflow.id, execution, "Workflow completed");
        self.inner.audit.log(
            AuditKind::Workflow,
            format!("Workflow completed: {}", workflow.name),
            json!({ "workflowId": workflow.id, "execution": execution }),
        );
        self.inner
            .bus
            .publish(&complete_event(&workflow.id), json!({ "data": payload }));
        Ok(WorkflowOutcome::Completed { data: payload })
    }

    async fn run_step(
        step: &WorkflowStep,
        ctx: StepContext,
        payload: Value,
    ) -> std::result::Result<Value, StepError> {
        let future = interceptor::contain(|| (step.run)(ctx, payload))
            .map_err(|p| StepError::Panicked(panic_message(p.as_ref())))?;
        match interceptor::contain_future(future).await {
            Ok(result) => result,
            Err(p) => Err(StepError::Panicked(panic_message(p.as_ref()))),
        }
    }

    fn fail(&self, workflow: &Workflow, index: usize, step_name: &str, error: StepError) -> WorkflowOutcome {
        let error = error.to_string();
        tracing::error!(workflow = %workflow.id, step = index, name = step_name, "Workflow step failed: {}", error);
        self.inner.audit.log(
            AuditKind::Error,
            format!("Workflow '{}' failed at step '{}'", workflow.name, step_name),
            json!({
                "workflowId": workflow.id,
                "step": index,
                "stepName": step_name,
                "error": error,
            }),
        );
        self.inner.bus.publish(
            &error_event(&workflow.id),
            json!({ "step": index, "stepName": step_name, "error": error }),
        );
        WorkflowOutcome::Failed {
            step: index,
            step_name: step_name.to_string(),
            error,
        }
    }

    pub fn get_workflow(&self, id: &str) -> Option<WorkflowSummary> {
        lock_or_recover(&self.inner.workflows)
            .get(id)
            .map(|w| w.summary())
    }

    /// Summaries of all workflows, oldest first
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut list: Vec<WorkflowSummary> = lock_or_recover(&self.inner.workflows)
            .values()
            .map(|w| w.summary())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Delete a workflow and its trigger binding; runs in flight finish
    pub fn remove_workflow(&self, id: &str) -> bool {
        let removed = lock_or_recover(&self.inner.workflows).remove(id);
        match removed {
            Some(workflow) => {
                workflow.trigger.unsubscribe();
                tracing::info!(workflow = id, "Workflow removed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_or_recover(&self.inner.workflows).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.workflows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
