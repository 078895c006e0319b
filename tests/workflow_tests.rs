//! Workflow engine integration tests
//!
//! Runs are started through the trigger event and observed through the
//! completion and error events, as a module would.

use hubcore::{
    AuditKind, AuditQuery, Hub, HubConfig, StepContext, StepError, WorkflowOutcome, WorkflowStep,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn test_hub() -> Hub {
    let hub = Hub::new(HubConfig {
        auto_health_check: false,
        ..HubConfig::default()
    });
    hub.init();
    hub
}

fn tracked(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> WorkflowStep {
    let log = Arc::clone(log);
    WorkflowStep::new(name, move |ctx: StepContext, data: Value| {
        let log = Arc::clone(&log);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            log.lock().unwrap().push(ctx.step_name.clone());
            if fail {
                Err(StepError::failed(format!("{} rejected the order", ctx.step_name)))
            } else {
                Ok(data)
            }
        }
    })
}

fn channel_for(hub: &Hub, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    hub.subscribe(event, move |e| {
        let _ = tx.send(e.data.clone());
        Ok(())
    })
    .unwrap();
    rx
}

#[tokio::test]
async fn test_failing_middle_step_aborts_run() {
    let hub = test_hub();
    let ran = Arc::new(Mutex::new(Vec::new()));
    let id = hub
        .create_workflow(
            "fulfil-order",
            vec![
                tracked("reserve", &ran, false),
                tracked("charge", &ran, true),
                tracked("ship", &ran, false),
            ],
        )
        .unwrap();

    let mut errors = channel_for(&hub, &format!("workflow.{}.error", id));
    let mut completions = channel_for(&hub, &format!("workflow.{}.complete", id));

    assert_eq!(hub.trigger_workflow(&id, json!({ "order": 17 })).unwrap(), 1);

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("error event not published")
        .unwrap();
    assert_eq!(error["step"], json!(1));
    assert_eq!(error["stepName"], json!("charge"));
    assert!(error["error"].as_str().unwrap().contains("rejected"));

    assert_eq!(*ran.lock().unwrap(), vec!["reserve", "charge"]);
    assert!(completions.try_recv().is_err());
    assert_eq!(hub.workflows().get_workflow(&id).unwrap().executions, 1);

    let failures = hub.get_audit_log(&AuditQuery::new().kind(AuditKind::Error));
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("charge"));
}

#[tokio::test]
async fn test_triggered_run_completes_with_final_payload() {
    let hub = test_hub();
    let double = WorkflowStep::sync("double", |_, data| {
        let n = data["n"].as_i64().ok_or_else(|| StepError::failed("n missing"))?;
        Ok(json!({ "n": n * 2 }))
    });
    let id = hub
        .create_workflow("double-twice", vec![double.clone(), double])
        .unwrap();
    let mut completions = channel_for(&hub, &format!("workflow.{}.complete", id));

    hub.trigger_workflow(&id, json!({ "n": 3 })).unwrap();
    let done = tokio::time::timeout(Duration::from_secs(2), completions.recv())
        .await
        .expect("complete event not published")
        .unwrap();

    assert_eq!(done, json!({ "data": { "n": 12 } }));
    let workflow_entries = hub.get_audit_log(&AuditQuery::new().kind(AuditKind::Workflow));
    assert_eq!(workflow_entries.len(), 3);
}

#[tokio::test]
async fn test_each_trigger_counts_one_execution() {
    let hub = test_hub();
    let id = hub
        .create_workflow("noop", vec![WorkflowStep::sync("pass", |_, data| Ok(data))])
        .unwrap();

    for _ in 0..3 {
        let outcome = hub.workflows().run_workflow(&id, Value::Null).await.unwrap();
        assert!(outcome.is_completed());
    }
    assert_eq!(hub.workflows().get_workflow(&id).unwrap().executions, 3);
    assert_eq!(hub.workflows().list_workflows().len(), 1);
}

#[tokio::test]
async fn test_failed_run_does_not_affect_next_run() {
    let hub = test_hub();
    let attempts = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = WorkflowStep::sync("flaky", move |_, data| {
        let mut n = counter.lock().unwrap();
        *n += 1;
        if *n == 1 {
            Err(StepError::failed("first attempt fails"))
        } else {
            Ok(data)
        }
    });
    let id = hub.create_workflow("flaky", vec![flaky]).unwrap();

    let first = hub.workflows().run_workflow(&id, json!(1)).await.unwrap();
    assert!(matches!(first, WorkflowOutcome::Failed { step: 0, .. }));
    let second = hub.workflows().run_workflow(&id, json!(1)).await.unwrap();
    assert_eq!(second, WorkflowOutcome::Completed { data: json!(1) });
}
