//! Panic interception tests
//!
//! The panic hook is process-wide, so everything lives in one test to keep
//! the audit target stable.

use hubcore::{AuditKind, AuditQuery, ErrorInterceptor, Hub, HubConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_uncaught_panics_are_audited() {
    let hub = Hub::new(HubConfig {
        auto_health_check: false,
        ..HubConfig::default()
    });
    hub.init();
    assert!(ErrorInterceptor::is_installed());

    let uncaught = || {
        hub.get_audit_log(&AuditQuery::new().kind(AuditKind::Error))
            .into_iter()
            .filter(|e| e.message.starts_with("Uncaught panic"))
            .collect::<Vec<_>>()
    };

    // Plain thread
    let joined = std::thread::Builder::new()
        .name("worker".to_string())
        .spawn(|| panic!("worker failed"))
        .unwrap()
        .join();
    assert!(joined.is_err());

    let entries = uncaught();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data["message"], json!("worker failed"));
    assert_eq!(entries[0].data["thread"], json!("worker"));
    // Its audit.log event is still queued
    assert_eq!(hub.audit().flush_pending(), 1);

    // A failing audit.log observer runs outside the hook and is isolated
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&observed);
    hub.subscribe("audit.log", move |event| {
        let message = event.data["message"].as_str().unwrap_or_default();
        if message.starts_with("Uncaught") {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("observer bug");
        }
        Ok(())
    })
    .unwrap();
    let joined = std::thread::spawn(|| panic!("host failure")).join();
    assert!(joined.is_err());
    let entries = uncaught();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].data["message"], json!("host failure"));
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    hub.publish("after.host.failure", json!(null));
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(hub.audit().flush_pending(), 0);

    // Tokio task
    let task = tokio::spawn(async { panic!("task failed") });
    assert!(task.await.is_err());
    assert_eq!(uncaught().len(), 3);

    // Contained by the bus: audited as a listener failure, not as uncaught
    hub.subscribe("tick", |_| panic!("listener failed")).unwrap();
    assert_eq!(hub.publish("tick", json!(null)), 0);
    assert_eq!(uncaught().len(), 3);

    // Contained by a workflow step
    let id = hub
        .create_workflow(
            "explodes",
            vec![hubcore::WorkflowStep::sync("boom", |_, _| panic!("step failed"))],
        )
        .unwrap();
    let outcome = hub.workflows().run_workflow(&id, json!(null)).await.unwrap();
    assert!(!outcome.is_completed());
    assert_eq!(uncaught().len(), 3);

    // Detached: panics pass through unrecorded
    hub.shutdown();
    let _ = std::thread::spawn(|| panic!("after shutdown")).join();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(uncaught().len(), 3);
}
