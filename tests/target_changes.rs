//! Target-Change Tests
//!
//! Function definitions on disk drive subscriptions through the engine.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use aerofn::engine::TargetChangeEngine;
use aerofn::enqueuer::{TargetSubscriber, TriggerKind};
use aerofn::queue::Target;

fn write_definition(root: &Path, id: &str, body: serde_json::Value) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("function.json"), body.to_string()).unwrap();
}

#[tokio::test]
async fn test_definitions_drive_subscriptions() {
    let root = tempfile::tempdir().unwrap();
    let replica = common::standalone();
    let engine = TargetChangeEngine::new(root.path(), replica.enqueuers.clone());

    write_definition(
        root.path(),
        "chat",
        json!({
            "name": "chat",
            "triggers": {
                "on_message": { "type": "firehose", "options": { "event": "message" } },
                "nightly": { "type": "schedule", "active": false, "options": { "frequency": "0 0 * * *" } }
            }
        }),
    );
    let report = engine.sync().unwrap();
    assert_eq!(report.applied, 1);

    let subscriptions = replica.enqueuers.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].kind, TriggerKind::Firehose);
    assert_eq!(subscriptions[0].options, json!({ "event": "message" }));
    assert_eq!(
        subscriptions[0].target.cwd,
        root.path().join("chat").display().to_string()
    );

    // Unchanged definitions produce no changes.
    assert_eq!(engine.sync().unwrap().applied, 0);

    write_definition(
        root.path(),
        "chat",
        json!({
            "name": "chat",
            "triggers": {
                "on_message": { "type": "firehose", "options": { "event": "**" } }
            }
        }),
    );
    engine.sync().unwrap();
    let subscriptions = replica.enqueuers.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].options, json!({ "event": "**" }));

    fs::remove_dir_all(root.path().join("chat")).unwrap();
    engine.sync().unwrap();
    assert!(replica.enqueuers.subscriptions().is_empty());
    assert_eq!(engine.active(), 0);
}

#[tokio::test]
async fn test_invalid_options_are_reported_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let replica = common::standalone();
    let engine = TargetChangeEngine::new(root.path(), replica.enqueuers.clone());

    write_definition(
        root.path(),
        "mixed",
        json!({
            "triggers": {
                "broken": { "type": "schedule", "options": { "frequency": "not a cron" } },
                "ok": { "type": "firehose", "options": { "event": "*" } }
            }
        }),
    );

    let report = engine.sync().unwrap();
    assert_eq!(report.applied, 2);

    let subscriptions = replica.enqueuers.subscriptions();
    let firehose = subscriptions
        .iter()
        .find(|s| s.kind == TriggerKind::Firehose)
        .unwrap();
    assert!(!firehose.status.closed);
    let schedule = subscriptions
        .iter()
        .find(|s| s.kind == TriggerKind::Schedule)
        .unwrap();
    assert!(schedule.status.closed);
    assert!(schedule.status.error_message.is_some());
}

#[tokio::test]
async fn test_subscribe_unsubscribe_subscribe_leaves_one() {
    let replica = common::standalone();
    let target = common::target("/functions/fn", "default", 10);

    replica
        .enqueuers
        .subscribe(target.clone(), TriggerKind::Firehose, json!({ "event": "*" }))
        .unwrap();
    assert_eq!(replica.enqueuers.unsubscribe(&target), 1);
    replica
        .enqueuers
        .subscribe(target.clone(), TriggerKind::Firehose, json!({ "event": "chat" }))
        .unwrap();

    let subscriptions = replica.enqueuers.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].options, json!({ "event": "chat" }));

    // A handler-less target selects every handler of the function.
    let whole = Target::function("fn", "/functions/fn");
    assert_eq!(replica.enqueuers.unsubscribe(&whole), 1);
    assert!(replica.enqueuers.subscriptions().is_empty());
}

#[tokio::test]
async fn test_engine_shutdown_unsubscribes_everything() {
    let root = tempfile::tempdir().unwrap();
    let replica = common::standalone();
    let engine = Arc::new(TargetChangeEngine::new(root.path(), replica.enqueuers.clone()));

    write_definition(
        root.path(),
        "a",
        json!({ "triggers": { "h": { "type": "firehose", "options": { "event": "x" } } } }),
    );
    write_definition(
        root.path(),
        "b",
        json!({ "triggers": { "h": { "type": "http", "options": { "path": "/b" } } } }),
    );
    engine.sync().unwrap();
    assert_eq!(replica.enqueuers.subscriptions().len(), 2);

    let report = engine.shutdown().unwrap();
    assert_eq!(report.applied, 2);
    assert!(replica.enqueuers.subscriptions().is_empty());
}
