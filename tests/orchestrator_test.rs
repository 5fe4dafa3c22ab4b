//! Scan orchestration tests

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vscanner::config::RuntimeErrorPolicy;
use vscanner::detector::NOT_IMPLEMENTED;
use vscanner::error::VscannerError;
use vscanner::models::{FailedExploit, ScanItem, ScanState};
use vscanner::scanner::{ScanRun, NO_TARGET, VULNERABILITY_NOT_FOUND};
use vscanner::store::{MemoryStore, ScanStore};

async fn catalog(store: &MemoryStore) {
    seed_vulnerability(store, "v1", Some("found")).await;
    seed_vulnerability(store, "v2", Some("passed")).await;
    seed_vulnerability(store, "v3", Some("throw TypeError: x is undefined")).await;
    seed_vulnerability(store, "v4", None).await;
    seed_vulnerability(store, "v5", Some("syntax Unexpected token '}'")).await;
}

#[tokio::test]
async fn test_successful_scan() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1,v2"), ("i2", "b.com", "v2")]).await;

    let runtime = ScriptedRuntime::new();
    let notifier = RecordingNotifier::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        notifier.clone(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;

    let ScanRun::Completed(report) = run else {
        panic!("scan should complete, got {run:?}");
    };
    assert_eq!(report.total_found, 1);
    assert_eq!(report.total_passed, 2);
    assert_eq!(report.total_failed, 0);

    let i1 = store.item("i1").await.expect("i1");
    assert_eq!(i1.found_exploits, vec!["v1"]);
    assert_eq!(i1.passed_count, 1);
    assert!(i1.failed_exploits.is_empty());
    assert!(i1.completed_at.is_some());

    let i2 = store.item("i2").await.expect("i2");
    assert!(i2.found_exploits.is_empty());
    assert_eq!(i2.passed_count, 1);

    let scan = store.load_scan("s1").await.expect("scan");
    assert_eq!(scan.state(), ScanState::Completed { fail_message: None });
    assert!(scan.completed_at > scan.started_at);

    assert_eq!(notifier.reports(), vec![report]);
    assert_eq!(runtime.targets(), vec!["a.com", "a.com", "b.com"]);
}

#[tokio::test]
async fn test_mixed_outcomes_fail_open() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "c.com", "v3,v4,v5")]).await;

    let runtime = ScriptedRuntime::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;
    assert!(matches!(run, ScanRun::Completed(_)));

    let item = store.item("i1").await.expect("item");
    assert!(item.found_exploits.is_empty());
    assert_eq!(item.passed_count, 1);
    assert_eq!(
        item.failed_exploits,
        vec![
            FailedExploit {
                id: "v4".to_string(),
                message: NOT_IMPLEMENTED.to_string(),
            },
            FailedExploit {
                id: "v5".to_string(),
                message: "Unexpected token '}'".to_string(),
            },
        ]
    );
    // The empty script never reaches the runtime
    assert_eq!(runtime.call_count(), 2);
}

#[tokio::test]
async fn test_runtime_error_fail_closed() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "c.com", "v3")]).await;

    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailClosed,
    );

    engine.start("s1").await.expect("start");
    engine.execute("s1", &no_cancel()).await;

    let item = store.item("i1").await.expect("item");
    assert_eq!(item.passed_count, 0);
    assert_eq!(
        item.failed_exploits,
        vec![FailedExploit {
            id: "v3".to_string(),
            message: "TypeError: x is undefined".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_store_failure_mid_scan() {
    let memory = Arc::new(MemoryStore::new());
    catalog(&memory).await;
    seed_scan(
        &memory,
        "s1",
        &[("i1", "a.com", "v1"), ("i2", "b.com", "v1"), ("i3", "c.com", "v1")],
    )
    .await;
    let store = FlakyStore::new(memory.clone(), 1);

    let notifier = RecordingNotifier::new();
    let engine = engine(
        store,
        ScriptedRuntime::new(),
        notifier.clone(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;

    let ScanRun::Failed(message) = run else {
        panic!("scan should fail, got {run:?}");
    };
    assert!(message.contains("connection terminated unexpectedly"));

    let scan = memory.load_scan("s1").await.expect("scan");
    assert_eq!(
        scan.state(),
        ScanState::Completed {
            fail_message: Some(message)
        }
    );
    assert!(memory.item("i1").await.expect("i1").completed_at.is_some());
    assert!(memory.item("i2").await.expect("i2").completed_at.is_none());
    assert!(memory.item("i3").await.expect("i3").completed_at.is_none());
    assert!(notifier.reports().is_empty());
}

#[tokio::test]
async fn test_missing_scan_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    let err = engine.start("nope").await.unwrap_err();
    assert!(matches!(err, VscannerError::ScanNotFound(_)));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_started_scan_cannot_restart() {
    let store = Arc::new(MemoryStore::new());
    seed_scan(&store, "s1", &[]).await;
    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    let started = engine.start("s1").await.expect("first start");
    let err = engine.start("s1").await.unwrap_err();
    assert!(matches!(err, VscannerError::InvalidTransition { .. }));

    let scan = store.load_scan("s1").await.expect("scan");
    assert_eq!(scan.started_at, started.started_at);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_notifier_failure_keeps_completion() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1")]).await;

    let notifier = RecordingNotifier::failing();
    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        notifier.clone(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;

    assert!(matches!(run, ScanRun::Completed(ref r) if r.total_found == 1));
    assert_eq!(notifier.reports().len(), 1);
    let scan = store.load_scan("s1").await.expect("scan");
    assert_eq!(scan.state(), ScanState::Completed { fail_message: None });
}

#[tokio::test]
async fn test_scan_without_items_completes_empty() {
    let store = Arc::new(MemoryStore::new());
    seed_scan(&store, "s1", &[]).await;
    let notifier = RecordingNotifier::new();
    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        notifier.clone(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;

    let ScanRun::Completed(report) = run else {
        panic!("scan should complete");
    };
    assert_eq!(
        (report.total_found, report.total_passed, report.total_failed),
        (0, 0, 0)
    );
    assert_eq!(notifier.reports().len(), 1);
}

#[tokio::test]
async fn test_unknown_vulnerability_and_missing_target() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    store.insert_scan(vscanner::models::Scan::new("s1")).await;
    store
        .insert_item(ScanItem::new("i1", "s1", Some("a.com".into()), None, "v1,ghost"))
        .await;
    store
        .insert_item(ScanItem::new("i2", "s1", None, Some("  ".into()), "v1,v4"))
        .await;

    let runtime = ScriptedRuntime::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &no_cancel()).await;
    let ScanRun::Completed(report) = run else {
        panic!("scan should complete");
    };
    assert_eq!(report.total_found, 1);
    assert_eq!(report.total_failed, 3);

    let i1 = store.item("i1").await.expect("i1");
    assert_eq!(i1.found_exploits, vec!["v1"]);
    assert_eq!(
        i1.failed_exploits,
        vec![FailedExploit {
            id: "ghost".to_string(),
            message: VULNERABILITY_NOT_FOUND.to_string(),
        }]
    );

    let i2 = store.item("i2").await.expect("i2");
    assert_eq!(
        i2.failed_exploits,
        vec![
            FailedExploit {
                id: "v1".to_string(),
                message: NO_TARGET.to_string(),
            },
            FailedExploit {
                id: "v4".to_string(),
                message: NOT_IMPLEMENTED.to_string(),
            },
        ]
    );
    assert_eq!(runtime.call_count(), 1);
}

#[tokio::test]
async fn test_domain_preferred_over_ip() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    store.insert_scan(vscanner::models::Scan::new("s1")).await;
    store
        .insert_item(ScanItem::new(
            "i1",
            "s1",
            Some("example.com".into()),
            Some("10.0.0.1".into()),
            "v2",
        ))
        .await;
    store
        .insert_item(ScanItem::new("i2", "s1", None, Some("10.0.0.2".into()), "v2"))
        .await;

    let runtime = ScriptedRuntime::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    engine.execute("s1", &no_cancel()).await;

    assert_eq!(runtime.targets(), vec!["example.com", "10.0.0.2"]);
}

#[tokio::test]
async fn test_every_vulnerability_gets_one_outcome() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(
        &store,
        "s1",
        &[
            ("i1", "a.com", "v1,v2,v3,v4,v5,ghost"),
            ("i2", "b.com", "v5,v1,v1"),
        ],
    )
    .await;

    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    engine.execute("s1", &no_cancel()).await;

    for item_id in ["i1", "i2"] {
        let item = store.item(item_id).await.expect("item");
        let recorded = item.found_exploits.len()
            + item.passed_count as usize
            + item.failed_exploits.len();
        assert_eq!(recorded, item.vulnerabilities.len(), "item {item_id}");
    }
}

#[tokio::test]
async fn test_started_before_any_detector_runs() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1")]).await;

    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    let started = engine.start("s1").await.expect("start");
    assert!(started.started_at.is_some());
    assert_eq!(
        store.load_scan("s1").await.expect("scan").state(),
        ScanState::Started
    );
    assert!(store.item("i1").await.expect("item").completed_at.is_none());

    engine.execute("s1", &no_cancel()).await;
    let item = store.item("i1").await.expect("item");
    assert!(item.completed_at > started.started_at);
}

#[tokio::test]
async fn test_cancel_stops_between_items() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1"), ("i2", "b.com", "v1")]).await;

    let runtime = ScriptedRuntime::new();
    let notifier = RecordingNotifier::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        notifier.clone(),
        RuntimeErrorPolicy::FailOpen,
    );

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).expect("send");

    engine.start("s1").await.expect("start");
    let run = engine.execute("s1", &rx).await;

    assert_eq!(run, ScanRun::Failed("scan cancelled".to_string()));
    assert_eq!(runtime.call_count(), 0);
    assert!(notifier.reports().is_empty());
    let scan = store.load_scan("s1").await.expect("scan");
    assert_eq!(scan.fail_message.as_deref(), Some("scan cancelled"));
}

#[tokio::test]
async fn test_item_completed_elsewhere_fails_scan() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1,v2"), ("i2", "b.com", "v1")]).await;

    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );
    engine.start("s1").await.expect("start");

    let mut done = vscanner::models::ItemResult::default();
    done.found.push("v1".to_string());
    store
        .complete_item("i1", &done, chrono::Utc::now())
        .await
        .expect("external completion");

    let run = engine.execute("s1", &no_cancel()).await;

    let ScanRun::Failed(message) = run else {
        panic!("scan should fail, got {run:?}");
    };
    assert!(message.contains("already completed"), "{message}");
    let i1 = store.item("i1").await.expect("i1");
    assert_eq!(i1.found_exploits, vec!["v1"]);
    assert_eq!(i1.passed_count, 0);
    assert!(store.item("i2").await.expect("i2").completed_at.is_none());
}

#[tokio::test]
async fn test_execute_runs_on_spawned_task() {
    let store = Arc::new(MemoryStore::new());
    catalog(&store).await;
    seed_scan(&store, "s1", &[("i1", "a.com", "v1,v2,ghost")]).await;

    let engine = Arc::new(
        engine(
            store.clone(),
            ScriptedRuntime::new(),
            RecordingNotifier::new(),
            RuntimeErrorPolicy::FailOpen,
        )
        .with_concurrency(2),
    );
    engine.start("s1").await.expect("start");

    let worker = Arc::clone(&engine);
    let run = tokio::spawn(async move { worker.execute("s1", &no_cancel()).await })
        .await
        .expect("worker task");

    let ScanRun::Completed(report) = run else {
        panic!("scan should complete, got {run:?}");
    };
    assert_eq!(
        (report.total_found, report.total_passed, report.total_failed),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_detector_concurrency_is_bounded_and_ordered() {
    let store = Arc::new(MemoryStore::new());
    for (id, script) in [
        ("d1", "slow found"),
        ("d2", "slow passed"),
        ("d3", "slow found"),
        ("d4", "slow passed"),
        ("d5", "slow found"),
    ] {
        seed_vulnerability(&store, id, Some(script)).await;
    }
    seed_scan(&store, "s1", &[("i1", "a.com", "d1,d2,d3,d4,d5")]).await;

    let runtime = ScriptedRuntime::new();
    let engine = engine(
        store.clone(),
        runtime.clone(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    )
    .with_concurrency(2);

    engine.start("s1").await.expect("start");
    engine.execute("s1", &no_cancel()).await;

    assert_eq!(runtime.max_in_flight.load(Ordering::SeqCst), 2);
    let item = store.item("i1").await.expect("item");
    assert_eq!(item.found_exploits, vec!["d1", "d3", "d5"]);
    assert_eq!(item.passed_count, 2);
}

#[tokio::test]
async fn test_report_stalled() {
    let store = Arc::new(MemoryStore::new());
    seed_scan(&store, "s1", &[]).await;
    seed_scan(&store, "s2", &[]).await;
    let engine = engine(
        store.clone(),
        ScriptedRuntime::new(),
        RecordingNotifier::new(),
        RuntimeErrorPolicy::FailOpen,
    );

    engine.start("s1").await.expect("start");
    assert_eq!(engine.report_stalled().await.expect("stalled"), 1);

    engine.execute("s1", &no_cancel()).await;
    assert_eq!(engine.report_stalled().await.expect("stalled"), 0);
}
