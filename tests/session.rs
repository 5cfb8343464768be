//! Session-level scenarios driven through the public API with a scripted executor.

use gatework::capability::{Capability, CapabilityRequest, ExecutionResult};
use gatework::completion::{COMPLETION_SIGNAL, CompletionDetector};
use gatework::error::PipelineError;
use gatework::gate::{Finding, Severity};
use gatework::orchestrator::{EngineConfig, SessionOutcome, WorkflowEngine};
use gatework::state_machine::{ItemStatus, WorkItem};
use gatework::store::SessionStore;
use gatework::test_support::{ScriptedExecutor, seed_store};
use tempfile::TempDir;

fn items(n: usize) -> Vec<WorkItem> {
    (1..=n)
        .map(|i| WorkItem::new(format!("F-{i}"), format!("Feature {i}"), i as u32))
        .collect()
}

#[tokio::test]
async fn fifth_item_completes_backlog_and_signals_once() {
    let tmp = TempDir::new().unwrap();
    let store = seed_store(tmp.path(), "META", items(5), &["F-1", "F-2", "F-3", "F-4"]).unwrap();

    let mut engine =
        WorkflowEngine::open(ScriptedExecutor::passing(), store, EngineConfig::default()).unwrap();
    let before = CompletionDetector::check(engine.backlog()).unwrap();
    assert_eq!((before.done, before.total), (4, 5));
    assert!(!before.all_complete);

    let report = engine.run_session().await.unwrap();
    assert_eq!(report.committed, vec!["F-5"]);
    assert!(report.status.all_complete);

    let signals: Vec<&str> = [report, engine.run_session().await.unwrap()]
        .iter()
        .filter_map(|r| r.completion_signal())
        .collect();
    assert_eq!(signals, vec![COMPLETION_SIGNAL]);
}

#[tokio::test]
async fn state_survives_between_sessions() {
    let tmp = TempDir::new().unwrap();
    seed_store(tmp.path(), "META", items(3), &[]).unwrap();

    let config = EngineConfig {
        max_items_per_session: Some(1),
        ..Default::default()
    };
    for expected_done in 1..=2 {
        let mut engine = WorkflowEngine::open(
            ScriptedExecutor::passing(),
            SessionStore::new(tmp.path()),
            config.clone(),
        )
        .unwrap();
        let report = engine.run_session().await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Incomplete);
        assert_eq!(report.status.done, expected_done);
    }

    let mut engine = WorkflowEngine::open(
        ScriptedExecutor::passing(),
        SessionStore::new(tmp.path()),
        config,
    )
    .unwrap();
    let report = engine.run_session().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Complete);
    assert_eq!(report.committed, vec!["F-3"]);
}

#[tokio::test]
async fn meta_item_is_never_selected_or_counted() {
    let tmp = TempDir::new().unwrap();
    let store = seed_store(tmp.path(), "META", items(1), &[]).unwrap();
    let mut engine =
        WorkflowEngine::open(ScriptedExecutor::passing(), store, EngineConfig::default()).unwrap();

    let report = engine.run_session().await.unwrap();
    assert_eq!(report.status.total, 1);
    assert_eq!(engine.backlog().get("META").unwrap().status, ItemStatus::Open);

    let narratives: Vec<String> = engine
        .executor()
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            CapabilityRequest::Track(gatework::capability::TrackRequest::Narrative {
                item_id,
                ..
            }) => Some(item_id),
            _ => None,
        })
        .collect();
    assert_eq!(narratives, vec!["META"]);
}

#[tokio::test]
async fn done_count_never_decreases_across_failures() {
    let tmp = TempDir::new().unwrap();
    let store = seed_store(tmp.path(), "META", items(3), &["F-1"]).unwrap();
    let exec = ScriptedExecutor::passing();
    // F-2's review keeps failing until its loop is exhausted.
    for _ in 0..3 {
        exec.push(
            Capability::Review,
            Ok(ExecutionResult {
                findings: vec![Finding::new(Severity::High, "missing auth check")],
                ..Default::default()
            }),
        );
    }
    let mut engine = WorkflowEngine::open(exec, store, EngineConfig::default()).unwrap();

    let report = engine.run_session().await.unwrap();
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.committed, vec!["F-3"]);
    assert_eq!(report.status.done, 2);
    assert_eq!(engine.backlog().get("F-1").unwrap().status, ItemStatus::Done);
    assert_eq!(engine.backlog().get("F-2").unwrap().status, ItemStatus::Open);
}

#[tokio::test]
async fn second_writer_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = seed_store(tmp.path(), "META", items(1), &[]).unwrap();
    let mut engine =
        WorkflowEngine::open(ScriptedExecutor::passing(), store, EngineConfig::default()).unwrap();

    // Another process advances the run state behind the engine's back.
    let other = SessionStore::new(tmp.path());
    let mut run = other.load_run_state().unwrap();
    other.save_run_state(&mut run).unwrap();

    let err = engine.run_session().await.unwrap_err();
    assert!(matches!(err, PipelineError::RevisionConflict { .. }));
    assert!(err.is_session_fatal());
}
