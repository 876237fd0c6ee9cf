//! Quality gate integration tests.
//!
//! These tests verify that completion reports are held to the gate
//! profile of the task's domain, and that a failed gate sends the task
//! back to its worker instead of completing it.

use conductor::core::task::{Domain, TaskSpec};
use conductor::core::{TaskStatus, TddPhase, Worker};
use conductor::orchestration::gates::{NO_CRITICAL_FINDINGS, TDD_ORDERING, UNIT_COVERAGE};
use conductor::orchestration::{AuditDetail, AuditEventType, GateResult, Outcome};

use crate::fixtures::{evidence_with_coverage, generic_backend, passing_evidence, TestEngine};

fn gate_results(engine: &TestEngine) -> Vec<GateResult> {
    engine
        .entries_of(AuditEventType::GateEvaluated)
        .into_iter()
        .map(|entry| match entry.detail {
            AuditDetail::GateEvaluated { result, .. } => result,
            other => panic!("expected gate evaluation, got {:?}", other),
        })
        .collect()
}

fn schema_task() -> TaskSpec {
    TaskSpec::new("schema", Domain::Backend, "Create users table")
}

/// Test: Green without Red fails the TDD gate
/// Given a coding task whose worker jumps straight to Green
/// When the worker reports success with otherwise passing evidence
/// Then the task reverts to plain in_progress and is handed out again
#[tokio::test(start_paused = true)]
async fn test_green_without_red_reverts() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(schema_task()).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    engine.handle.report(first.phase(TddPhase::Green)).unwrap();
    engine
        .handle
        .report(first.finished(Outcome::Success, passing_evidence(), 40))
        .unwrap();

    let second = engine.next_assignment().await;
    assert_eq!(second.worker, "generic-backend");
    assert_eq!(second.task.attempts, 2);
    assert_eq!(second.task.status, TaskStatus::InProgress);
    assert_eq!(second.task.tdd_phase, None);

    let rejected = engine.entries_of(AuditEventType::TransitionRejected);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].before_state.as_deref(), Some("in_progress"));

    let results = gate_results(&engine);
    assert_eq!(results.len(), 1);
    assert!(!results[0].passed);
    assert_eq!(results[0].failed_gates, vec![TDD_ORDERING.to_string()]);

    engine.complete(&second, passing_evidence());
    run.await.unwrap().unwrap();

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.quality_evidence[TDD_ORDERING].passed);
    assert_eq!(gate_results(&engine).len(), 2);
}

/// Test: Coverage threshold is inclusive and exact
/// Given the default 80% coverage threshold
/// When a worker reports 0.7999 and then 0.80
/// Then the first report fails the gate and the second completes the task
#[tokio::test(start_paused = true)]
async fn test_coverage_boundary() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(schema_task()).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    engine.complete(&first, evidence_with_coverage("0.7999"));
    let second = engine.next_assignment().await;
    engine.complete(&second, evidence_with_coverage("0.80"));
    run.await.unwrap().unwrap();

    let results = gate_results(&engine);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].failed_gates, vec![UNIT_COVERAGE.to_string()]);
    assert!(results[1].passed);

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
    assert!(task.quality_evidence[UNIT_COVERAGE].passed);
}

/// Test: Docs tasks skip TDD and coverage
/// Given a docs task
/// When its worker reports success without phases, tests or coverage
/// Then only the critical findings gate is evaluated
#[tokio::test]
async fn test_docs_profile_has_no_tdd_gate() {
    let mut engine = TestEngine::new();
    engine
        .register(&[Worker::new("writer").with_capability("docs")])
        .await;
    let id = engine
        .submit(TaskSpec::new("guide", Domain::Docs, "Write the API guide"))
        .await;
    let run = engine.start();

    let assignment = engine.next_assignment().await;
    engine
        .handle
        .report(assignment.finished(Outcome::Success, Default::default(), 10))
        .unwrap();
    run.await.unwrap().unwrap();

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let gates: Vec<&str> = task.quality_evidence.keys().map(|k| k.as_str()).collect();
    assert_eq!(gates, vec![NO_CRITICAL_FINDINGS]);
}
