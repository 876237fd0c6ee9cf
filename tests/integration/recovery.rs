//! Failure handling and operator recovery integration tests.
//!
//! These tests verify that transient failures are retried with backoff,
//! that exhausted or persistent failures block and escalate the task,
//! and that operator commands bring blocked tasks back.

use std::time::Duration;
use tokio::time::Instant;

use conductor::core::{TaskStatus, Worker};
use conductor::orchestration::escalation::EscalationTrigger;
use conductor::orchestration::retry::FailureKind;
use conductor::orchestration::{AuditEventType, Outcome, RejectionReason, WorkerDirective};
use conductor::Error;

use crate::fixtures::{
    docs_task, generic_backend, passing_evidence, rails_specialist, rails_task, TestEngine,
};

fn timeout() -> Outcome {
    Outcome::failure(FailureKind::Timeout, "no response within 30s")
}

/// Test: Transient failure is retried after the base delay
/// Given a worker that times out once
/// When the loop handles the failure
/// Then the task is redelegated no earlier than one second later and completes
#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_with_backoff() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    let failed_at = Instant::now();
    engine
        .handle
        .report(first.finished(timeout(), Default::default(), 30_000))
        .unwrap();

    let second = engine.next_assignment().await;
    assert!(failed_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(second.task.attempts, 2);
    assert!(second.assignment > first.assignment);

    engine.complete(&second, passing_evidence());
    run.await.unwrap().unwrap();

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(engine.entries_of(AuditEventType::OutcomeReported).len(), 2);
}

/// Test: Exhausted retries block and escalate
/// Given a worker that always times out
/// When the third attempt fails
/// Then the task is blocked and the escalation carries every failure
#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_escalates() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let started = Instant::now();
    for _ in 0..3 {
        let assignment = engine.next_assignment().await;
        engine
            .handle
            .report(assignment.finished(timeout(), Default::default(), 30_000))
            .unwrap();
    }

    let escalation = engine.next_escalation().await;
    // 1s then 2s of backoff between the three attempts
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(
        escalation.trigger,
        EscalationTrigger::RetriesExhausted { attempts: 3 }
    );
    assert_eq!(escalation.failure_history.len(), 3);
    assert!(escalation.failure_history[0].contains("timeout"));

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Blocked {
            reason: "retries exhausted after 3 attempts".to_string()
        }
    );
    assert_eq!(engine.entries_of(AuditEventType::Escalated).len(), 1);

    engine.handle.abandon(&id, "giving up").await.unwrap();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.counts.abandoned, 1);
}

/// Test: No eligible worker escalates, requeue recovers
/// Given only a react worker for a rails task
/// When routing fails three times in a row
/// Then the task is blocked with the rejections, and a requeue after
/// registering a rails specialist completes it
#[tokio::test(start_paused = true)]
async fn test_no_eligible_worker_then_requeue() {
    let mut engine = TestEngine::new();
    engine
        .register(&[Worker::new("react-dev").with_capability("react")])
        .await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let escalation = engine.next_escalation().await;
    assert_eq!(
        escalation.trigger,
        EscalationTrigger::NoEligibleWorker { attempts: 3 }
    );
    assert_eq!(escalation.rejections.len(), 1);
    assert_eq!(escalation.rejections[0].worker, "react-dev");
    assert_eq!(
        escalation.rejections[0].reason,
        RejectionReason::CapabilityMismatch
    );
    assert_eq!(engine.entries_of(AuditEventType::RoutingFailed).len(), 3);

    let task = engine.handle.task(&id).await.unwrap();
    assert!(matches!(task.status, TaskStatus::Blocked { .. }));
    assert_eq!(task.attempts, 0);

    engine.register(&[rails_specialist()]).await;
    engine.handle.requeue(&id).await.unwrap();

    let assignment = engine.next_assignment().await;
    assert_eq!(assignment.worker, "rails-specialist");
    assert_eq!(assignment.task.attempts, 1);
    engine.complete(&assignment, passing_evidence());
    run.await.unwrap().unwrap();

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

/// Test: Persistent failure blocks immediately, resume retries it
/// Given a worker that is denied permission on its first attempt
/// When the operator resumes the blocked task
/// Then it is redelegated without waiting on any backoff and can complete
#[tokio::test(start_paused = true)]
async fn test_persistent_failure_then_resume() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    engine
        .handle
        .report(first.finished(
            Outcome::failure(FailureKind::PermissionDenied, "cannot write db/"),
            Default::default(),
            5,
        ))
        .unwrap();

    let escalation = engine.next_escalation().await;
    assert_eq!(
        escalation.trigger,
        EscalationTrigger::PersistentFailure {
            kind: FailureKind::PermissionDenied
        }
    );
    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.attempts, 1);
    assert!(matches!(task.status, TaskStatus::Blocked { .. }));

    // Persistent failures say nothing about the worker's health
    let snapshot = engine.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.workers[0].failure_count, 0);

    let resumed_at = Instant::now();
    engine.handle.resume(&id).await.unwrap();
    let second = engine.next_assignment().await;
    assert!(resumed_at.elapsed() < Duration::from_secs(1));
    assert_eq!(second.worker, "generic-backend");
    assert_eq!(second.task.attempts, 2);

    engine.complete(&second, passing_evidence());
    run.await.unwrap().unwrap();
    assert_eq!(
        engine.handle.task(&id).await.unwrap().status,
        TaskStatus::Completed
    );
}

/// Test: Operator commands on the wrong state are rejected and ledgered
/// Given a task that has not been blocked
/// When the operator tries to requeue it
/// Then the command fails with an invalid transition
#[tokio::test]
async fn test_requeue_of_unblocked_task_rejected() {
    let mut engine = TestEngine::new();
    engine
        .register(&[Worker::new("writer").with_capability("docs")])
        .await;
    let id = engine.submit(docs_task("guide")).await;
    let run = engine.start();

    let assignment = engine.next_assignment().await;
    let err = engine.handle.requeue(&id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    let rejected = engine.entries_of(AuditEventType::TransitionRejected);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].actor, "operator");

    engine.complete(&assignment, passing_evidence());
    run.await.unwrap().unwrap();
}

/// Test: Reports for an abandoned assignment are discarded
/// Given two docs tasks in progress
/// When one is abandoned and its worker reports success afterwards
/// Then the worker is told to stop, the late report changes nothing, and
/// the other task still completes
#[tokio::test]
async fn test_late_report_after_abandon_discarded() {
    let mut engine = TestEngine::new();
    engine
        .register(&[Worker::new("writer").with_capability("docs")])
        .await;
    let guide = engine.submit(docs_task("guide")).await;
    engine.submit(docs_task("readme")).await;
    let run = engine.start();

    let a = engine.next_assignment().await;
    let b = engine.next_assignment().await;
    let (abandoned, kept) = if a.task_id() == &guide { (a, b) } else { (b, a) };

    engine
        .handle
        .abandon(&guide, "superseded by the wiki")
        .await
        .unwrap();
    match engine.directives.recv().await.unwrap() {
        WorkerDirective::Cancel {
            task_id,
            worker,
            assignment,
        } => {
            assert_eq!(task_id, guide);
            assert_eq!(worker, "writer");
            assert_eq!(assignment, abandoned.assignment);
        }
        other => panic!("expected cancel, got {:?}", other),
    }

    engine.complete(&abandoned, passing_evidence());
    engine.complete(&kept, passing_evidence());
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.abandoned, 1);

    let task = engine.handle.task(&guide).await.unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Abandoned {
            reason: "superseded by the wiki".to_string()
        }
    );
    assert!(task.quality_evidence.is_empty());
    // Only the live assignment's report reached the ledger
    assert_eq!(engine.entries_of(AuditEventType::OutcomeReported).len(), 1);
    assert_eq!(engine.entries_of(AuditEventType::GateEvaluated).len(), 1);
}

/// Test: A report from a superseded attempt is discarded
/// Given a task that timed out and was handed out again
/// When the first attempt's success report arrives late
/// Then it is ignored and only the second attempt completes the task
#[tokio::test(start_paused = true)]
async fn test_stale_attempt_report_discarded() {
    let mut engine = TestEngine::new();
    engine.register(&[generic_backend()]).await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    engine
        .handle
        .report(first.finished(timeout(), Default::default(), 30_000))
        .unwrap();
    let second = engine.next_assignment().await;

    engine.complete(&first, passing_evidence());
    assert_eq!(
        engine.handle.task(&id).await.unwrap().status,
        TaskStatus::InProgress
    );

    engine.complete(&second, passing_evidence());
    run.await.unwrap().unwrap();

    let gates = engine.entries_of(AuditEventType::GateEvaluated);
    assert_eq!(gates.len(), 1);
    assert_eq!(
        engine.handle.task(&id).await.unwrap().status,
        TaskStatus::Completed
    );
}

/// Test: Halt stops the loop with work in flight
/// Given a task in progress
/// When the operator halts
/// Then the run ends as halted and the task is left in progress
#[tokio::test]
async fn test_halt_leaves_work_in_flight() {
    let mut engine = TestEngine::new();
    engine
        .register(&[Worker::new("writer").with_capability("docs")])
        .await;
    let id = engine.submit(docs_task("guide")).await;
    let run = engine.start();

    engine.next_assignment().await;
    engine.handle.halt();
    let summary = run.await.unwrap().unwrap();
    assert!(summary.halted);
    assert_eq!(summary.counts.in_progress, 1);
    assert_eq!(
        engine.handle.task(&id).await.unwrap().status,
        TaskStatus::InProgress
    );
}
