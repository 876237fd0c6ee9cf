//! Delegation routing integration tests.
//!
//! These tests run the orchestration loop end to end and verify which
//! worker each task is handed to, and what the ledger records about why.

use conductor::config::{Config, RoutingTier};
use conductor::core::{CircuitState, TaskStatus};
use conductor::orchestration::escalation::EscalationTrigger;
use conductor::orchestration::retry::FailureKind;
use conductor::orchestration::{AuditDetail, AuditEventType, Outcome};

use crate::fixtures::{
    generic_backend, passing_evidence, rails_specialist, rails_task, TestEngine,
};

/// Test: Framework specialist wins over a domain match
/// Given a rails specialist and a generic backend worker
/// When a rails backend task is routed
/// Then the specialist gets it and the decision lists both candidates
#[tokio::test]
async fn test_framework_specialist_preferred() {
    let mut engine = TestEngine::new();
    engine
        .register(&[rails_specialist(), generic_backend()])
        .await;
    let id = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let assignment = engine.next_assignment().await;
    assert_eq!(assignment.worker, "rails-specialist");
    assert_eq!(assignment.rationale, "framework match on 'rails'");
    assert_eq!(assignment.task.attempts, 1);

    engine.complete(&assignment, passing_evidence());
    let summary = run.await.unwrap().unwrap();
    assert!(!summary.halted);
    assert_eq!(summary.counts.completed, 1);

    let task = engine.handle.task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_worker.as_deref(), Some("rails-specialist"));

    let delegated = engine.entries_of(AuditEventType::Delegated);
    assert_eq!(delegated.len(), 1);
    assert_eq!(delegated[0].seq, assignment.assignment);
    match &delegated[0].detail {
        AuditDetail::Delegated { decision } => {
            assert_eq!(decision.tier, RoutingTier::Framework);
            assert_eq!(decision.candidates.len(), 2);
            assert_eq!(decision.candidates[1].worker, "generic-backend");
            assert_eq!(decision.candidates[1].tier, RoutingTier::Domain);
        }
        other => panic!("expected delegation, got {:?}", other),
    }
}

/// Test: Open circuit falls back to the next tier
/// Given a rails specialist that times out until its circuit opens
/// When another rails task is submitted
/// Then it goes to the generic backend and the rationale names the skip
#[tokio::test(start_paused = true)]
async fn test_open_circuit_falls_back_to_domain_tier() {
    let mut engine = TestEngine::new();
    engine
        .register(&[rails_specialist(), generic_backend()])
        .await;
    let first = engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    for attempt in 1..=3 {
        let assignment = engine.next_assignment().await;
        assert_eq!(assignment.worker, "rails-specialist");
        assert_eq!(assignment.task.attempts, attempt);
        engine
            .handle
            .report(assignment.finished(
                Outcome::failure(FailureKind::Timeout, "no response"),
                Default::default(),
                30_000,
            ))
            .unwrap();
    }

    let escalation = engine.next_escalation().await;
    assert_eq!(escalation.task_id(), Some(&first));
    assert_eq!(
        escalation.trigger,
        EscalationTrigger::RetriesExhausted { attempts: 3 }
    );

    let snapshot = engine.handle.snapshot().await.unwrap();
    let rails = snapshot
        .workers
        .iter()
        .find(|w| w.name() == "rails-specialist")
        .unwrap();
    assert_eq!(rails.circuit_state, CircuitState::Open);
    let opened = engine.entries_of(AuditEventType::CircuitStateChanged);
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].entity_id, "rails-specialist");
    assert_eq!(opened[0].after_state.as_deref(), Some("open"));

    let second = engine.submit(rails_task("api-orders")).await;
    let assignment = engine.next_assignment().await;
    assert_eq!(assignment.task_id(), &second);
    assert_eq!(assignment.worker, "generic-backend");
    assert_eq!(
        assignment.rationale,
        "fallback to domain tier on 'backend'; rails-specialist skipped: circuit open"
    );

    engine.handle.abandon(&first, "specialist unavailable").await.unwrap();
    engine.complete(&assignment, passing_evidence());
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.abandoned, 1);
}

/// Test: Config changes apply to the next decision
/// Given a running loop that routed one task by framework
/// When the framework tier is removed from the config
/// Then the next rails task is routed by domain instead
#[tokio::test]
async fn test_config_change_applies_to_next_decision() {
    let mut engine = TestEngine::new();
    engine
        .register(&[rails_specialist(), generic_backend()])
        .await;
    engine.submit(rails_task("api-users")).await;
    let run = engine.start();

    let first = engine.next_assignment().await;
    assert_eq!(first.worker, "rails-specialist");

    let mut config = Config::default();
    config.routing.tiers = vec![RoutingTier::Domain, RoutingTier::Generalist];
    engine.handle.config().replace(config).unwrap();

    engine.submit(rails_task("api-orders")).await;
    let second = engine.next_assignment().await;
    assert_eq!(second.worker, "generic-backend");
    assert_eq!(second.rationale, "domain match on 'backend'");

    engine.complete(&first, passing_evidence());
    engine.complete(&second, passing_evidence());
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.counts.completed, 2);
}
