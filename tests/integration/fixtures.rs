//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building an orchestrator with inspectable channels
//! - Standard workers and tasks (rails specialist, generic backend)
//! - Driving a worker through TDD phases and completion

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use conductor::config::{Config, ConfigHandle};
use conductor::core::evidence::{Evidence, Fraction, ScanReport};
use conductor::core::task::{Domain, TaskId, TaskSpec, TddPhase};
use conductor::core::worker::Worker;
use conductor::orchestration::{
    Assignment, AuditEntry, AuditEventType, AuditFilter, AuditLedger, Escalation,
    EscalationSink, Orchestrator, OrchestratorHandle, Outcome, RunSummary, WorkerDirective,
};
use conductor::plan::Script;
use conductor::simulate::script_reports;
use conductor::Result;

/// An orchestrator running on its own task, with the worker-side and
/// operator-side channels exposed to the test.
pub struct TestEngine {
    pub handle: OrchestratorHandle,
    pub directives: mpsc::UnboundedReceiver<WorkerDirective>,
    pub escalations: mpsc::UnboundedReceiver<Escalation>,
    pub ledger: Arc<AuditLedger>,
    orchestrator: Option<Orchestrator>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_ledger(config, Arc::new(AuditLedger::new()))
    }

    pub fn with_ledger(config: Config, ledger: Arc<AuditLedger>) -> Self {
        let (sink, escalations) = EscalationSink::channel();
        let (orchestrator, directives) =
            Orchestrator::new(ConfigHandle::new(config), Arc::clone(&ledger), sink);
        Self {
            handle: orchestrator.handle(),
            directives,
            escalations,
            ledger,
            orchestrator: Some(orchestrator),
        }
    }

    /// Start the loop. Can only be called once.
    pub fn start(&mut self) -> JoinHandle<Result<RunSummary>> {
        let mut orchestrator = self
            .orchestrator
            .take()
            .expect("orchestrator already started");
        tokio::spawn(async move { orchestrator.run().await })
    }

    pub async fn register(&self, workers: &[Worker]) {
        for worker in workers {
            self.handle
                .register_worker(worker.clone())
                .await
                .expect("Failed to register worker");
        }
    }

    pub async fn submit(&self, spec: TaskSpec) -> TaskId {
        self.handle
            .submit_task(spec)
            .await
            .expect("Failed to submit task")
    }

    /// Wait for the next assignment, failing the test after a (virtual) minute.
    pub async fn next_assignment(&mut self) -> Assignment {
        loop {
            let directive = tokio::time::timeout(Duration::from_secs(60), self.directives.recv())
                .await
                .expect("Timed out waiting for an assignment")
                .expect("Directive channel closed");
            if let WorkerDirective::Assign(assignment) = directive {
                return assignment;
            }
        }
    }

    pub async fn next_escalation(&mut self) -> Escalation {
        tokio::time::timeout(Duration::from_secs(60), self.escalations.recv())
            .await
            .expect("Timed out waiting for an escalation")
            .expect("Escalation channel closed")
    }

    /// Report the full scripted run of an assignment.
    pub fn work(&self, assignment: &Assignment, script: &Script) {
        for report in script_reports(assignment, script) {
            self.handle.report(report).expect("Failed to report");
        }
    }

    /// Report a passing Red, Green, Refactor run with the given evidence.
    pub fn complete(&self, assignment: &Assignment, evidence: Evidence) {
        if assignment.task.domain.is_coding() {
            for phase in [TddPhase::Red, TddPhase::Green, TddPhase::Refactor] {
                self.handle
                    .report(assignment.phase(phase))
                    .expect("Failed to report phase");
            }
        }
        self.handle
            .report(assignment.finished(Outcome::Success, evidence, 50))
            .expect("Failed to report completion");
    }

    pub fn entries_of(&self, event_type: AuditEventType) -> Vec<AuditEntry> {
        self.ledger
            .query(&AuditFilter::new().event_type(event_type))
            .expect("Failed to query ledger")
    }
}

pub fn rails_specialist() -> Worker {
    Worker::new("rails-specialist").with_capability("rails")
}

pub fn generic_backend() -> Worker {
    Worker::new("generic-backend").with_capability("backend")
}

pub fn rails_task(id: &str) -> TaskSpec {
    TaskSpec::new(id, Domain::Backend, "Users API").with_framework("rails")
}

pub fn docs_task(id: &str) -> TaskSpec {
    TaskSpec::new(id, Domain::Docs, "Write docs")
}

/// Evidence that clears every default gate.
pub fn passing_evidence() -> Evidence {
    Evidence::new()
        .with_tests(12, 0)
        .with_coverage(Fraction::percent(90))
        .with_scan(ScanReport::new("semgrep", 0, 1))
}

pub fn evidence_with_coverage(coverage: &str) -> Evidence {
    Evidence::new()
        .with_tests(12, 0)
        .with_coverage(coverage.parse().expect("Invalid coverage"))
        .with_scan(ScanReport::new("semgrep", 0, 0))
}
