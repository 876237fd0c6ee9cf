//! In-process scripted workers.
//!
//! Answers every assignment immediately according to the plan's scripts:
//! coding tasks walk Red, Green and Refactor before reporting, others
//! report straight away. Used by `conductor simulate` and the
//! integration tests.

use chrono::Utc;
use tokio::sync::mpsc;

use crate::core::evidence::{Evidence, ScanReport};
use crate::core::task::{PhaseStamp, TddPhase};
use crate::orchestration::orchestrator::{
    Assignment, OrchestratorHandle, WorkerDirective, WorkerReport,
};
use crate::orchestration::retry::Outcome;
use crate::plan::{Plan, Script};
use crate::{clog_debug, clog_warn};

/// Reports a scripted worker sends for one assignment, in order.
pub fn script_reports(assignment: &Assignment, script: &Script) -> Vec<WorkerReport> {
    let outcome = script.outcome_for(assignment.task.attempts);
    let mut reports = Vec::new();
    let mut evidence = Evidence::new();

    if outcome == Outcome::Success {
        if assignment.task.is_coding() {
            let phases: &[TddPhase] = if script.skip_red {
                &[TddPhase::Green, TddPhase::Refactor]
            } else {
                &[TddPhase::Red, TddPhase::Green, TddPhase::Refactor]
            };
            for phase in phases {
                reports.push(assignment.phase(*phase));
                evidence = evidence.with_phase(PhaseStamp::new(*phase, Utc::now()));
            }
        }
        evidence = evidence
            .with_tests(script.tests_passed, script.tests_failed)
            .with_coverage(script.coverage)
            .with_scan(ScanReport::new("scanner", script.critical_findings, 0));
    }

    reports.push(assignment.finished(outcome, evidence, script.latency_ms));
    reports
}

/// Serve directives until the orchestrator goes away.
pub async fn run_workers(
    mut directives: mpsc::UnboundedReceiver<WorkerDirective>,
    handle: OrchestratorHandle,
    plan: Plan,
) {
    while let Some(directive) = directives.recv().await {
        match directive {
            WorkerDirective::Assign(assignment) => {
                let script = plan.script(assignment.task_id());
                clog_debug!(
                    "{} working on {} (attempt {})",
                    assignment.worker,
                    assignment.task_id(),
                    assignment.task.attempts
                );
                for report in script_reports(&assignment, &script) {
                    if handle.report(report).is_err() {
                        clog_warn!("Orchestrator gone; {} stops", assignment.worker);
                        return;
                    }
                }
            }
            WorkerDirective::Cancel {
                task_id, worker, ..
            } => {
                clog_debug!("{} told to drop {}", worker, task_id);
            }
        }
    }
}
