//! Task lifecycle events and the transition table.
//!
//! ```text
//! NotStarted -> InProgress -> [Red -> Green -> Refactor] -> Completed
//! InProgress <-> Blocked, NotStarted -> Blocked -> NotStarted
//! any non-terminal -> Abandoned
//! ```
//!
//! Non-coding tasks skip the bracketed TDD sub-chain. A transition that is
//! not in the table fails with `Error::InvalidTransition` and leaves the
//! task untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::evidence::GateCheck;
use crate::core::task::{PhaseStamp, Task, TaskStatus, TddPhase};
use crate::error::{Error, Result};

/// An event applied to a task through the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TaskEvent {
    /// Hand a ready task to a worker.
    Start { worker: String },
    /// Hand an in-progress task to a (possibly different) worker for a retry.
    Reassign { worker: String },
    /// The worker entered the next TDD phase.
    EnterPhase { phase: TddPhase },
    /// Every gate passed; `checks` becomes the task's quality evidence.
    Complete { checks: BTreeMap<String, GateCheck> },
    /// Back to plain InProgress after a gate or worker failure.
    Revert { reason: String },
    Block { reason: String },
    /// Blocked -> InProgress with the same worker.
    Resume,
    /// Blocked -> NotStarted for fresh routing.
    Requeue,
    Abandon { reason: String },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Start { .. } => "start",
            TaskEvent::Reassign { .. } => "reassign",
            TaskEvent::EnterPhase { .. } => "enter_phase",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Revert { .. } => "revert",
            TaskEvent::Block { .. } => "block",
            TaskEvent::Resume => "resume",
            TaskEvent::Requeue => "requeue",
            TaskEvent::Abandon { .. } => "abandon",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::EnterPhase { phase } => write!(f, "enter_phase({})", phase),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Check an event against the transition table without mutating anything.
///
/// `deps_met` is whether every dependency of the task is `Completed`.
/// Returns the rejection reason when the event is not allowed.
pub fn check(task: &Task, event: &TaskEvent, deps_met: bool) -> std::result::Result<(), String> {
    if task.is_terminal() {
        return Err(format!("task is terminal ({})", task.status.name()));
    }

    let in_progress = matches!(task.status, TaskStatus::InProgress);

    match event {
        TaskEvent::Start { .. } => {
            if task.status != TaskStatus::NotStarted {
                return Err("only not_started tasks can start".to_string());
            }
            if !deps_met {
                return Err("dependencies are not completed".to_string());
            }
        }
        TaskEvent::Reassign { .. } => {
            if !in_progress {
                return Err("only in_progress tasks can be reassigned".to_string());
            }
        }
        TaskEvent::EnterPhase { phase } => {
            if !in_progress {
                return Err("phases are only entered while in_progress".to_string());
            }
            if !task.is_coding() {
                return Err(format!("{} tasks have no TDD phases", task.domain));
            }
            if task.tdd_phase != phase.predecessor() {
                return Err(format!(
                    "{} must follow {}",
                    phase,
                    phase
                        .predecessor()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "plain in_progress".to_string())
                ));
            }
        }
        TaskEvent::Complete { checks } => {
            if !in_progress {
                return Err("only in_progress tasks can complete".to_string());
            }
            if !deps_met {
                return Err("dependencies are not completed".to_string());
            }
            if task.is_coding() && task.tdd_phase != Some(TddPhase::Refactor) {
                return Err("coding tasks complete from refactor".to_string());
            }
            if !task.is_coding() && task.tdd_phase.is_some() {
                return Err("non-coding task carries a TDD phase".to_string());
            }
            if let Some((gate, _)) = checks.iter().find(|(_, c)| !c.passed) {
                return Err(format!("quality gate {} did not pass", gate));
            }
        }
        TaskEvent::Revert { .. } => {
            if !in_progress {
                return Err("only in_progress tasks can revert".to_string());
            }
        }
        TaskEvent::Block { .. } => {
            if !in_progress && task.status != TaskStatus::NotStarted {
                return Err("only not_started or in_progress tasks can block".to_string());
            }
        }
        TaskEvent::Resume => {
            if !matches!(task.status, TaskStatus::Blocked { .. }) {
                return Err("only blocked tasks can resume".to_string());
            }
            if task.assigned_worker.is_none() {
                return Err("no worker to resume with; requeue instead".to_string());
            }
            if !deps_met {
                return Err("dependencies are not completed".to_string());
            }
        }
        TaskEvent::Requeue => {
            if !matches!(task.status, TaskStatus::Blocked { .. }) {
                return Err("only blocked tasks can be requeued".to_string());
            }
        }
        TaskEvent::Abandon { .. } => {}
    }

    Ok(())
}

/// Validate and apply an event to a task.
pub fn apply(task: &mut Task, event: &TaskEvent, deps_met: bool, at: DateTime<Utc>) -> Result<()> {
    check(task, event, deps_met).map_err(|reason| Error::InvalidTransition {
        task: task.id.clone(),
        from: task.stage(),
        event: event.to_string(),
        reason,
    })?;

    match event {
        TaskEvent::Start { worker } => {
            task.status = TaskStatus::InProgress;
            task.assigned_worker = Some(worker.clone());
            task.attempts += 1;
            task.started_at.get_or_insert(at);
            reset_cycle(task);
        }
        TaskEvent::Reassign { worker } => {
            task.assigned_worker = Some(worker.clone());
            task.attempts += 1;
            reset_cycle(task);
        }
        TaskEvent::EnterPhase { phase } => {
            task.tdd_phase = Some(*phase);
            task.phase_log.push(PhaseStamp::new(*phase, at));
        }
        TaskEvent::Complete { checks } => {
            task.status = TaskStatus::Completed;
            task.quality_evidence = checks.clone();
            task.completed_at = Some(at);
        }
        TaskEvent::Revert { .. } => reset_cycle(task),
        TaskEvent::Block { reason } => {
            task.status = TaskStatus::Blocked {
                reason: reason.clone(),
            };
        }
        TaskEvent::Resume => task.status = TaskStatus::InProgress,
        TaskEvent::Requeue => {
            task.status = TaskStatus::NotStarted;
            task.assigned_worker = None;
            reset_cycle(task);
        }
        TaskEvent::Abandon { reason } => {
            task.status = TaskStatus::Abandoned {
                reason: reason.clone(),
            };
            task.completed_at = Some(at);
        }
    }

    Ok(())
}

fn reset_cycle(task: &mut Task) {
    task.tdd_phase = None;
    task.phase_log.clear();
}
