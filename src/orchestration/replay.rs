//! Event-sourced reconstruction from the audit ledger.
//!
//! Replaying the same entries from an empty state always yields the same
//! task graph and registry snapshot. Only entries that change state are
//! applied; decisions, gate evaluations and escalations are informational.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::Config;
use crate::core::dag::TaskGraph;
use crate::core::lifecycle::TaskEvent;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::core::worker::{CircuitState, WorkerSnapshot};
use crate::error::{Error, Result};
use crate::orchestration::ledger::{validate_sequence, AuditDetail, AuditEntry};
use crate::orchestration::registry::CapabilityRegistry;
use crate::clog_debug;

/// Comparable view of the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Tasks in submission order.
    pub tasks: Vec<Task>,
    /// Workers sorted by name.
    pub workers: Vec<WorkerSnapshot>,
}

impl SystemSnapshot {
    pub fn capture(graph: &TaskGraph, registry: &CapabilityRegistry) -> Result<Self> {
        Ok(Self {
            tasks: graph.snapshot(),
            workers: registry.snapshots()?,
        })
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

/// State rebuilt from a ledger.
#[derive(Debug)]
pub struct ReplayState {
    pub graph: TaskGraph,
    pub registry: CapabilityRegistry,
    /// Sequence number of the last applied entry.
    pub last_seq: u64,
    /// Circuit transitions already made by the last outcome entry, still
    /// to be matched against the circuit entries that follow it.
    applied_circuit: VecDeque<(String, CircuitState, CircuitState)>,
}

impl ReplayState {
    pub fn snapshot(&self) -> Result<SystemSnapshot> {
        SystemSnapshot::capture(&self.graph, &self.registry)
    }
}

/// Rebuild the task graph and registry from ledger entries.
///
/// `config` must be the configuration the entries were recorded under;
/// circuit timing depends on it.
///
/// # Errors
/// - `LedgerGap` if sequence numbers are not 1, 2, 3, ...
/// - `ReplayMismatch` if an entry cannot be applied, or a task completed
///   without passing evidence for every gate its domain requires
pub fn replay(entries: &[AuditEntry], config: &Config) -> Result<ReplayState> {
    validate_sequence(entries)?;
    let mut state = ReplayState {
        graph: TaskGraph::new(),
        registry: CapabilityRegistry::new(),
        last_seq: 0,
        applied_circuit: VecDeque::new(),
    };

    for entry in entries {
        apply(&mut state, entry, config).map_err(|e| match e {
            Error::ReplayMismatch { .. } => e,
            other => Error::ReplayMismatch {
                seq: entry.seq,
                detail: other.to_string(),
            },
        })?;
        state.last_seq = entry.seq;
    }

    clog_debug!(
        "Replayed {} entries: {}",
        entries.len(),
        state.graph.status_counts()
    );
    Ok(state)
}

fn apply(state: &mut ReplayState, entry: &AuditEntry, config: &Config) -> Result<()> {
    let at = entry.recorded_at;
    match &entry.detail {
        AuditDetail::TaskSubmitted { spec } => {
            state.graph.add_task(spec.clone(), at)?;
        }
        AuditDetail::WorkerRegistered { worker } => {
            state.registry.register(worker.clone())?;
        }
        AuditDetail::StatusChanged { event } => {
            let id = TaskId::from(entry.entity_id.as_str());
            let task = state.graph.transition(&id, event, at)?;
            if matches!(event, TaskEvent::Complete { .. }) {
                verify_completion(&task, config, entry.seq)?;
            }
        }
        AuditDetail::OutcomeReported {
            worker,
            outcome,
            latency_ms,
            ..
        } => {
            state.applied_circuit = state
                .registry
                .record_outcome(worker, outcome, *latency_ms, &config.circuit, at)?
                .into_iter()
                .map(|t| (t.worker, t.from, t.to))
                .collect();
        }
        AuditDetail::CircuitStateChanged { from, to } => {
            // Outcome entries already drive their own transitions; only
            // routing-time expiries are applied here.
            let key = (entry.entity_id.clone(), *from, *to);
            if state.applied_circuit.front() == Some(&key) {
                state.applied_circuit.pop_front();
            } else {
                let current = state.registry.snapshot(&entry.entity_id)?.circuit_state;
                if current != *to {
                    state.registry.force_circuit(&entry.entity_id, *to, at)?;
                }
            }
        }
        AuditDetail::Delegated { .. }
        | AuditDetail::GateEvaluated { .. }
        | AuditDetail::Escalated { .. }
        | AuditDetail::TransitionRejected { .. }
        | AuditDetail::RoutingFailed { .. } => {}
    }
    Ok(())
}

/// A completed task must carry a passing check for every gate its domain requires.
fn verify_completion(task: &Task, config: &Config, seq: u64) -> Result<()> {
    debug_assert_eq!(task.status, TaskStatus::Completed);
    let profile = config.gates.profile(task.domain);
    for gate in profile.gate_names(task) {
        match task.quality_evidence.get(gate) {
            Some(check) if check.passed => {}
            Some(_) => {
                return Err(Error::ReplayMismatch {
                    seq,
                    detail: format!("task {} completed with failing gate {}", task.id, gate),
                })
            }
            None => {
                return Err(Error::ReplayMismatch {
                    seq,
                    detail: format!("task {} completed without evaluating gate {}", task.id, gate),
                })
            }
        }
    }
    Ok(())
}
