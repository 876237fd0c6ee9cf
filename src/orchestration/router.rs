//! Delegation router.
//!
//! Picks the best worker for a ready task by walking the routing tiers
//! in priority order and taking the first candidate whose circuit is not
//! open. Every worker considered and skipped is recorded on the decision
//! so the audit trail can explain the choice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{Config, RoutingTier};
use crate::core::task::{Task, TaskId};
use crate::core::worker::CircuitState;
use crate::error::{Error, Result};
use crate::orchestration::circuit::CircuitTransition;
use crate::orchestration::registry::{Candidate, CapabilityRegistry, Rejection, RejectionReason};
use crate::orchestration::retry::RetryTracker;
use crate::{clog, clog_debug, clog_warn};

/// Immutable record of a routing choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationDecision {
    pub task_id: TaskId,
    pub chosen_worker: String,
    pub tier: RoutingTier,
    /// Capability tag that qualified the chosen worker.
    pub matched: String,
    /// Every capable worker in priority order.
    pub candidates: Vec<Candidate>,
    /// Workers skipped, circuit rejections first, in the order considered.
    pub rejected: Vec<Rejection>,
    pub decided_at: DateTime<Utc>,
    pub rationale: String,
}

impl DelegationDecision {
    /// Whether a tier below the top configured tier was used.
    pub fn is_fallback(&self, config: &Config) -> bool {
        config.routing.tiers.first() != Some(&self.tier)
    }
}

/// Why routing produced no decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFailure {
    pub task_id: TaskId,
    /// Consecutive failed routing attempts for this task, including this one.
    pub attempts: u32,
    pub rejected: Vec<Rejection>,
    /// The attempt count reached the escalation threshold.
    pub escalate: bool,
}

impl RoutingFailure {
    pub fn to_error(&self) -> Error {
        Error::NoEligibleWorker {
            task: self.task_id.clone(),
            attempts: self.attempts,
            rejected: self.rejected.len(),
        }
    }

    /// Rejection trail as one line.
    pub fn trail(&self) -> String {
        if self.rejected.is_empty() {
            return "no workers registered".to_string();
        }
        self.rejected
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything one routing attempt produced.
#[derive(Debug)]
pub struct RouteReport {
    pub decision: std::result::Result<DelegationDecision, RoutingFailure>,
    /// Circuits that moved to half-open while being checked.
    pub circuit_transitions: Vec<CircuitTransition>,
}

/// Routes tasks and counts consecutive routing failures per task.
#[derive(Debug, Default)]
pub struct DelegationRouter {
    failures: RetryTracker,
}

impl DelegationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive routing failures recorded for a task.
    pub fn failures(&self, task: &TaskId) -> u32 {
        self.failures.get_retries(task)
    }

    /// Forget a task's failure count (requeue, abandon).
    pub fn reset(&mut self, task: &TaskId) {
        self.failures.reset(task);
    }

    /// Choose a worker for `task`.
    ///
    /// # Errors
    /// `NoEligibleWorker` when every tier is exhausted. Use `route` to get
    /// the full rejection trail and circuit transitions.
    pub fn delegate(
        &mut self,
        task: &Task,
        registry: &CapabilityRegistry,
        config: &Config,
        load: &HashMap<String, usize>,
        now: DateTime<Utc>,
    ) -> Result<DelegationDecision> {
        let report = self.route(task, registry, config, load, now)?;
        report.decision.map_err(|failure| failure.to_error())
    }

    /// One routing attempt with everything needed for the audit trail.
    pub fn route(
        &mut self,
        task: &Task,
        registry: &CapabilityRegistry,
        config: &Config,
        load: &HashMap<String, usize>,
        now: DateTime<Utc>,
    ) -> Result<RouteReport> {
        let search = registry.find_candidates(task, &config.routing, load)?;
        let mut transitions = Vec::new();
        let mut circuit_rejections = Vec::new();
        let mut chosen: Option<&Candidate> = None;

        'tiers: for tier in &config.routing.tiers {
            for candidate in search.tier(*tier) {
                let (state, transition) =
                    registry.circuit_state_at(&candidate.worker, &config.circuit, now)?;
                transitions.extend(transition);
                if state == CircuitState::Open {
                    clog_debug!(
                        "route task={} skipping {} (circuit open)",
                        task.id,
                        candidate.worker
                    );
                    circuit_rejections.push(Rejection {
                        worker: candidate.worker.clone(),
                        tier: Some(candidate.tier),
                        reason: RejectionReason::CircuitOpen,
                    });
                    continue;
                }
                chosen = Some(candidate);
                break 'tiers;
            }
        }

        let mut rejected = circuit_rejections.clone();
        rejected.extend(search.rejected.iter().cloned());

        let decision = match chosen {
            Some(candidate) => {
                self.failures.reset(&task.id);
                let rationale = rationale(candidate, &circuit_rejections, config);
                clog!(
                    "Delegating {} to {} ({})",
                    task.id,
                    candidate.worker,
                    rationale
                );
                Ok(DelegationDecision {
                    task_id: task.id.clone(),
                    chosen_worker: candidate.worker.clone(),
                    tier: candidate.tier,
                    matched: candidate.matched.clone(),
                    candidates: search.candidates.clone(),
                    rejected,
                    decided_at: now,
                    rationale,
                })
            }
            None => {
                let attempts = self.failures.increment(&task.id);
                let escalate = attempts >= config.routing.escalate_after;
                let failure = RoutingFailure {
                    task_id: task.id.clone(),
                    attempts,
                    rejected,
                    escalate,
                };
                clog_warn!(
                    "No eligible worker for {} (attempt {}/{}): {}",
                    task.id,
                    attempts,
                    config.routing.escalate_after,
                    failure.trail()
                );
                Err(failure)
            }
        };

        Ok(RouteReport {
            decision,
            circuit_transitions: transitions,
        })
    }
}

fn rationale(candidate: &Candidate, circuit_rejections: &[Rejection], config: &Config) -> String {
    let mut text = if config.routing.tiers.first() == Some(&candidate.tier) {
        format!("{} match on '{}'", candidate.tier, candidate.matched)
    } else {
        format!(
            "fallback to {} tier on '{}'",
            candidate.tier, candidate.matched
        )
    };
    for rejection in circuit_rejections {
        text.push_str("; ");
        text.push_str(&rejection.to_string());
    }
    text
}
