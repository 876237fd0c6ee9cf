//! Orchestration loop.
//!
//! The `Orchestrator` owns the loop: it pulls ready tasks, delegates them,
//! waits for worker reports, runs the quality gates and schedules retries.
//! Everything outside the loop talks to it through an `OrchestratorHandle`:
//! task ingestion, worker registration, worker reports and operator
//! commands.
//!
//! All state changes happen under the task graph write lock, and each one
//! is stamped with `AuditLedger::clock()` and appended in the same critical
//! section. The ledger order is therefore the order in which state changed,
//! which is what replay relies on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigHandle};
use crate::core::dag::{StatusCounts, TaskGraph};
use crate::core::evidence::Evidence;
use crate::core::lifecycle::TaskEvent;
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus, TddPhase};
use crate::core::worker::Worker;
use crate::error::{Error, Result};
use crate::orchestration::circuit::CircuitTransition;
use crate::orchestration::escalation::{Escalation, EscalationSink, EscalationSubject, EscalationTrigger};
use crate::orchestration::gates::QualityGateEngine;
use crate::orchestration::ledger::{AuditDetail, AuditLedger, NewEntry};
use crate::orchestration::registry::CapabilityRegistry;
use crate::orchestration::replay::SystemSnapshot;
use crate::orchestration::retry::{Outcome, RetryKind, RetryPolicy, RetryQueue};
use crate::orchestration::router::DelegationRouter;
use crate::{clog, clog_debug, clog_warn};

/// Actor recorded for entries written by the loop itself.
pub const ACTOR: &str = "orchestrator";
const OPERATOR: &str = "operator";
const PLANNER: &str = "planner";

/// Work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// The task as it stood when delegated.
    pub task: Task,
    pub worker: String,
    /// Sequence number of the `Delegated` ledger entry. Reports must echo it.
    pub assignment: u64,
    pub rationale: String,
}

impl Assignment {
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn phase(&self, phase: TddPhase) -> WorkerReport {
        WorkerReport {
            task_id: self.task.id.clone(),
            worker: self.worker.clone(),
            assignment: self.assignment,
            body: ReportBody::PhaseEntered { phase },
        }
    }

    pub fn finished(&self, outcome: Outcome, evidence: Evidence, latency_ms: u64) -> WorkerReport {
        WorkerReport {
            task_id: self.task.id.clone(),
            worker: self.worker.clone(),
            assignment: self.assignment,
            body: ReportBody::Finished {
                outcome,
                evidence,
                latency_ms,
            },
        }
    }
}

/// Messages from the loop to workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDirective {
    Assign(Assignment),
    /// The task was abandoned. Anything reported for this assignment is discarded.
    Cancel {
        task_id: TaskId,
        worker: String,
        assignment: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "report")]
pub enum ReportBody {
    /// The worker moved to the next TDD phase.
    PhaseEntered { phase: TddPhase },
    /// The worker is done with the assignment.
    Finished {
        outcome: Outcome,
        #[serde(default)]
        evidence: Evidence,
        latency_ms: u64,
    },
}

/// A worker's report about one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub worker: String,
    pub assignment: u64,
    pub body: ReportBody,
}

/// Operator commands, answered once the loop has applied them.
#[derive(Debug)]
pub enum OperatorCommand {
    Abandon {
        task: TaskId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Blocked task back to `NotStarted` for fresh routing.
    Requeue {
        task: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Blocked task back to `InProgress` and re-delegated.
    Resume {
        task: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Halt,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub counts: StatusCounts,
    pub halted: bool,
    pub last_seq: u64,
}

struct Shared {
    config: ConfigHandle,
    ledger: Arc<AuditLedger>,
    graph: RwLock<TaskGraph>,
    registry: CapabilityRegistry,
    /// Wakes an idle loop after ingestion.
    wake: Notify,
}

/// Cloneable access to a running (or not yet running) orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    shared: Arc<Shared>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    commands: mpsc::UnboundedSender<OperatorCommand>,
    halt: CancellationToken,
}

impl OrchestratorHandle {
    /// Task ingestion. Fails with `CycleDetected` or `DuplicateTask`
    /// without changing anything.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let mut graph = self.shared.graph.write().await;
        let at = self.shared.ledger.clock()?;
        let id = match graph.add_task(spec.clone(), at) {
            Ok(id) => id,
            Err(e) => {
                clog_warn!("Rejected task {}: {}", spec.id, e);
                return Err(e);
            }
        };
        self.shared.ledger.append(
            NewEntry::new(id.as_str(), PLANNER, AuditDetail::TaskSubmitted { spec }, at)
                .with_states("none", TaskStatus::NotStarted.name()),
        )?;
        drop(graph);
        clog_debug!("Submitted task {}", id);
        self.shared.wake.notify_one();
        Ok(id)
    }

    pub async fn register_worker(&self, worker: Worker) -> Result<()> {
        // Held so the registration is ordered with every other ledgered change
        let _graph = self.shared.graph.write().await;
        let at = self.shared.ledger.clock()?;
        let name = worker.name.clone();
        self.shared.registry.register(worker.clone())?;
        self.shared.ledger.append(NewEntry::new(
            name.as_str(),
            OPERATOR,
            AuditDetail::WorkerRegistered { worker },
            at,
        ))?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Worker result reporting.
    pub fn report(&self, report: WorkerReport) -> Result<()> {
        self.reports.send(report).map_err(|_| Error::Cancelled)
    }

    pub async fn abandon(&self, task: &TaskId, reason: &str) -> Result<()> {
        let task = task.clone();
        let reason = reason.to_string();
        self.command(|reply| OperatorCommand::Abandon { task, reason, reply })
            .await
    }

    pub async fn requeue(&self, task: &TaskId) -> Result<()> {
        let task = task.clone();
        self.command(|reply| OperatorCommand::Requeue { task, reply }).await
    }

    pub async fn resume(&self, task: &TaskId) -> Result<()> {
        let task = task.clone();
        self.command(|reply| OperatorCommand::Resume { task, reply }).await
    }

    /// Stop the loop after the event it is currently handling.
    pub fn halt(&self) {
        clog!("Halt requested");
        self.halt.cancel();
    }

    async fn command<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> OperatorCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub async fn snapshot(&self) -> Result<SystemSnapshot> {
        let graph = self.shared.graph.read().await;
        SystemSnapshot::capture(&graph, &self.shared.registry)
    }

    pub async fn status_counts(&self) -> StatusCounts {
        self.shared.graph.read().await.status_counts()
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        self.shared.graph.read().await.get(id).cloned()
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.shared.ledger
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.shared.config
    }
}

enum LoopEvent {
    Halt,
    Command(OperatorCommand),
    Report(WorkerReport),
    RetryDue,
    Woken,
}

/// The orchestration loop and the state only it touches.
pub struct Orchestrator {
    shared: Arc<Shared>,
    router: DelegationRouter,
    retries: RetryQueue,
    /// Current assignment (Delegated entry seq) per in-progress task.
    assignments: HashMap<TaskId, u64>,
    /// Failure descriptions per task, oldest first.
    history: HashMap<TaskId, Vec<String>>,
    escalations: EscalationSink,
    directives: mpsc::UnboundedSender<WorkerDirective>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    commands_tx: mpsc::UnboundedSender<OperatorCommand>,
    commands: mpsc::UnboundedReceiver<OperatorCommand>,
    halt: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator and the receiving end of its worker directives.
    pub fn new(
        config: ConfigHandle,
        ledger: Arc<AuditLedger>,
        escalations: EscalationSink,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerDirective>) {
        let (directives, directive_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let orchestrator = Self {
            shared: Arc::new(Shared {
                config,
                ledger,
                graph: RwLock::new(TaskGraph::new()),
                registry: CapabilityRegistry::new(),
                wake: Notify::new(),
            }),
            router: DelegationRouter::new(),
            retries: RetryQueue::new(),
            assignments: HashMap::new(),
            history: HashMap::new(),
            escalations,
            directives,
            reports_tx,
            reports,
            commands_tx,
            commands,
            halt: CancellationToken::new(),
        };
        (orchestrator, directive_rx)
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            shared: Arc::clone(&self.shared),
            reports: self.reports_tx.clone(),
            commands: self.commands_tx.clone(),
            halt: self.halt.clone(),
        }
    }

    /// Run until nothing is ready, in progress, blocked or waiting on a
    /// retry, or until halted.
    ///
    /// Routing and transition failures are ledgered and handled inside the
    /// loop; only ledger and lock failures end the run with an error.
    pub async fn run(&mut self) -> Result<RunSummary> {
        clog!("Orchestration loop started");
        let mut halted = false;

        loop {
            if self.halt.is_cancelled() {
                halted = true;
                break;
            }
            self.process_due_retries().await?;
            self.dispatch_ready().await?;
            if self.is_finished().await {
                break;
            }

            let next_retry = self.retries.next_due();
            let event = tokio::select! {
                biased;
                _ = self.halt.cancelled() => LoopEvent::Halt,
                Some(command) = self.commands.recv() => LoopEvent::Command(command),
                Some(report) = self.reports.recv() => LoopEvent::Report(report),
                _ = sleep_until(next_retry) => LoopEvent::RetryDue,
                _ = self.shared.wake.notified() => LoopEvent::Woken,
            };

            match event {
                LoopEvent::Halt => {
                    halted = true;
                    break;
                }
                LoopEvent::Command(command) => self.handle_command(command).await,
                LoopEvent::Report(report) => self.handle_report(report).await?,
                LoopEvent::RetryDue | LoopEvent::Woken => {}
            }
        }

        let counts = self.shared.graph.read().await.status_counts();
        let last_seq = self.shared.ledger.last_seq()?;
        if halted {
            clog!("Orchestration loop halted: {}", counts);
        } else {
            clog!("Orchestration loop finished: {}", counts);
        }
        Ok(RunSummary {
            counts,
            halted,
            last_seq,
        })
    }

    async fn is_finished(&self) -> bool {
        let graph = self.shared.graph.read().await;
        let counts = graph.status_counts();
        graph.ready_tasks().is_empty()
            && counts.in_progress == 0
            && counts.blocked == 0
            && self.retries.is_empty()
    }

    async fn dispatch_ready(&mut self) -> Result<()> {
        let config = self.shared.config.snapshot();
        let shared = Arc::clone(&self.shared);
        let mut graph = shared.graph.write().await;
        let ready: Vec<TaskId> = graph
            .ready_tasks()
            .into_iter()
            .filter(|id| !self.retries.contains(id))
            .collect();
        for id in ready {
            self.delegate(&mut graph, &config, &id, RetryKind::Reroute)?;
        }
        Ok(())
    }

    async fn process_due_retries(&mut self) -> Result<()> {
        let due = self.retries.pop_due(Instant::now());
        if due.is_empty() {
            return Ok(());
        }
        let config = self.shared.config.snapshot();
        let shared = Arc::clone(&self.shared);
        let mut graph = shared.graph.write().await;
        for (id, kind) in due {
            let eligible = match (graph.get(&id), kind) {
                (Some(task), RetryKind::Redelegate) => {
                    task.status == TaskStatus::InProgress && !self.assignments.contains_key(&id)
                }
                (Some(task), RetryKind::Reroute) => {
                    task.status == TaskStatus::NotStarted && graph.dependencies_met(&id)
                }
                (None, _) => false,
            };
            if !eligible {
                clog_debug!("Dropping stale retry for {}", id);
                continue;
            }
            self.delegate(&mut graph, &config, &id, kind)?;
        }
        Ok(())
    }

    /// Route a task and hand it out, or record the routing failure.
    fn delegate(
        &mut self,
        graph: &mut TaskGraph,
        config: &Config,
        id: &TaskId,
        kind: RetryKind,
    ) -> Result<()> {
        let task = graph
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let ledger = Arc::clone(&self.shared.ledger);
        let at = ledger.clock()?;
        let load = graph.load_by_worker();
        let report = self
            .router
            .route(&task, &self.shared.registry, config, &load, at)?;
        for transition in &report.circuit_transitions {
            self.record_circuit(transition, config)?;
        }

        match report.decision {
            Ok(decision) => {
                let worker = decision.chosen_worker.clone();
                let rationale = decision.rationale.clone();
                let seq = ledger.append(NewEntry::new(
                    id.as_str(),
                    ACTOR,
                    AuditDetail::Delegated { decision },
                    at,
                ))?;
                let event = match kind {
                    RetryKind::Reroute => TaskEvent::Start {
                        worker: worker.clone(),
                    },
                    RetryKind::Redelegate => TaskEvent::Reassign {
                        worker: worker.clone(),
                    },
                };
                let task = match apply_event(&ledger, graph, id, event, ACTOR) {
                    Ok(task) => task,
                    Err(e) if is_rejection(&e) => return Ok(()),
                    Err(e) => return Err(e),
                };
                self.assignments.insert(id.clone(), seq);
                self.send(WorkerDirective::Assign(Assignment {
                    task,
                    worker,
                    assignment: seq,
                    rationale,
                }));
            }
            Err(failure) => {
                ledger.append(NewEntry::new(
                    id.as_str(),
                    ACTOR,
                    AuditDetail::RoutingFailed {
                        failure: failure.clone(),
                    },
                    at,
                ))?;
                if failure.escalate {
                    let reason = format!("no eligible worker after {} attempts", failure.attempts);
                    self.record_failure(id, &reason);
                    self.block(graph, id, &reason)?;
                    let escalation = Escalation::new(
                        EscalationSubject::Task(id.clone()),
                        EscalationTrigger::NoEligibleWorker {
                            attempts: failure.attempts,
                        },
                        failure.trail(),
                        at,
                    )
                    .with_rejections(failure.rejected)
                    .with_history(self.history_of(id));
                    self.escalate(escalation)?;
                } else {
                    let delay = RetryPolicy::from(&config.retry).delay_for(failure.attempts);
                    clog_debug!("Re-routing {} in {:?}", id, delay);
                    self.retries.schedule(id.clone(), kind, Instant::now() + delay);
                }
            }
        }
        Ok(())
    }

    async fn handle_report(&mut self, report: WorkerReport) -> Result<()> {
        let config = self.shared.config.snapshot();
        let shared = Arc::clone(&self.shared);
        let mut graph = shared.graph.write().await;

        if !self.is_current(&graph, &report) {
            clog_warn!(
                "Discarding report from {} for {} (assignment {} is not current)",
                report.worker,
                report.task_id,
                report.assignment
            );
            return Ok(());
        }

        match report.body {
            ReportBody::PhaseEntered { phase } => {
                let ledger = Arc::clone(&self.shared.ledger);
                match apply_event(
                    &ledger,
                    &mut graph,
                    &report.task_id,
                    TaskEvent::EnterPhase { phase },
                    &report.worker,
                ) {
                    Ok(_) => Ok(()),
                    Err(e) if is_rejection(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ReportBody::Finished {
                outcome,
                evidence,
                latency_ms,
            } => self.finish(
                &mut graph,
                &config,
                &report.task_id,
                &report.worker,
                report.assignment,
                outcome,
                evidence,
                latency_ms,
            ),
        }
    }

    /// Reports count only for the task's live assignment.
    fn is_current(&self, graph: &TaskGraph, report: &WorkerReport) -> bool {
        if self.assignments.get(&report.task_id) != Some(&report.assignment) {
            return false;
        }
        graph.get(&report.task_id).is_some_and(|task| {
            task.status == TaskStatus::InProgress
                && task.assigned_worker.as_deref() == Some(report.worker.as_str())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        graph: &mut TaskGraph,
        config: &Config,
        id: &TaskId,
        worker: &str,
        assignment: u64,
        outcome: Outcome,
        evidence: Evidence,
        latency_ms: u64,
    ) -> Result<()> {
        let ledger = Arc::clone(&self.shared.ledger);
        let at = ledger.clock()?;
        ledger.append(NewEntry::new(
            worker,
            worker,
            AuditDetail::OutcomeReported {
                worker: worker.to_string(),
                assignment,
                outcome: outcome.clone(),
                latency_ms,
            },
            at,
        ))?;
        clog!("{} reported {} for {} in {}ms", worker, outcome, id, latency_ms);
        let transitions =
            self.shared
                .registry
                .record_outcome(worker, &outcome, latency_ms, &config.circuit, at)?;
        for transition in &transitions {
            self.record_circuit(transition, config)?;
        }

        match &outcome {
            Outcome::Success => self.evaluate(graph, config, id, worker, evidence),
            failure if failure.is_retryable() => {
                self.retry_or_block(graph, config, id, &format!("{} on {}", failure, worker))
            }
            failure => {
                let reason = format!("{} on {}", failure, worker);
                self.record_failure(id, &reason);
                self.assignments.remove(id);
                let kind = failure.failure_kind();
                let block_reason = match kind {
                    Some(kind) => format!("persistent failure: {}", kind),
                    None => "persistent failure".to_string(),
                };
                self.block(graph, id, &block_reason)?;
                if let Some(kind) = kind {
                    let escalation = Escalation::new(
                        EscalationSubject::Task(id.clone()),
                        EscalationTrigger::PersistentFailure { kind },
                        reason,
                        at,
                    )
                    .with_history(self.history_of(id));
                    self.escalate(escalation)?;
                }
                Ok(())
            }
        }
    }

    fn evaluate(
        &mut self,
        graph: &mut TaskGraph,
        config: &Config,
        id: &TaskId,
        worker: &str,
        mut evidence: Evidence,
    ) -> Result<()> {
        let task = graph
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if evidence.phase_log.is_empty() {
            evidence.phase_log = task.phase_log.clone();
        }
        let result = QualityGateEngine::new(&config.gates).evaluate(&task, &evidence);
        let ledger = Arc::clone(&self.shared.ledger);
        let at = ledger.clock()?;
        ledger.append(NewEntry::new(
            id.as_str(),
            ACTOR,
            AuditDetail::GateEvaluated {
                worker: worker.to_string(),
                result: result.clone(),
            },
            at,
        ))?;
        clog!("Gates for {}: {}", id, result.summary());

        if !result.passed {
            return self.retry_or_block(graph, config, id, &format!("quality gates {}", result.summary()));
        }
        match apply_event(
            &ledger,
            graph,
            id,
            TaskEvent::Complete {
                checks: result.checks,
            },
            ACTOR,
        ) {
            Ok(_) => {
                self.assignments.remove(id);
                self.history.remove(id);
                self.router.reset(id);
                Ok(())
            }
            Err(e) if is_rejection(&e) => self.retry_or_block(graph, config, id, &e.to_string()),
            Err(e) => Err(e),
        }
    }

    /// Revert and back off if attempts remain, otherwise block and escalate.
    fn retry_or_block(
        &mut self,
        graph: &mut TaskGraph,
        config: &Config,
        id: &TaskId,
        reason: &str,
    ) -> Result<()> {
        self.record_failure(id, reason);
        self.assignments.remove(id);
        let attempts = graph.get(id).map(|t| t.attempts).unwrap_or(0);
        let policy = RetryPolicy::from(&config.retry);
        let ledger = Arc::clone(&self.shared.ledger);

        if policy.allows_another(attempts) {
            match apply_event(
                &ledger,
                graph,
                id,
                TaskEvent::Revert {
                    reason: reason.to_string(),
                },
                ACTOR,
            ) {
                Ok(_) => {}
                Err(e) if is_rejection(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
            let delay = policy.delay_for(attempts);
            clog!(
                "Retrying {} in {:?} (attempt {}/{}): {}",
                id,
                delay,
                attempts + 1,
                policy.max_attempts,
                reason
            );
            self.retries
                .schedule(id.clone(), RetryKind::Redelegate, Instant::now() + delay);
            return Ok(());
        }

        let at = ledger.clock()?;
        self.block(graph, id, &format!("retries exhausted after {} attempts", attempts))?;
        let escalation = Escalation::new(
            EscalationSubject::Task(id.clone()),
            EscalationTrigger::RetriesExhausted { attempts },
            reason,
            at,
        )
        .with_history(self.history_of(id));
        self.escalate(escalation)
    }

    fn block(&mut self, graph: &mut TaskGraph, id: &TaskId, reason: &str) -> Result<()> {
        self.retries.cancel(id);
        self.assignments.remove(id);
        let ledger = Arc::clone(&self.shared.ledger);
        match apply_event(
            &ledger,
            graph,
            id,
            TaskEvent::Block {
                reason: reason.to_string(),
            },
            ACTOR,
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_rejection(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn record_circuit(&mut self, transition: &CircuitTransition, config: &Config) -> Result<()> {
        self.shared.ledger.append(
            NewEntry::new(
                transition.worker.as_str(),
                ACTOR,
                AuditDetail::CircuitStateChanged {
                    from: transition.from,
                    to: transition.to,
                },
                transition.at,
            )
            .with_states(transition.from.to_string(), transition.to.to_string()),
        )?;
        clog!(
            "Circuit for {}: {} -> {}",
            transition.worker,
            transition.from,
            transition.to
        );

        if transition.opened()
            && transition.opens_without_close >= config.circuit.repeat_open_escalation
        {
            let escalation = Escalation::new(
                EscalationSubject::Worker(transition.worker.clone()),
                EscalationTrigger::CircuitRepeatedlyOpened {
                    opens: transition.opens_without_close,
                },
                format!(
                    "{} opened {} times without closing",
                    transition.worker, transition.opens_without_close
                ),
                transition.at,
            );
            self.escalate(escalation)?;
        }
        Ok(())
    }

    fn escalate(&mut self, escalation: Escalation) -> Result<()> {
        clog_warn!("Escalating {}", escalation);
        self.shared.ledger.append(NewEntry::new(
            escalation.subject.entity_id(),
            ACTOR,
            AuditDetail::Escalated {
                escalation: escalation.clone(),
            },
            escalation.raised_at,
        ))?;
        self.escalations.emit(escalation);
        Ok(())
    }

    async fn handle_command(&mut self, command: OperatorCommand) {
        match command {
            OperatorCommand::Abandon { task, reason, reply } => {
                let result = self.abandon(&task, &reason).await;
                let _ = reply.send(result);
            }
            OperatorCommand::Requeue { task, reply } => {
                let result = self.operator_event(&task, TaskEvent::Requeue).await;
                if result.is_ok() {
                    self.retries.cancel(&task);
                    self.router.reset(&task);
                }
                let _ = reply.send(result);
            }
            OperatorCommand::Resume { task, reply } => {
                let result = self.operator_event(&task, TaskEvent::Resume).await;
                if result.is_ok() {
                    self.retries
                        .schedule(task.clone(), RetryKind::Redelegate, Instant::now());
                }
                let _ = reply.send(result);
            }
            OperatorCommand::Halt => self.halt.cancel(),
        }
    }

    async fn abandon(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let worker = {
            let graph = self.shared.graph.read().await;
            graph.get(id).and_then(|t| t.assigned_worker.clone())
        };
        self.operator_event(
            id,
            TaskEvent::Abandon {
                reason: reason.to_string(),
            },
        )
        .await?;
        self.retries.cancel(id);
        self.router.reset(id);
        if let (Some(assignment), Some(worker)) = (self.assignments.remove(id), worker) {
            self.send(WorkerDirective::Cancel {
                task_id: id.clone(),
                worker,
                assignment,
            });
        }
        clog!("Abandoned {}: {}", id, reason);
        Ok(())
    }

    async fn operator_event(&mut self, id: &TaskId, event: TaskEvent) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut graph = shared.graph.write().await;
        apply_event(&shared.ledger, &mut graph, id, event, OPERATOR).map(|_| ())
    }

    fn send(&self, directive: WorkerDirective) {
        if let Err(e) = self.directives.send(directive) {
            clog_warn!("No worker listening for directive: {:?}", e.0);
        }
    }

    fn record_failure(&mut self, id: &TaskId, reason: &str) {
        self.history
            .entry(id.clone())
            .or_default()
            .push(reason.to_string());
    }

    fn history_of(&self, id: &TaskId) -> Vec<String> {
        self.history.get(id).cloned().unwrap_or_default()
    }
}

/// Apply an event and ledger it; a rejected event is ledgered as such.
fn apply_event(
    ledger: &AuditLedger,
    graph: &mut TaskGraph,
    id: &TaskId,
    event: TaskEvent,
    actor: &str,
) -> Result<Task> {
    let at = ledger.clock()?;
    let Some(before) = graph.get(id).map(|t| t.stage()) else {
        let e = Error::TaskNotFound(id.clone());
        clog_warn!("{}", e);
        ledger.append(NewEntry::new(
            id.as_str(),
            actor,
            AuditDetail::TransitionRejected {
                event,
                reason: e.to_string(),
            },
            at,
        ))?;
        return Err(e);
    };
    match graph.transition(id, &event, at) {
        Ok(task) => {
            let after = task.stage();
            clog_debug!("{} {}: {} -> {}", id, event, before, after);
            ledger.append(
                NewEntry::new(id.as_str(), actor, AuditDetail::StatusChanged { event }, at)
                    .with_states(before, after),
            )?;
            Ok(task)
        }
        Err(e) => {
            clog_warn!("{}", e);
            ledger.append(
                NewEntry::new(
                    id.as_str(),
                    actor,
                    AuditDetail::TransitionRejected {
                        event,
                        reason: e.to_string(),
                    },
                    at,
                )
                .with_before(before),
            )?;
            Err(e)
        }
    }
}

/// Errors that reject one step but leave the loop healthy.
fn is_rejection(error: &Error) -> bool {
    matches!(error, Error::InvalidTransition { .. } | Error::TaskNotFound(_))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
