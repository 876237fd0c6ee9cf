//! Orchestration layer.
//!
//! Routing, circuit breaking, retries, quality gates, the audit ledger and
//! the loop that drives them. The loop lives in `orchestrator`; everything
//! else is usable on its own and is exercised that way by the CLI.

pub mod circuit;
pub mod escalation;
pub mod gates;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;

pub use circuit::{CircuitBreaker, CircuitBreakerStats, CircuitTransition};
pub use escalation::{Escalation, EscalationSink, EscalationSubject, EscalationTrigger};
pub use gates::{GateProfile, GateResult, QualityGateEngine};
pub use ledger::{AuditDetail, AuditEntry, AuditEventType, AuditFilter, AuditLedger, NewEntry};
pub use orchestrator::{
    Assignment, OperatorCommand, Orchestrator, OrchestratorHandle, ReportBody, RunSummary,
    WorkerDirective, WorkerReport,
};
pub use registry::{Candidate, CandidateSearch, CapabilityRegistry, Rejection, RejectionReason};
pub use replay::{replay, ReplayState, SystemSnapshot};
pub use retry::{FailureKind, Outcome, RetryKind, RetryPolicy, RetryQueue, RetryTracker};
pub use router::{DelegationDecision, DelegationRouter, RouteReport, RoutingFailure};
