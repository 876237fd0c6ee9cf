//! Task data model for the task graph.
//!
//! Tasks are the atomic units of work delegated to workers. Each task
//! tracks its lifecycle status, TDD sub-phase, assignment, and the gate
//! results that allowed it to complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::core::evidence::GateCheck;

/// Unique identifier for a task.
///
/// Identifiers are normally assigned by the planning collaborator so that
/// dependencies can be declared before the referenced task is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier of the form `task-1a2b3c4d`.
    pub fn generate() -> Self {
        Self(format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The engineering domain a task belongs to.
///
/// The domain selects the quality gate profile and the domain-generic
/// routing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Backend,
    Frontend,
    Infra,
    Testing,
    Docs,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Backend,
        Domain::Frontend,
        Domain::Infra,
        Domain::Testing,
        Domain::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Backend => "backend",
            Domain::Frontend => "frontend",
            Domain::Infra => "infra",
            Domain::Testing => "testing",
            Domain::Docs => "docs",
        }
    }

    /// Whether tasks in this domain run the Red/Green/Refactor cycle.
    pub fn is_coding(&self) -> bool {
        matches!(self, Domain::Backend | Domain::Frontend | Domain::Testing)
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// Sub-phase of a coding task's test-first cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddPhase {
    /// A failing test has been written.
    Red,
    /// The minimal implementation makes the test pass.
    Green,
    /// Cleanup with tests still green.
    Refactor,
}

impl TddPhase {
    /// The phase that must directly precede this one, if any.
    pub fn predecessor(&self) -> Option<TddPhase> {
        match self {
            TddPhase::Red => None,
            TddPhase::Green => Some(TddPhase::Red),
            TddPhase::Refactor => Some(TddPhase::Green),
        }
    }
}

impl std::fmt::Display for TddPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TddPhase::Red => write!(f, "red"),
            TddPhase::Green => write!(f, "green"),
            TddPhase::Refactor => write!(f, "refactor"),
        }
    }
}

/// Entry in a task's phase log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStamp {
    pub phase: TddPhase,
    pub entered_at: DateTime<Utc>,
}

impl PhaseStamp {
    pub fn new(phase: TddPhase, entered_at: DateTime<Utc>) -> Self {
        Self { phase, entered_at }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Submitted, waiting for dependencies or routing.
    #[default]
    NotStarted,
    /// Assigned to a worker. Coding tasks additionally carry a TDD phase.
    InProgress,
    /// Stalled on something outside the engine; needs an operator.
    Blocked {
        /// Why the task is blocked.
        reason: String,
    },
    /// Finished with every applicable gate passing.
    Completed,
    /// Cancelled by an operator. Terminal.
    Abandoned {
        /// Operator-supplied reason.
        reason: String,
    },
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned { .. } => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Abandoned { reason } => write!(f, "abandoned: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A task specification as submitted by the planning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Generated when a plan leaves it out; such tasks cannot be depended on.
    #[serde(default = "TaskId::generate")]
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    pub domain: Domain,
    /// Optional framework tag such as "rails" or "react".
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub estimated_minutes: u32,
    /// Tasks that must be completed first. May name tasks not yet submitted.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Tool permissions the assigned worker must hold.
    #[serde(default)]
    pub required_tools: BTreeSet<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, domain: Domain, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            domain,
            framework: None,
            complexity: Complexity::default(),
            estimated_minutes: 0,
            dependencies: BTreeSet::new(),
            required_tools: BTreeSet::new(),
        }
    }

    pub fn with_framework(mut self, framework: &str) -> Self {
        self.framework = Some(framework.to_string());
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.required_tools.insert(tool.to_string());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }
}

/// A task held by the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub domain: Domain,
    pub framework: Option<String>,
    pub complexity: Complexity,
    pub estimated_minutes: u32,
    pub dependencies: BTreeSet<TaskId>,
    pub required_tools: BTreeSet<String>,
    pub status: TaskStatus,
    /// Current TDD sub-phase; only ever set on coding tasks.
    pub tdd_phase: Option<TddPhase>,
    /// Phases entered during the current attempt, in order.
    pub phase_log: Vec<PhaseStamp>,
    pub assigned_worker: Option<String>,
    /// Number of times the task has been handed to a worker.
    pub attempts: u32,
    /// Gate name to result, recorded when the task completes.
    pub quality_evidence: BTreeMap<String, GateCheck>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `NotStarted` task from its specification.
    pub fn from_spec(spec: TaskSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            domain: spec.domain,
            framework: spec.framework,
            complexity: spec.complexity,
            estimated_minutes: spec.estimated_minutes,
            dependencies: spec.dependencies,
            required_tools: spec.required_tools,
            status: TaskStatus::NotStarted,
            tdd_phase: None,
            phase_log: Vec::new(),
            assigned_worker: None,
            attempts: 0,
            quality_evidence: BTreeMap::new(),
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_coding(&self) -> bool {
        self.domain.is_coding()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Status plus TDD phase, e.g. `in_progress/green`.
    pub fn stage(&self) -> String {
        match (&self.status, self.tdd_phase) {
            (TaskStatus::InProgress, Some(phase)) => format!("in_progress/{}", phase),
            (status, _) => status.name().to_string(),
        }
    }
}
