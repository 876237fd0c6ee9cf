//! Plan files.
//!
//! A plan is a TOML document listing workers and tasks, plus optional
//! scripted worker behavior used by `conductor simulate`:
//!
//! ```toml
//! [[worker]]
//! name = "rails-specialist"
//! capabilities = ["rails"]
//!
//! [[task]]
//! id = "api-users"
//! domain = "backend"
//! framework = "rails"
//! dependencies = ["schema"]
//!
//! [simulate.api-users]
//! outcomes = ["timeout", "success"]
//! coverage = "0.85"
//! ```
//!
//! A task without an `id` gets a generated `task-xxxxxxxx` identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::dag::TaskGraph;
use crate::core::evidence::Fraction;
use crate::core::task::{TaskId, TaskSpec};
use crate::core::worker::Worker;
use crate::error::{Error, Result};
use crate::orchestration::registry::CapabilityRegistry;
use crate::orchestration::retry::{FailureKind, Outcome};
use crate::clog_debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, rename = "worker")]
    pub workers: Vec<Worker>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
    /// Scripted behavior keyed by task id.
    #[serde(default)]
    pub simulate: BTreeMap<String, Script>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let plan = Self::parse(&content)?;
        clog_debug!(
            "Loaded plan {}: {} workers, {} tasks",
            path.display(),
            plan.workers.len(),
            plan.tasks.len()
        );
        Ok(plan)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(content)?;
        for id in plan.simulate.keys() {
            if !plan.tasks.iter().any(|t| t.id.as_str() == id) {
                return Err(Error::Config(format!("simulate entry for unknown task {}", id)));
            }
        }
        Ok(plan)
    }

    /// Insert every task in file order, collecting rejections instead of
    /// stopping at the first one.
    pub fn ingest(&self, at: DateTime<Utc>) -> Ingested {
        let mut graph = TaskGraph::new();
        let mut rejected = Vec::new();
        for spec in &self.tasks {
            if let Err(e) = graph.add_task(spec.clone(), at) {
                rejected.push((spec.id.clone(), e));
            }
        }
        Ingested { graph, rejected }
    }

    pub fn registry(&self) -> Result<CapabilityRegistry> {
        let registry = CapabilityRegistry::new();
        for worker in &self.workers {
            registry.register(worker.clone())?;
        }
        Ok(registry)
    }

    pub fn script(&self, task: &TaskId) -> Script {
        self.simulate.get(task.as_str()).cloned().unwrap_or_default()
    }
}

/// Result of ingesting a plan.
#[derive(Debug)]
pub struct Ingested {
    pub graph: TaskGraph,
    pub rejected: Vec<(TaskId, Error)>,
}

impl Ingested {
    /// Tasks waiting on ids the plan never defines.
    pub fn unresolved(&self) -> Vec<(TaskId, Vec<TaskId>)> {
        self.graph
            .tasks()
            .filter_map(|task| {
                let missing = self.graph.unresolved_dependencies(&task.id);
                (!missing.is_empty()).then(|| (task.id.clone(), missing))
            })
            .collect()
    }
}

/// What a simulated worker reports for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    /// Outcome per delivery; the last entry repeats. Empty means success.
    pub outcomes: Vec<ScriptedOutcome>,
    pub coverage: Fraction,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub critical_findings: u32,
    /// Jump straight to Green without a Red phase.
    pub skip_red: bool,
    pub latency_ms: u64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
            coverage: Fraction::percent(100),
            tests_passed: 10,
            tests_failed: 0,
            critical_findings: 0,
            skip_red: false,
            latency_ms: 100,
        }
    }
}

impl Script {
    /// Outcome for the given delivery (1-based).
    pub fn outcome_for(&self, attempt: u32) -> Outcome {
        let index = attempt.saturating_sub(1) as usize;
        self.outcomes
            .get(index)
            .or_else(|| self.outcomes.last())
            .map(|o| o.to_outcome())
            .unwrap_or(Outcome::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Success,
    Timeout,
    ResourceContention,
    InvalidSpec,
    PermissionDenied,
    CriticalSecurityFinding,
}

impl ScriptedOutcome {
    pub fn to_outcome(self) -> Outcome {
        let kind = match self {
            ScriptedOutcome::Success => return Outcome::Success,
            ScriptedOutcome::Timeout => FailureKind::Timeout,
            ScriptedOutcome::ResourceContention => FailureKind::ResourceContention,
            ScriptedOutcome::InvalidSpec => FailureKind::InvalidSpec,
            ScriptedOutcome::PermissionDenied => FailureKind::PermissionDenied,
            ScriptedOutcome::CriticalSecurityFinding => FailureKind::CriticalSecurityFinding,
        };
        Outcome::failure(kind, "scripted")
    }
}
