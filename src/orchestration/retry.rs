//! Failure classification and per-task retry policy.
//!
//! Transient failures (timeouts, resource contention) are retried with
//! exponential backoff and re-delegated, possibly to another worker.
//! Persistent failures (bad task spec, permission denial, critical
//! security finding) are never retried: the task is blocked and escalated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::core::task::TaskId;

/// Why a worker could not finish a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceContention,
    InvalidSpec,
    PermissionDenied,
    CriticalSecurityFinding,
}

impl FailureKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::ResourceContention)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceContention => "resource_contention",
            FailureKind::InvalidSpec => "invalid_spec",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::CriticalSecurityFinding => "critical_security_finding",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a worker reports when it finishes with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Success,
    TransientFailure { kind: FailureKind, detail: String },
    PersistentFailure { kind: FailureKind, detail: String },
}

/// Effect of an outcome on the worker's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Success,
    Failure,
    /// The failure is about the task, not the worker.
    Neutral,
}

impl Outcome {
    /// Build a failure outcome, classified by its kind.
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if kind.is_transient() {
            Outcome::TransientFailure { kind, detail }
        } else {
            Outcome::PersistentFailure { kind, detail }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::TransientFailure { .. } => "transient_failure",
            Outcome::PersistentFailure { .. } => "persistent_failure",
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success => None,
            Outcome::TransientFailure { kind, .. } | Outcome::PersistentFailure { kind, .. } => {
                Some(*kind)
            }
        }
    }

    /// Whether the failure may be retried.
    ///
    /// The kind decides, so a persistent kind reported as transient is
    /// still never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::Success => false,
            Outcome::TransientFailure { kind, .. } => kind.is_transient(),
            Outcome::PersistentFailure { .. } => false,
        }
    }

    /// How the outcome counts toward the worker's circuit.
    ///
    /// Exactly the retryable failures count against the worker; a failure
    /// that blocks the task is about the task.
    pub fn health_signal(&self) -> HealthSignal {
        match self {
            Outcome::Success => HealthSignal::Success,
            failure if failure.is_retryable() => HealthSignal::Failure,
            _ => HealthSignal::Neutral,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::TransientFailure { kind, detail } | Outcome::PersistentFailure { kind, detail } => {
                write!(f, "{} ({}): {}", self.name(), kind, detail)
            }
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor,
            max_attempts: config.max_attempts,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * factor^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a task that has been delivered `attempts` times may go again.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-task counters of consecutive occurrences (routing failures).
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 for tasks that were never counted.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

/// What to do with a task when its backoff expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// In-progress task after a failure: hand it to a worker again.
    Redelegate,
    /// Not-started task that found no eligible worker: route it again.
    Reroute,
}

/// Tasks waiting out a backoff, ordered by due time.
///
/// A task has at most one pending entry; scheduling again replaces it.
#[derive(Debug, Default)]
pub struct RetryQueue {
    due: BTreeMap<(Instant, u64), (TaskId, RetryKind)>,
    by_task: HashMap<TaskId, (Instant, u64)>,
    next_seq: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: TaskId, kind: RetryKind, at: Instant) {
        self.cancel(&task);
        let key = (at, self.next_seq);
        self.next_seq += 1;
        self.by_task.insert(task.clone(), key);
        self.due.insert(key, (task, kind));
    }

    /// Drop a pending retry. Returns whether one existed.
    pub fn cancel(&mut self, task: &TaskId) -> bool {
        match self.by_task.remove(task) {
            Some(key) => self.due.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.by_task.contains_key(task)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.due.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TaskId, RetryKind)> {
        let mut ready = Vec::new();
        while let Some((&key, _)) = self.due.iter().next() {
            if key.0 > now {
                break;
            }
            if let Some((task, kind)) = self.due.remove(&key) {
                self.by_task.remove(&task);
                ready.push((task, kind));
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}
