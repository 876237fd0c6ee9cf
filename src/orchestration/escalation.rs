//! Escalations surfaced to the operator.
//!
//! Escalation is a typed outcome, never control flow: the orchestration
//! loop emits an `Escalation` on its sink and keeps processing other tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::task::TaskId;
use crate::orchestration::registry::Rejection;
use crate::orchestration::retry::FailureKind;
use crate::clog_warn;

/// What the escalation is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "subject", content = "id")]
pub enum EscalationSubject {
    Task(TaskId),
    Worker(String),
}

impl EscalationSubject {
    pub fn entity_id(&self) -> &str {
        match self {
            EscalationSubject::Task(id) => id.as_str(),
            EscalationSubject::Worker(name) => name,
        }
    }
}

impl std::fmt::Display for EscalationSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationSubject::Task(id) => write!(f, "task {}", id),
            EscalationSubject::Worker(name) => write!(f, "worker {}", name),
        }
    }
}

/// Why the escalation was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum EscalationTrigger {
    /// Routing found no eligible worker too many times in a row.
    NoEligibleWorker { attempts: u32 },
    /// The worker reported a failure that is never retried.
    PersistentFailure { kind: FailureKind },
    /// Transient failures used up every allowed attempt.
    RetriesExhausted { attempts: u32 },
    /// A worker's circuit opened repeatedly without closing.
    CircuitRepeatedlyOpened { opens: u32 },
}

impl std::fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationTrigger::NoEligibleWorker { attempts } => {
                write!(f, "no eligible worker after {} attempts", attempts)
            }
            EscalationTrigger::PersistentFailure { kind } => write!(f, "persistent failure: {}", kind),
            EscalationTrigger::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            EscalationTrigger::CircuitRepeatedlyOpened { opens } => {
                write!(f, "circuit opened {} times without closing", opens)
            }
        }
    }
}

/// Everything an operator needs to act without reading raw logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub subject: EscalationSubject,
    pub trigger: EscalationTrigger,
    pub detail: String,
    /// Routing rejections behind the escalation, if any.
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    /// Prior failures for the subject, oldest first.
    #[serde(default)]
    pub failure_history: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(
        subject: EscalationSubject,
        trigger: EscalationTrigger,
        detail: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject,
            trigger,
            detail: detail.into(),
            rejections: Vec::new(),
            failure_history: Vec::new(),
            raised_at,
        }
    }

    pub fn with_rejections(mut self, rejections: Vec<Rejection>) -> Self {
        self.rejections = rejections;
        self
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.failure_history = history;
        self
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.subject {
            EscalationSubject::Task(id) => Some(id),
            EscalationSubject::Worker(_) => None,
        }
    }
}

impl std::fmt::Display for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.subject, self.trigger, self.detail)
    }
}

/// Outbound escalation channel.
///
/// Sending never blocks the loop; if the consumer has gone away the
/// escalation is still in the audit ledger and a warning is logged.
#[derive(Debug, Clone)]
pub struct EscalationSink {
    tx: mpsc::UnboundedSender<Escalation>,
}

impl EscalationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Escalation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, escalation: Escalation) {
        if let Err(e) = self.tx.send(escalation) {
            clog_warn!("Escalation consumer gone, dropped: {}", e.0);
        }
    }
}
