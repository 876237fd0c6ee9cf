//! Append-only audit ledger.
//!
//! Every state change and routing decision is appended with a gap-free,
//! strictly increasing sequence number starting at 1. Appends are
//! serialized under one lock, which gives a single global order across
//! concurrent writers. There is no update or delete.
//!
//! A ledger may be backed by a JSON-lines journal. Each entry is written
//! and flushed before its sequence number is returned, so a crash never
//! loses an acknowledged entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::core::lifecycle::TaskEvent;
use crate::core::task::TaskSpec;
use crate::core::worker::{CircuitState, Worker};
use crate::error::{Error, Result};
use crate::orchestration::escalation::Escalation;
use crate::orchestration::gates::GateResult;
use crate::orchestration::retry::Outcome;
use crate::orchestration::router::{DelegationDecision, RoutingFailure};
use crate::{clog_debug, clog_trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TaskSubmitted,
    WorkerRegistered,
    StatusChanged,
    Delegated,
    GateEvaluated,
    CircuitStateChanged,
    OutcomeReported,
    Escalated,
    TransitionRejected,
    RoutingFailed,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 10] = [
        AuditEventType::TaskSubmitted,
        AuditEventType::WorkerRegistered,
        AuditEventType::StatusChanged,
        AuditEventType::Delegated,
        AuditEventType::GateEvaluated,
        AuditEventType::CircuitStateChanged,
        AuditEventType::OutcomeReported,
        AuditEventType::Escalated,
        AuditEventType::TransitionRejected,
        AuditEventType::RoutingFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TaskSubmitted => "task_submitted",
            AuditEventType::WorkerRegistered => "worker_registered",
            AuditEventType::StatusChanged => "status_changed",
            AuditEventType::Delegated => "delegated",
            AuditEventType::GateEvaluated => "gate_evaluated",
            AuditEventType::CircuitStateChanged => "circuit_state_changed",
            AuditEventType::OutcomeReported => "outcome_reported",
            AuditEventType::Escalated => "escalated",
            AuditEventType::TransitionRejected => "transition_rejected",
            AuditEventType::RoutingFailed => "routing_failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        AuditEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Typed payload of an entry; enough to replay state from the ledger alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AuditDetail {
    TaskSubmitted { spec: TaskSpec },
    WorkerRegistered { worker: Worker },
    StatusChanged { event: TaskEvent },
    Delegated { decision: DelegationDecision },
    GateEvaluated { worker: String, result: GateResult },
    CircuitStateChanged { from: CircuitState, to: CircuitState },
    OutcomeReported {
        worker: String,
        /// Sequence number of the `Delegated` entry this report answers.
        assignment: u64,
        outcome: Outcome,
        latency_ms: u64,
    },
    Escalated { escalation: Escalation },
    TransitionRejected { event: TaskEvent, reason: String },
    RoutingFailed { failure: RoutingFailure },
}

impl AuditDetail {
    pub fn event_type(&self) -> AuditEventType {
        match self {
            AuditDetail::TaskSubmitted { .. } => AuditEventType::TaskSubmitted,
            AuditDetail::WorkerRegistered { .. } => AuditEventType::WorkerRegistered,
            AuditDetail::StatusChanged { .. } => AuditEventType::StatusChanged,
            AuditDetail::Delegated { .. } => AuditEventType::Delegated,
            AuditDetail::GateEvaluated { .. } => AuditEventType::GateEvaluated,
            AuditDetail::CircuitStateChanged { .. } => AuditEventType::CircuitStateChanged,
            AuditDetail::OutcomeReported { .. } => AuditEventType::OutcomeReported,
            AuditDetail::Escalated { .. } => AuditEventType::Escalated,
            AuditDetail::TransitionRejected { .. } => AuditEventType::TransitionRejected,
            AuditDetail::RoutingFailed { .. } => AuditEventType::RoutingFailed,
        }
    }
}

/// A recorded ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    /// Task id or worker name.
    pub entity_id: String,
    pub event_type: AuditEventType,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    /// Who caused the change: `orchestrator`, `operator`, `planner`, or a worker name.
    pub actor: String,
    pub detail: AuditDetail,
}

/// An entry waiting to be appended.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entity_id: String,
    pub actor: String,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub detail: AuditDetail,
    pub at: DateTime<Utc>,
}

impl NewEntry {
    pub fn new(entity_id: impl Into<String>, actor: &str, detail: AuditDetail, at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor: actor.to_string(),
            before_state: None,
            after_state: None,
            detail,
            at,
        }
    }

    pub fn with_states(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.before_state = Some(before.into());
        self.after_state = Some(after.into());
        self
    }

    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before_state = Some(before.into());
        self
    }
}

/// Query filter. Unset fields match everything.
///
/// The time range is half-open: `since <= recorded_at < until`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub entity: Option<String>,
    pub event_types: Vec<AuditEventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(entity) = &self.entity {
            if &entry.entity_id != entity {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&entry.event_type) {
            return false;
        }
        if let Some(since) = self.since {
            if entry.recorded_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.recorded_at >= until {
                return false;
            }
        }
        true
    }
}

struct LedgerInner {
    entries: Vec<AuditEntry>,
    journal: Option<File>,
}

/// The audit ledger.
pub struct AuditLedger {
    inner: Mutex<LedgerInner>,
    journal_path: Option<PathBuf>,
}

impl AuditLedger {
    /// An in-memory ledger.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                entries: Vec::new(),
                journal: None,
            }),
            journal_path: None,
        }
    }

    /// A ledger mirrored to a JSON-lines journal.
    ///
    /// An existing journal is loaded and validated first; new entries
    /// continue its sequence.
    pub fn with_journal(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            Self::load(path)?
        } else {
            Vec::new()
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let journal = OpenOptions::new().create(true).append(true).open(path)?;
        clog_debug!(
            "Audit journal {} opened with {} existing entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                entries,
                journal: Some(journal),
            }),
            journal_path: Some(path.to_path_buf()),
        })
    }

    /// An in-memory ledger holding previously recorded entries.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self> {
        validate_sequence(&entries)?;
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                entries,
                journal: None,
            }),
            journal_path: None,
        })
    }

    /// Read a journal, checking that sequence numbers run 1, 2, 3, ...
    pub fn load(path: &Path) -> Result<Vec<AuditEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str::<AuditEntry>(&line)?);
        }
        validate_sequence(&entries)?;
        Ok(entries)
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerInner>> {
        self.inner.lock().map_err(|_| Error::LockPoisoned("audit ledger"))
    }

    /// A timestamp no earlier than the last recorded entry.
    ///
    /// Callers stamp an entry and the state change it describes with the
    /// same value so that replay reproduces time-dependent state exactly.
    pub fn clock(&self) -> Result<DateTime<Utc>> {
        let inner = self.lock()?;
        let now = Utc::now();
        Ok(match inner.entries.last() {
            Some(last) if last.recorded_at > now => last.recorded_at,
            _ => now,
        })
    }

    /// Append an entry and return its sequence number.
    ///
    /// A timestamp earlier than the previous entry's is raised to it, so
    /// recorded times never decrease.
    pub fn append(&self, entry: NewEntry) -> Result<u64> {
        let mut inner = self.lock()?;
        let seq = inner.entries.last().map(|e| e.seq).unwrap_or(0) + 1;
        let recorded_at = match inner.entries.last() {
            Some(last) if last.recorded_at > entry.at => last.recorded_at,
            _ => entry.at,
        };
        let record = AuditEntry {
            seq,
            recorded_at,
            entity_id: entry.entity_id,
            event_type: entry.detail.event_type(),
            before_state: entry.before_state,
            after_state: entry.after_state,
            actor: entry.actor,
            detail: entry.detail,
        };

        if let Some(journal) = inner.journal.as_mut() {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            journal.write_all(line.as_bytes())?;
            journal.flush()?;
        }

        clog_trace!(
            "ledger #{} {} {} {:?} -> {:?}",
            seq,
            record.event_type,
            record.entity_id,
            record.before_state,
            record.after_state
        );
        inner.entries.push(record);
        Ok(seq)
    }

    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.lock()?.entries.clone())
    }

    pub fn get(&self, seq: u64) -> Result<Option<AuditEntry>> {
        let inner = self.lock()?;
        // Sequence numbers are dense from 1, so the entry sits at seq - 1
        Ok(seq
            .checked_sub(1)
            .and_then(|i| inner.entries.get(i as usize))
            .cloned())
    }

    pub fn last_seq(&self) -> Result<u64> {
        Ok(self.lock()?.entries.last().map(|e| e.seq).unwrap_or(0))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write matching entries as JSON lines. Returns how many were written.
    pub fn export_jsonl<W: Write>(&self, filter: &AuditFilter, writer: &mut W) -> Result<usize> {
        let entries = self.query(filter)?;
        for entry in &entries {
            serde_json::to_writer(&mut *writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(entries.len())
    }
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger")
            .field("entries", &self.len())
            .field("journal", &self.journal_path)
            .finish()
    }
}

/// Check that entries are numbered 1, 2, 3, ... with no gaps.
pub fn validate_sequence(entries: &[AuditEntry]) -> Result<()> {
    for (i, entry) in entries.iter().enumerate() {
        let expected = i as u64 + 1;
        if entry.seq != expected {
            return Err(Error::LedgerGap {
                expected,
                found: entry.seq,
            });
        }
    }
    Ok(())
}
