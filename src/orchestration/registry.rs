//! Capability registry.
//!
//! The registry exclusively owns worker records: their declarations,
//! circuit breakers and latency statistics. Candidate search is a pure
//! read over the current records. Health mutation goes through
//! `record_outcome` and `circuit_state_at`, which lock only the affected
//! worker's breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{CircuitConfig, RoutingConfig, RoutingTier};
use crate::core::task::Task;
use crate::core::worker::{CircuitState, Worker, WorkerSnapshot};
use crate::error::{Error, Result};
use crate::orchestration::circuit::{CircuitBreaker, CircuitTransition};
use crate::orchestration::retry::{HealthSignal, Outcome};
use crate::{clog, clog_trace};

/// Why a worker was not chosen for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectionReason {
    /// The worker's circuit is open.
    CircuitOpen,
    /// No capability tag matches any enabled routing tier.
    CapabilityMismatch,
    /// Capable, but lacks tools the task requires.
    MissingToolPermission { tools: Vec<String> },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::CircuitOpen => write!(f, "circuit open"),
            RejectionReason::CapabilityMismatch => write!(f, "capability mismatch"),
            RejectionReason::MissingToolPermission { tools } => {
                write!(f, "missing tool permission ({})", tools.join(", "))
            }
        }
    }
}

/// A worker that was considered and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub worker: String,
    /// Tier the worker matched, if any.
    pub tier: Option<RoutingTier>,
    #[serde(flatten)]
    pub reason: RejectionReason,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} skipped: {}", self.worker, self.reason)
    }
}

/// A capable worker, annotated with how it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub worker: String,
    pub tier: RoutingTier,
    /// Matched capability tag.
    pub matched: String,
    /// In-progress assignments at search time.
    pub load: usize,
}

/// Result of a candidate search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSearch {
    /// Ordered by tier priority, then load, then name.
    pub candidates: Vec<Candidate>,
    /// Workers ruled out before circuit state is considered.
    pub rejected: Vec<Rejection>,
}

impl CandidateSearch {
    /// Candidates of one tier, in order.
    pub fn tier(&self, tier: RoutingTier) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(move |c| c.tier == tier)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyStats {
    total_ms: u64,
    samples: u64,
}

#[derive(Debug)]
struct WorkerEntry {
    worker: Worker,
    breaker: CircuitBreaker,
    latency: Mutex<LatencyStats>,
}

/// Catalog of workers with their capabilities and health.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    workers: RwLock<BTreeMap<String, Arc<WorkerEntry>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker) -> Result<()> {
        let mut workers = self
            .workers
            .write()
            .map_err(|_| Error::LockPoisoned("registry"))?;
        if workers.contains_key(&worker.name) {
            return Err(Error::DuplicateWorker(worker.name));
        }
        clog!(
            "Registered worker {} with capabilities [{}]",
            worker.name,
            worker.capabilities.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        let entry = WorkerEntry {
            breaker: CircuitBreaker::new(&worker.name),
            worker,
            latency: Mutex::new(LatencyStats::default()),
        };
        workers.insert(entry.worker.name.clone(), Arc::new(entry));
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<WorkerEntry>> {
        let workers = self
            .workers
            .read()
            .map_err(|_| Error::LockPoisoned("registry"))?;
        workers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))
    }

    fn entries(&self) -> Result<Vec<Arc<WorkerEntry>>> {
        let workers = self
            .workers
            .read()
            .map_err(|_| Error::LockPoisoned("registry"))?;
        Ok(workers.values().cloned().collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_ok()
    }

    pub fn get(&self, name: &str) -> Result<Worker> {
        Ok(self.entry(name)?.worker.clone())
    }

    pub fn len(&self) -> usize {
        self.workers.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Workers able to serve `task`, ordered by tier priority, then by
    /// current load (fewest in-progress assignments), then by name.
    ///
    /// `load` maps worker names to in-progress counts, as derived from the
    /// task graph. Circuit state is not consulted here.
    pub fn find_candidates(
        &self,
        task: &Task,
        routing: &RoutingConfig,
        load: &HashMap<String, usize>,
    ) -> Result<CandidateSearch> {
        let mut search = CandidateSearch::default();

        for entry in self.entries()? {
            let worker = &entry.worker;
            let Some((tier, matched)) = match_tier(worker, task, routing) else {
                search.rejected.push(Rejection {
                    worker: worker.name.clone(),
                    tier: None,
                    reason: RejectionReason::CapabilityMismatch,
                });
                continue;
            };
            let missing = worker.missing_tools(&task.required_tools);
            if !missing.is_empty() {
                search.rejected.push(Rejection {
                    worker: worker.name.clone(),
                    tier: Some(tier),
                    reason: RejectionReason::MissingToolPermission {
                        tools: missing.into_iter().map(String::from).collect(),
                    },
                });
                continue;
            }
            search.candidates.push(Candidate {
                worker: worker.name.clone(),
                tier,
                matched,
                load: load.get(&worker.name).copied().unwrap_or(0),
            });
        }

        let priority = |tier: RoutingTier| {
            routing
                .tiers
                .iter()
                .position(|t| *t == tier)
                .unwrap_or(usize::MAX)
        };
        search.candidates.sort_by(|a, b| {
            priority(a.tier)
                .cmp(&priority(b.tier))
                .then(a.load.cmp(&b.load))
                .then_with(|| a.worker.cmp(&b.worker))
        });

        clog_trace!(
            "find_candidates task={} candidates={} rejected={}",
            task.id,
            search.candidates.len(),
            search.rejected.len()
        );
        Ok(search)
    }

    /// Circuit state of a worker as of `now`.
    pub fn circuit_state_at(
        &self,
        name: &str,
        config: &CircuitConfig,
        now: DateTime<Utc>,
    ) -> Result<(CircuitState, Option<CircuitTransition>)> {
        self.entry(name)?.breaker.state_at(config, now)
    }

    /// Fold an outcome report into the worker's latency and circuit state.
    ///
    /// Returns the circuit transitions in the order they happened.
    pub fn record_outcome(
        &self,
        name: &str,
        outcome: &Outcome,
        latency_ms: u64,
        config: &CircuitConfig,
        at: DateTime<Utc>,
    ) -> Result<Vec<CircuitTransition>> {
        let entry = self.entry(name)?;
        {
            let mut latency = entry
                .latency
                .lock()
                .map_err(|_| Error::LockPoisoned("worker latency"))?;
            latency.total_ms = latency.total_ms.saturating_add(latency_ms);
            latency.samples += 1;
        }
        match outcome.health_signal() {
            HealthSignal::Success => entry.breaker.record_success_at(config, at),
            HealthSignal::Failure => entry.breaker.record_failure_at(config, at),
            HealthSignal::Neutral => Ok(Vec::new()),
        }
    }

    pub fn force_circuit(
        &self,
        name: &str,
        state: CircuitState,
        at: DateTime<Utc>,
    ) -> Result<Option<CircuitTransition>> {
        self.entry(name)?.breaker.force_state(state, at)
    }

    pub fn snapshot(&self, name: &str) -> Result<WorkerSnapshot> {
        snapshot_of(&*self.entry(name)?)
    }

    /// Every worker, sorted by name.
    pub fn snapshots(&self) -> Result<Vec<WorkerSnapshot>> {
        self.entries()?.iter().map(|e| snapshot_of(e)).collect()
    }
}

fn snapshot_of(entry: &WorkerEntry) -> Result<WorkerSnapshot> {
    let stats = entry.breaker.stats()?;
    let latency = *entry
        .latency
        .lock()
        .map_err(|_| Error::LockPoisoned("worker latency"))?;
    Ok(WorkerSnapshot {
        worker: entry.worker.clone(),
        circuit_state: stats.state,
        failure_count: stats.failure_count,
        last_failure_at: stats.last_failure_at,
        total_latency_ms: latency.total_ms,
        latency_samples: latency.samples,
    })
}

/// First enabled tier the worker qualifies for, with the tag that matched.
fn match_tier(worker: &Worker, task: &Task, routing: &RoutingConfig) -> Option<(RoutingTier, String)> {
    routing.tiers.iter().find_map(|tier| {
        let matched = match tier {
            RoutingTier::Framework => task
                .framework
                .as_deref()
                .filter(|f| worker.serves(f))
                .map(str::to_string),
            RoutingTier::Domain => Some(task.domain.as_str())
                .filter(|d| worker.serves(d))
                .map(str::to_string),
            RoutingTier::Generalist => routing
                .generalist_tags
                .iter()
                .find(|tag| worker.serves(tag))
                .cloned(),
        };
        matched.map(|tag| (*tier, tag))
    })
}
