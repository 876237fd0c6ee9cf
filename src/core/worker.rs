//! Worker declarations and health snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A capability-bearing executor that tasks are delegated to.
///
/// Workers are declared up front by name with a set of capability tags
/// (`"rails"`, `"backend"`, `"security-review"`) and a least-privilege
/// tool allow-list. Health state lives in the registry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

impl Worker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: BTreeSet::new(),
            tools: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.capabilities.insert(tag.to_string());
        self
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tools.insert(tool.to_string());
        self
    }

    pub fn serves(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    /// Required tools this worker lacks, in sorted order.
    pub fn missing_tools<'a>(&self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .iter()
            .filter(|tool| !self.tools.contains(*tool))
            .map(String::as_str)
            .collect()
    }
}

/// State of a worker's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; tasks may be delegated.
    #[default]
    Closed,
    /// Too many recent failures; no new delegations.
    Open,
    /// Probation after the open timeout; delegations allowed as trials.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a registered worker, including health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker: Worker,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Sum of reported latencies, in milliseconds.
    pub total_latency_ms: u64,
    pub latency_samples: u64,
}

impl WorkerSnapshot {
    pub fn name(&self) -> &str {
        &self.worker.name
    }

    /// Mean reported latency in whole milliseconds.
    pub fn average_latency_ms(&self) -> Option<u64> {
        if self.latency_samples == 0 {
            None
        } else {
            Some(self.total_latency_ms / self.latency_samples)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_builder() {
        let worker = Worker::new("rails-specialist")
            .with_capability("rails")
            .with_capability("backend")
            .with_tool("write");
        assert!(worker.serves("rails"));
        assert!(!worker.serves("react"));
        assert!(worker.tools.contains("write"));
    }

    #[test]
    fn test_missing_tools() {
        let worker = Worker::new("w").with_tool("read");
        let required: BTreeSet<String> = ["read", "write", "bash"].iter().map(|s| s.to_string()).collect();
        assert_eq!(worker.missing_tools(&required), vec!["bash", "write"]);
    }

    #[test]
    fn test_worker_deserialize_defaults() {
        let worker: Worker = toml::from_str(r#"name = "generalist""#).unwrap();
        assert!(worker.capabilities.is_empty());
        assert!(worker.tools.is_empty());
    }

    #[test]
    fn test_circuit_state_display_and_default() {
        assert_eq!(CircuitState::default(), CircuitState::Closed);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        let json = serde_json::to_string(&CircuitState::Open).unwrap();
        assert_eq!(json, "\"open\"");
    }

    #[test]
    fn test_average_latency() {
        let mut snapshot = WorkerSnapshot {
            worker: Worker::new("w"),
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            total_latency_ms: 0,
            latency_samples: 0,
        };
        assert_eq!(snapshot.average_latency_ms(), None);
        snapshot.total_latency_ms = 900;
        snapshot.latency_samples = 4;
        assert_eq!(snapshot.average_latency_ms(), Some(225));
        assert_eq!(snapshot.name(), "w");
    }
}
