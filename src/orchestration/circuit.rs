//! Per-worker circuit breaker.
//!
//! ```text
//! Closed --(failure_threshold failures within window)--> Open
//! Open --(open_timeout elapsed)--> HalfOpen
//! HalfOpen --(half_open_success_threshold successes)--> Closed
//! HalfOpen --(failure)--> Open
//! ```
//!
//! Every operation takes the current time explicitly so that the audit
//! ledger can replay breaker history exactly. Parameters come from the
//! caller's config snapshot; changing them never resets breaker state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::config::CircuitConfig;
use crate::core::worker::CircuitState;
use crate::error::{Error, Result};
use crate::{clog, clog_debug, clog_warn};

/// A state change made by the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub worker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    /// Times the circuit has opened since it was last closed.
    pub opens_without_close: u32,
}

impl CircuitTransition {
    /// Whether this transition opened the circuit.
    pub fn opened(&self) -> bool {
        self.to == CircuitState::Open
    }
}

/// Counters and timestamps for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Consecutive failures counted toward opening.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub opens_without_close: u32,
}

impl Default for CircuitBreakerStats {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            opens_without_close: 0,
        }
    }
}

/// Circuit breaker for a single worker.
///
/// All mutation happens under the breaker's own mutex, so concurrent
/// outcome reports for the same worker are counted exactly once each.
pub struct CircuitBreaker {
    worker: String,
    stats: Mutex<CircuitBreakerStats>,
}

impl CircuitBreaker {
    pub fn new(worker: &str) -> Self {
        Self {
            worker: worker.to_string(),
            stats: Mutex::new(CircuitBreakerStats::default()),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    fn lock(&self) -> Result<MutexGuard<'_, CircuitBreakerStats>> {
        self.stats.lock().map_err(|_| Error::LockPoisoned("circuit breaker"))
    }

    pub fn stats(&self) -> Result<CircuitBreakerStats> {
        Ok(self.lock()?.clone())
    }

    /// State as of `now`, moving Open to HalfOpen once the timeout elapsed.
    ///
    /// Returns the transition when one happened so the caller can record it.
    pub fn state_at(
        &self,
        config: &CircuitConfig,
        now: DateTime<Utc>,
    ) -> Result<(CircuitState, Option<CircuitTransition>)> {
        let mut stats = self.lock()?;
        let transition = self.expire_open(&mut stats, config, now);
        Ok((stats.state, transition))
    }

    /// Count a success. An elapsed open timeout is applied first, so the
    /// result may hold Open -> HalfOpen followed by HalfOpen -> Closed.
    pub fn record_success_at(
        &self,
        config: &CircuitConfig,
        at: DateTime<Utc>,
    ) -> Result<Vec<CircuitTransition>> {
        let mut stats = self.lock()?;
        let mut transitions: Vec<_> = self.expire_open(&mut stats, config, at).into_iter().collect();
        match stats.state {
            CircuitState::Closed => {
                stats.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                stats.success_count += 1;
                if stats.success_count >= config.half_open_success_threshold {
                    clog!(
                        "Circuit for {} closing after {} successes",
                        self.worker,
                        stats.success_count
                    );
                    transitions.push(self.transition_to(&mut stats, CircuitState::Closed, at));
                }
            }
            CircuitState::Open => {
                // Late success from work delegated before the circuit opened
                clog_debug!("Success recorded while circuit for {} is open", self.worker);
            }
        }
        Ok(transitions)
    }

    /// Count a failure. An elapsed open timeout is applied first, so a
    /// failure after the timeout re-opens the circuit with a fresh timer.
    pub fn record_failure_at(
        &self,
        config: &CircuitConfig,
        at: DateTime<Utc>,
    ) -> Result<Vec<CircuitTransition>> {
        let mut stats = self.lock()?;
        let mut transitions: Vec<_> = self.expire_open(&mut stats, config, at).into_iter().collect();
        match stats.state {
            CircuitState::Closed => {
                let stale = stats
                    .last_failure_at
                    .map(|last| at - last > config.failure_window())
                    .unwrap_or(false);
                if stale {
                    stats.failure_count = 0;
                }
                stats.failure_count += 1;
                stats.last_failure_at = Some(at);
                if stats.failure_count >= config.failure_threshold {
                    clog_warn!(
                        "Circuit for {} opening after {} failures",
                        self.worker,
                        stats.failure_count
                    );
                    transitions.push(self.transition_to(&mut stats, CircuitState::Open, at));
                }
            }
            CircuitState::HalfOpen => {
                stats.failure_count += 1;
                stats.last_failure_at = Some(at);
                clog_warn!("Circuit for {} re-opening after half-open failure", self.worker);
                transitions.push(self.transition_to(&mut stats, CircuitState::Open, at));
            }
            CircuitState::Open => {
                stats.failure_count += 1;
                stats.last_failure_at = Some(at);
            }
        }
        Ok(transitions)
    }

    fn expire_open(
        &self,
        stats: &mut CircuitBreakerStats,
        config: &CircuitConfig,
        now: DateTime<Utc>,
    ) -> Option<CircuitTransition> {
        if stats.state != CircuitState::Open {
            return None;
        }
        let elapsed = stats
            .opened_at
            .map(|opened| now - opened >= config.open_timeout())
            .unwrap_or(false);
        if !elapsed {
            return None;
        }
        clog!("Circuit for {} half-open after timeout", self.worker);
        Some(self.transition_to(stats, CircuitState::HalfOpen, now))
    }

    /// Move to `to` unconditionally. Used by replay and operators.
    pub fn force_state(&self, to: CircuitState, at: DateTime<Utc>) -> Result<Option<CircuitTransition>> {
        let mut stats = self.lock()?;
        if stats.state == to {
            return Ok(None);
        }
        Ok(Some(self.transition_to(&mut stats, to, at)))
    }

    fn transition_to(
        &self,
        stats: &mut CircuitBreakerStats,
        to: CircuitState,
        at: DateTime<Utc>,
    ) -> CircuitTransition {
        let from = stats.state;
        stats.state = to;
        stats.success_count = 0;
        match to {
            CircuitState::Closed => {
                stats.failure_count = 0;
                stats.opened_at = None;
                stats.opens_without_close = 0;
            }
            CircuitState::Open => {
                stats.opened_at = Some(at);
                stats.opens_without_close += 1;
            }
            CircuitState::HalfOpen => {}
        }
        CircuitTransition {
            worker: self.worker.clone(),
            from,
            to,
            at,
            opens_without_close: stats.opens_without_close,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("worker", &self.worker)
            .field("stats", &self.stats.lock().ok().map(|s| s.clone()))
            .finish()
    }
}
