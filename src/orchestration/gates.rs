//! Quality gate engine.
//!
//! Gates are pass/fail predicates over a worker's completion evidence.
//! Which gates apply depends on the task's domain profile. A failing gate
//! is a normal evaluation outcome, not an error: the orchestrator reverts
//! the task to `InProgress` and schedules a retry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::GatesConfig;
use crate::core::evidence::{Evidence, Fraction, GateCheck};
use crate::core::task::{PhaseStamp, Task, TddPhase};

/// Red must precede Green in a non-decreasing phase log.
pub const TDD_ORDERING: &str = "tdd_ordering";
/// Unit coverage at or above the profile threshold.
pub const UNIT_COVERAGE: &str = "unit_coverage";
/// Tests were supplied, at least one ran, none failed.
pub const TESTS_PASS: &str = "tests_pass";
/// Critical scanner findings at or below the profile maximum.
pub const NO_CRITICAL_FINDINGS: &str = "no_critical_findings";

/// Gates that apply to one domain.
///
/// A profile section present in the config file replaces the default
/// profile for that domain entirely; unstated gates are off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GateProfile {
    pub require_tdd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_unit_coverage: Option<Fraction>,
    pub require_tests: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_critical_findings: Option<u32>,
}

impl GateProfile {
    /// Backend, frontend and testing work: full test-first discipline.
    pub fn coding() -> Self {
        Self {
            require_tdd: true,
            min_unit_coverage: Some(Fraction::percent(80)),
            require_tests: true,
            max_critical_findings: Some(0),
        }
    }

    pub fn infra() -> Self {
        Self {
            require_tdd: false,
            min_unit_coverage: None,
            require_tests: true,
            max_critical_findings: Some(0),
        }
    }

    pub fn docs() -> Self {
        Self {
            require_tdd: false,
            min_unit_coverage: None,
            require_tests: false,
            max_critical_findings: Some(0),
        }
    }

    /// Names of the gates this profile enables for `task`.
    pub fn gate_names(&self, task: &Task) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.require_tdd && task.is_coding() {
            names.push(TDD_ORDERING);
        }
        if self.min_unit_coverage.is_some() {
            names.push(UNIT_COVERAGE);
        }
        if self.require_tests {
            names.push(TESTS_PASS);
        }
        if self.max_critical_findings.is_some() {
            names.push(NO_CRITICAL_FINDINGS);
        }
        names
    }
}

/// Outcome of evaluating every applicable gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    /// Failed gate names in evaluation order.
    pub failed_gates: Vec<String>,
    /// Every evaluated gate with its detail.
    pub checks: BTreeMap<String, GateCheck>,
}

impl GateResult {
    fn from_checks(checks: Vec<(&'static str, GateCheck)>) -> Self {
        let failed_gates: Vec<String> = checks
            .iter()
            .filter(|(_, c)| !c.passed)
            .map(|(name, _)| name.to_string())
            .collect();
        Self {
            passed: failed_gates.is_empty(),
            failed_gates,
            checks: checks
                .into_iter()
                .map(|(name, check)| (name.to_string(), check))
                .collect(),
        }
    }

    /// One-line summary, e.g. `failed: unit_coverage (79/100 < 4/5)`.
    pub fn summary(&self) -> String {
        if self.passed {
            return format!("passed {} gate(s)", self.checks.len());
        }
        let parts: Vec<String> = self
            .failed_gates
            .iter()
            .map(|name| match self.checks.get(name) {
                Some(check) => format!("{} ({})", name, check.detail),
                None => name.clone(),
            })
            .collect();
        format!("failed: {}", parts.join(", "))
    }
}

/// Evaluates completion evidence against the domain gate profiles.
pub struct QualityGateEngine<'a> {
    gates: &'a GatesConfig,
}

impl<'a> QualityGateEngine<'a> {
    pub fn new(gates: &'a GatesConfig) -> Self {
        Self { gates }
    }

    /// Evaluate the gates for the task's domain.
    ///
    /// The TDD gate reads `evidence.phase_log`; callers fill it from the
    /// engine-observed phase log when the worker supplied none.
    pub fn evaluate(&self, task: &Task, evidence: &Evidence) -> GateResult {
        let profile = self.gates.profile(task.domain);
        let mut checks = Vec::new();

        if profile.require_tdd && task.is_coding() {
            checks.push((TDD_ORDERING, check_tdd_ordering(&evidence.phase_log)));
        }
        if let Some(min) = profile.min_unit_coverage {
            checks.push((UNIT_COVERAGE, check_coverage(evidence.unit_coverage, min)));
        }
        if profile.require_tests {
            checks.push((TESTS_PASS, check_tests(evidence)));
        }
        if let Some(max) = profile.max_critical_findings {
            checks.push((NO_CRITICAL_FINDINGS, check_critical(evidence, max)));
        }

        GateResult::from_checks(checks)
    }
}

/// Red must be entered before Green, and entry timestamps never go back.
pub fn check_tdd_ordering(log: &[PhaseStamp]) -> GateCheck {
    if let Some(i) = log
        .windows(2)
        .position(|pair| pair[1].entered_at < pair[0].entered_at)
    {
        return GateCheck::fail(format!(
            "phase log timestamps go backwards at entry {} ({})",
            i + 1,
            log[i + 1].phase
        ));
    }

    let first = |phase: TddPhase| log.iter().position(|s| s.phase == phase);
    let Some(green) = first(TddPhase::Green) else {
        return GateCheck::fail("no green phase recorded");
    };
    let red = match first(TddPhase::Red) {
        Some(red) if red < green => red,
        _ => return GateCheck::fail("green entered without a preceding red"),
    };
    if let Some(refactor) = first(TddPhase::Refactor) {
        if refactor < green {
            return GateCheck::fail("refactor entered before green");
        }
    }

    GateCheck::pass(format!(
        "red at {} preceded green at {}",
        log[red].entered_at.to_rfc3339(),
        log[green].entered_at.to_rfc3339()
    ))
}

fn check_coverage(coverage: Option<Fraction>, min: Fraction) -> GateCheck {
    match coverage {
        None => GateCheck::fail("no unit coverage reported"),
        Some(cov) if cov >= min => GateCheck::pass(format!("{} >= {}", cov, min)),
        Some(cov) => GateCheck::fail(format!("{} < {}", cov, min)),
    }
}

fn check_tests(evidence: &Evidence) -> GateCheck {
    match evidence.tests {
        None => GateCheck::fail("no test results supplied"),
        Some(summary) if summary.failed > 0 => {
            GateCheck::fail(format!("{} failing, {} passing", summary.failed, summary.passed))
        }
        Some(summary) if summary.passed == 0 => GateCheck::fail("no tests ran"),
        Some(summary) => GateCheck::pass(format!("{} passing", summary.passed)),
    }
}

fn check_critical(evidence: &Evidence, max: u32) -> GateCheck {
    let critical = evidence.critical_findings();
    if critical <= max {
        GateCheck::pass(format!("{} critical finding(s)", critical))
    } else {
        let tools: Vec<&str> = evidence
            .scans
            .iter()
            .filter(|s| s.critical > 0)
            .map(|s| s.tool.as_str())
            .collect();
        GateCheck::fail(format!(
            "{} critical finding(s) from {}",
            critical,
            tools.join(", ")
        ))
    }
}
