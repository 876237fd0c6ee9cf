//! Completion evidence reported by workers.
//!
//! Coverage is kept as an exact fraction so threshold comparisons at the
//! boundary never depend on floating point rounding.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::core::task::PhaseStamp;
use crate::error::{Error, Result};

/// An exact non-negative rational number.
///
/// Parses from `"0.80"`, `"80%"`, `"4/5"` or `"1"`. Comparison is by value,
/// so `80/100 == 4/5`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fraction {
    num: u64,
    den: u64,
}

impl Fraction {
    pub fn new(num: u64, den: u64) -> Result<Self> {
        if den == 0 {
            return Err(Error::InvalidFraction(format!("{}/0", num)));
        }
        Ok(Self { num, den })
    }

    /// `pct / 100`.
    pub const fn percent(pct: u64) -> Self {
        Self { num: pct, den: 100 }
    }

    pub fn numerator(&self) -> u64 {
        self.num
    }

    pub fn denominator(&self) -> u64 {
        self.den
    }

    /// True when the value lies in `[0, 1]`.
    pub fn is_unit(&self) -> bool {
        self.num <= self.den
    }

    fn parse_decimal(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidFraction(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 18 {
            return Err(invalid());
        }
        let den = 10u64.pow(frac.len() as u32);
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_val: u64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| invalid())?
        };
        let num = whole
            .checked_mul(den)
            .and_then(|w| w.checked_add(frac_val))
            .ok_or_else(invalid)?;
        Self::new(num, den)
    }
}

impl std::str::FromStr for Fraction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((n, d)) = s.split_once('/') {
            let parse = |v: &str| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidFraction(s.to_string()))
            };
            return Self::new(parse(n)?, parse(d)?);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let value = Self::parse_decimal(pct.trim())?;
            let den = value
                .den
                .checked_mul(100)
                .ok_or_else(|| Error::InvalidFraction(s.to_string()))?;
            return Self::new(value.num, den);
        }
        Self::parse_decimal(s)
    }
}

impl TryFrom<String> for Fraction {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fraction> for String {
    fn from(f: Fraction) -> Self {
        f.to_string()
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Fraction {}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as u128 * other.den as u128;
        let rhs = other.num as u128 * self.den as u128;
        lhs.cmp(&rhs)
    }
}

/// Test run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
}

/// Findings from one security or quality scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub tool: String,
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub high: u32,
}

impl ScanReport {
    pub fn new(tool: &str, critical: u32, high: u32) -> Self {
        Self {
            tool: tool.to_string(),
            critical,
            high,
        }
    }
}

/// Structured evidence attached to a worker's completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Evidence {
    #[serde(default)]
    pub tests: Option<TestSummary>,
    #[serde(default)]
    pub unit_coverage: Option<Fraction>,
    #[serde(default)]
    pub scans: Vec<ScanReport>,
    /// TDD phase entries in the order they were observed.
    #[serde(default)]
    pub phase_log: Vec<PhaseStamp>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tests(mut self, passed: u32, failed: u32) -> Self {
        self.tests = Some(TestSummary { passed, failed });
        self
    }

    pub fn with_coverage(mut self, coverage: Fraction) -> Self {
        self.unit_coverage = Some(coverage);
        self
    }

    pub fn with_scan(mut self, scan: ScanReport) -> Self {
        self.scans.push(scan);
        self
    }

    pub fn with_phase(mut self, stamp: PhaseStamp) -> Self {
        self.phase_log.push(stamp);
        self
    }

    pub fn critical_findings(&self) -> u32 {
        self.scans.iter().map(|s| s.critical).sum()
    }
}

/// Result of one named gate, as stored on a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    pub passed: bool,
    pub detail: String,
}

impl GateCheck {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}
