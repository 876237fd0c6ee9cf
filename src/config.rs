//! Engine configuration and the hot-reloadable snapshot handle.
//!
//! Configuration is read from `~/.conductor/conductor.toml` or an explicit
//! path. A missing file yields the defaults. Readers never see a partially
//! applied change: they take an `Arc<Config>` snapshot at the start of a
//! decision and keep using it until the decision is done.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::core::task::Domain;
use crate::orchestration::gates::GateProfile;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Upper bound for any configured duration, in seconds (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Circuit breaker parameters, shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures within the window that open the circuit.
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    /// Successes needed while half-open to close again.
    pub half_open_success_threshold: u32,
    /// A failure older than this no longer counts toward the threshold.
    pub failure_window_secs: u64,
    /// Opens without an intervening close before the worker is escalated.
    pub repeat_open_escalation: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_secs: 60,
            half_open_success_threshold: 2,
            failure_window_secs: 60,
            repeat_open_escalation: 2,
        }
    }
}

impl CircuitConfig {
    pub fn open_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.open_timeout_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn failure_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_window_secs.min(MAX_DURATION_SECS) as i64)
    }
}

/// Per-task retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub factor: u32,
    /// Total deliveries of a task before it is escalated.
    pub max_attempts: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2,
            max_attempts: 3,
            max_delay_ms: 60_000,
        }
    }
}

/// A fallback tier in the routing decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTier {
    /// Worker declares the task's framework tag.
    Framework,
    /// Worker declares the task's domain tag.
    Domain,
    /// Worker declares one of the generalist tags.
    Generalist,
}

impl std::fmt::Display for RoutingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingTier::Framework => write!(f, "framework"),
            RoutingTier::Domain => write!(f, "domain"),
            RoutingTier::Generalist => write!(f, "generalist"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Tiers in priority order.
    pub tiers: Vec<RoutingTier>,
    pub generalist_tags: Vec<String>,
    /// Consecutive routing failures before a task is blocked and escalated.
    pub escalate_after: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                RoutingTier::Framework,
                RoutingTier::Domain,
                RoutingTier::Generalist,
            ],
            generalist_tags: vec!["generalist".to_string()],
            escalate_after: 3,
        }
    }
}

/// Gate profiles, one per domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub backend: GateProfile,
    pub frontend: GateProfile,
    pub infra: GateProfile,
    pub testing: GateProfile,
    pub docs: GateProfile,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            backend: GateProfile::coding(),
            frontend: GateProfile::coding(),
            infra: GateProfile::infra(),
            testing: GateProfile::coding(),
            docs: GateProfile::docs(),
        }
    }
}

impl GatesConfig {
    pub fn profile(&self, domain: Domain) -> &GateProfile {
        match domain {
            Domain::Backend => &self.backend,
            Domain::Frontend => &self.frontend,
            Domain::Infra => &self.infra,
            Domain::Testing => &self.testing,
            Domain::Docs => &self.docs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub routing: RoutingConfig,
    pub gates: GatesConfig,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load and validate a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load_from path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.circuit;
        if c.failure_threshold == 0 {
            return Err(Error::Config("circuit.failure_threshold must be at least 1".into()));
        }
        if c.half_open_success_threshold == 0 {
            return Err(Error::Config(
                "circuit.half_open_success_threshold must be at least 1".into(),
            ));
        }
        if c.repeat_open_escalation == 0 {
            return Err(Error::Config("circuit.repeat_open_escalation must be at least 1".into()));
        }
        if c.open_timeout_secs > MAX_DURATION_SECS || c.failure_window_secs > MAX_DURATION_SECS {
            return Err(Error::Config("circuit durations must be at most one year".into()));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if r.factor == 0 {
            return Err(Error::Config("retry.factor must be at least 1".into()));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(Error::Config("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }

        let routing = &self.routing;
        if routing.tiers.is_empty() {
            return Err(Error::Config("routing.tiers must name at least one tier".into()));
        }
        let unique: BTreeSet<_> = routing.tiers.iter().collect();
        if unique.len() != routing.tiers.len() {
            return Err(Error::Config("routing.tiers contains a duplicate tier".into()));
        }
        if routing.escalate_after == 0 {
            return Err(Error::Config("routing.escalate_after must be at least 1".into()));
        }
        if routing.tiers.contains(&RoutingTier::Generalist) && routing.generalist_tags.is_empty() {
            return Err(Error::Config(
                "routing.generalist_tags is empty but the generalist tier is enabled".into(),
            ));
        }

        for domain in Domain::ALL {
            if let Some(min) = self.gates.profile(domain).min_unit_coverage {
                if !min.is_unit() {
                    return Err(Error::Config(format!(
                        "gates.{}.min_unit_coverage must be between 0 and 1",
                        domain
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Shared, hot-swappable configuration.
///
/// Cloning the handle shares the same underlying snapshot slot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: None,
        }
    }

    /// Load from a file and remember the path for `reload` and `watch`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let config = Config::load_from(path)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The config in effect right now.
    pub fn snapshot(&self) -> Arc<Config> {
        // The slot only ever holds a whole Arc, so a poisoned lock still
        // guards a consistent value.
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new config after validating it.
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;
        let mut slot = self
            .current
            .write()
            .map_err(|_| Error::LockPoisoned("config"))?;
        *slot = Arc::new(config);
        Ok(())
    }

    /// Re-read the backing file. On error the previous snapshot stays.
    ///
    /// Returns whether the effective config changed.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let config = Config::load_from(path)?;
        if *self.snapshot() == config {
            return Ok(false);
        }
        self.replace(config)?;
        clog!("Config reloaded from {}", path.display());
        Ok(true)
    }

    /// Reload whenever the backing file is created or modified.
    ///
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> Result<ConfigWatcher> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| Error::Config("config handle has no backing file".into()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());
        let handle = self.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else {
                    return;
                };
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {}
                    _ => return,
                }
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !touches_config {
                    return;
                }
                if let Err(e) = handle.reload() {
                    clog_warn!("Config reload failed, keeping previous config: {}", e);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        clog_debug!("Watching {} for config changes", path.display());

        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Keeps a config file watch alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evidence::Fraction;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.circuit.open_timeout_secs, 60);
        assert_eq!(config.circuit.half_open_success_threshold, 2);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.factor, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.routing.escalate_after, 3);
        assert_eq!(
            config.gates.backend.min_unit_coverage,
            Some("0.80".parse::<Fraction>().unwrap())
        );
        assert!(!config.gates.docs.require_tdd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conductor.toml");
        fs::write(
            &path,
            r#"
            [circuit]
            open_timeout_secs = 5

            [routing]
            tiers = ["framework", "generalist"]

            [gates.backend]
            min_unit_coverage = "0.9"
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.circuit.open_timeout_secs, 5);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.routing.tiers, vec![RoutingTier::Framework, RoutingTier::Generalist]);
        assert_eq!(
            config.gates.backend.min_unit_coverage,
            Some("9/10".parse::<Fraction>().unwrap())
        );
        // A profile section replaces the default profile wholesale
        assert!(!config.gates.backend.require_tests);
        assert!(!config.gates.backend.require_tdd);
        assert_eq!(config.gates.frontend, GateProfile::coding());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
            [routing]
            tiers = ["framework", "astrology"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.circuit.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_tier() {
        let mut config = Config::default();
        config.routing.tiers = vec![RoutingTier::Domain, RoutingTier::Domain];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_coverage_above_one() {
        let mut config = Config::default();
        config.gates.infra.min_unit_coverage = Some("1.5".parse().unwrap());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gates.infra"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("conductor.toml");
        let mut config = Config::default();
        config.retry.max_attempts = 5;
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_handle_snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();

        let mut next = Config::default();
        next.circuit.failure_threshold = 7;
        handle.replace(next).unwrap();

        assert_eq!(before.circuit.failure_threshold, 3);
        assert_eq!(handle.snapshot().circuit.failure_threshold, 7);
    }

    #[test]
    fn test_handle_replace_rejects_invalid() {
        let handle = ConfigHandle::new(Config::default());
        let mut bad = Config::default();
        bad.retry.max_attempts = 0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().retry.max_attempts, 3);
    }

    #[test]
    fn test_handle_reload_keeps_old_on_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conductor.toml");
        fs::write(&path, "[retry]\nmax_attempts = 4\n").unwrap();
        let handle = ConfigHandle::from_path(&path).unwrap();
        assert_eq!(handle.snapshot().retry.max_attempts, 4);

        fs::write(&path, "[retry\nmax_attempts = ").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().retry.max_attempts, 4);

        fs::write(&path, "[retry]\nmax_attempts = 6\n").unwrap();
        assert!(handle.reload().unwrap());
        assert_eq!(handle.snapshot().retry.max_attempts, 6);
        assert!(!handle.reload().unwrap());
    }

    #[test]
    fn test_watch_requires_backing_file() {
        let handle = ConfigHandle::new(Config::default());
        assert!(handle.watch().is_err());
    }

    #[test]
    fn test_watch_reloads_on_modify() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conductor.toml");
        fs::write(&path, "[retry]\nmax_attempts = 4\n").unwrap();
        let handle = ConfigHandle::from_path(&path).unwrap();
        let _watcher = handle.watch().unwrap();

        fs::write(&path, "[retry]\nmax_attempts = 9\n").unwrap();

        let mut reloaded = false;
        for _ in 0..100 {
            if handle.snapshot().retry.max_attempts == 9 {
                reloaded = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(reloaded, "config watcher did not pick up the change");
    }
}
