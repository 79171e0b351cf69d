//! Runtime configuration.
//!
//! Loaded from `<root>/.accord/config.yaml`. Every field has a default, so a
//! missing or partial file is valid. Confidence-scoring weights live here
//! rather than in code: they decide how often conflicts resolve automatically.
//!
//! Like the stores, loaders come in two forms:
//! - `fn_at(root: &Path, …)`: explicit root; used in tests with `TempDir`
//! - `fn(…)`: uses `dirs::home_dir()` as the root, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ACCORD_DIR: &str = ".accord";
pub const CONFIG_FILE: &str = "config.yaml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccordConfig {
    pub paths: PathsConfig,
    pub bus: BusConfig,
    pub validator: ValidatorConfig,
    pub sync: SyncConfig,
    pub resolver: ResolverConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Specification documents; relative paths resolve against the root.
    pub documents_dir: PathBuf,
    /// Structured-store JSON files; relative paths resolve against the root.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            documents_dir: PathBuf::from("specs"),
            state_dir: PathBuf::from(ACCORD_DIR).join("state"),
        }
    }
}

impl PathsConfig {
    pub fn documents_dir_at(&self, root: &Path) -> PathBuf {
        resolve(root, &self.documents_dir)
    }

    pub fn state_dir_at(&self, root: &Path) -> PathBuf {
        resolve(root, &self.state_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub default_priority: u8,
    /// Maximum age of a queued event before it is dead-lettered unhandled.
    pub default_event_timeout_ms: u64,
    /// Per-handler execution timeout.
    pub default_handler_timeout_ms: u64,
    pub default_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_ms: u64,
    pub dead_letter_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_priority: 5,
            default_event_timeout_ms: 30_000,
            default_handler_timeout_ms: 5_000,
            default_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_reset_ms: 60_000,
            dead_letter_capacity: 1_000,
        }
    }
}

impl BusConfig {
    pub fn default_event_timeout(&self) -> Duration {
        Duration::from_millis(self.default_event_timeout_ms)
    }

    pub fn default_handler_timeout(&self) -> Duration {
        Duration::from_millis(self.default_handler_timeout_ms)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_millis(self.breaker_reset_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub performance_target_ms: u64,
    /// Agent roster for `assigned_agent`. Empty accepts any agent.
    pub allowed_agents: Vec<String>,
    /// Open tasks an agent may hold before a new assignment is illegal.
    pub max_tasks_per_agent: usize,
    /// Number of recent validations the rolling latency average covers.
    pub stats_window: usize,
    pub repairs_enabled: bool,
    pub audit_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            performance_target_ms: 100,
            allowed_agents: Vec::new(),
            max_tasks_per_agent: 5,
            stats_window: 100,
            repairs_enabled: true,
            audit_capacity: 500,
        }
    }
}

impl ValidatorConfig {
    pub fn performance_target(&self) -> Duration {
        Duration::from_millis(self.performance_target_ms)
    }

    pub fn agent_allowed(&self, agent: &str) -> bool {
        self.allowed_agents.is_empty() || self.allowed_agents.iter().any(|a| a == agent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub performance_target_ms: u64,
    /// Re-run the consistency check before marking an operation completed.
    pub validation_gate: bool,
    pub backup: bool,
    pub history_capacity: usize,
    pub audit_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            performance_target_ms: 2_000,
            validation_gate: true,
            backup: true,
            history_capacity: 100,
            audit_capacity: 500,
        }
    }
}

impl SyncConfig {
    pub fn performance_target(&self) -> Duration {
        Duration::from_millis(self.performance_target_ms)
    }
}

/// Weights of the three confidence factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub time: f64,
    pub authority: f64,
    pub integrity: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            time: 0.4,
            authority: 0.3,
            integrity: 0.3,
        }
    }
}

/// Scoring parameters for one resolution strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub enabled: bool,
    /// Starting confidence before factors are added.
    pub base: f64,
    /// Minimum confidence for the strategy to apply without a human.
    pub auto_resolve_threshold: f64,
    pub weights: FactorWeights,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base: 0.1,
            auto_resolve_threshold: 0.8,
            weights: FactorWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub time_based: StrategyConfig,
    pub authority_based: StrategyConfig,
    pub rule_based: StrategyConfig,
    /// Below this, no strategy is trusted regardless of its own threshold.
    pub confidence_floor: f64,
    /// Write-time gap at which the time factor saturates.
    pub time_saturation_secs: u64,
    /// Authority score when the proposed source does not own the field.
    pub authority_baseline: f64,
    pub default_data_integrity: f64,
    /// Integrity below this marks a conflict as suspected corruption.
    pub corruption_integrity: f64,
    /// Resolutions at or above this count as high-confidence in stats.
    pub high_confidence: f64,
    pub history_capacity: usize,
    pub audit_capacity: usize,
    /// Pending tickets above this make the resolver report an error.
    pub max_pending_tickets: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            time_based: StrategyConfig::default(),
            authority_based: StrategyConfig {
                enabled: true,
                base: 0.15,
                auto_resolve_threshold: 0.85,
                weights: FactorWeights {
                    time: 0.1,
                    authority: 0.5,
                    integrity: 0.2,
                },
            },
            rule_based: StrategyConfig {
                enabled: true,
                base: 0.1,
                auto_resolve_threshold: 0.75,
                weights: FactorWeights {
                    time: 0.2,
                    authority: 0.3,
                    integrity: 0.3,
                },
            },
            confidence_floor: 0.3,
            time_saturation_secs: 24 * 60 * 60,
            authority_baseline: 0.2,
            default_data_integrity: 0.5,
            corruption_integrity: 0.2,
            high_confidence: 0.8,
            history_capacity: 100,
            audit_capacity: 500,
            max_pending_tickets: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub health_interval_ms: u64,
    /// Upper bound on how long `stop()` waits for in-flight work.
    pub stop_timeout_ms: u64,
    pub audit_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            stop_timeout_ms: 10_000,
            audit_capacity: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AccordConfig {
    /// Reject values that would make scoring or scheduling meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let strategies = [
            ("time_based", &self.resolver.time_based),
            ("authority_based", &self.resolver.authority_based),
            ("rule_based", &self.resolver.rule_based),
        ];
        for (name, strategy) in strategies {
            check_unit(&format!("resolver.{name}.base"), strategy.base)?;
            check_unit(
                &format!("resolver.{name}.auto_resolve_threshold"),
                strategy.auto_resolve_threshold,
            )?;
            for (factor, weight) in [
                ("time", strategy.weights.time),
                ("authority", strategy.weights.authority),
                ("integrity", strategy.weights.integrity),
            ] {
                if !(weight >= 0.0 && weight.is_finite()) {
                    return Err(ConfigError::Invalid(format!(
                        "resolver.{name}.weights.{factor} must be a non-negative number"
                    )));
                }
            }
        }
        check_unit("resolver.confidence_floor", self.resolver.confidence_floor)?;
        check_unit("resolver.authority_baseline", self.resolver.authority_baseline)?;
        check_unit(
            "resolver.default_data_integrity",
            self.resolver.default_data_integrity,
        )?;
        if self.resolver.time_saturation_secs == 0 {
            return Err(ConfigError::Invalid(
                "resolver.time_saturation_secs must be positive".to_string(),
            ));
        }
        if self.bus.breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "bus.breaker_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.bus.default_handler_timeout_ms == 0 || self.bus.default_event_timeout_ms == 0 {
            return Err(ConfigError::Invalid("bus timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<root>/.accord/`
pub fn accord_dir_at(root: &Path) -> PathBuf {
    root.join(ACCORD_DIR)
}

/// `<root>/.accord/config.yaml`
pub fn config_path_at(root: &Path) -> PathBuf {
    accord_dir_at(root).join(CONFIG_FILE)
}

/// Load and validate the config under `root`; defaults when the file is absent.
pub fn load_at(root: &Path) -> Result<AccordConfig, ConfigError> {
    let path = config_path_at(root);
    if !path.exists() {
        return Ok(AccordConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
        path: path.clone(),
        source: e,
    })?;
    let config: AccordConfig = if contents.trim().is_empty() {
        AccordConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper rooted at the home directory.
pub fn load() -> Result<AccordConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically write `config` to `<root>/.accord/config.yaml`.
pub fn save_at(root: &Path, config: &AccordConfig) -> Result<(), ConfigError> {
    let path = config_path_at(root);
    let io = |path: &Path, e: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io(&path, e))?;
    Ok(())
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
