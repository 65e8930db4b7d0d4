//! Autonomy configuration.
//!
//! Every field has a default, so a missing or partial `config.toml` is valid.

use crate::error::{Error, Result};
use crate::executor::TimeoutPolicy;
use crate::scheduler::{DEFAULT_STRATEGY, ScheduleConfig, builtin_strategies};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Budget ledger settings.
    pub ledger: LedgerConfig,
    /// Skill executor settings.
    pub executor: ExecutorConfig,
    /// Recurring scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Task worker settings.
    pub worker: WorkerConfig,
    /// Data directory for the ledger database.
    pub data_dir: Option<PathBuf>,
}

/// Budget ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Reserve floor no debit may cross, in micro-units.
    pub min_reserve_micro: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_reserve_micro: 1_000_000,
        }
    }
}

/// Skill executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout for skills that do not declare their own.
    pub default_timeout_ms: u64,
    /// What happens to a unit of work that outlives its timeout.
    pub timeout_policy: TimeoutPolicy,
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            timeout_policy: TimeoutPolicy::Cancel,
        }
    }
}

/// Recurring scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Strategy used when a requested name is unknown.
    pub default_strategy: String,
    /// Upper bound on any strategy's startup jitter.
    pub global_jitter_cap_ms: u64,
    /// Repeat interval of the per-agent metrics entry.
    pub metrics_interval_ms: u64,
    /// Queue holding primary task entries.
    pub primary_queue: String,
    /// Queue holding metrics entries.
    pub metrics_queue: String,
    /// Extra or overriding strategies, merged over the built-in table.
    pub strategies: BTreeMap<String, ScheduleConfig>,
}

impl SchedulerConfig {
    pub fn global_jitter_cap(&self) -> Duration {
        Duration::from_millis(self.global_jitter_cap_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Built-in strategies with configured ones layered on top.
    pub fn resolved_strategies(&self) -> BTreeMap<String, ScheduleConfig> {
        let mut strategies = builtin_strategies();
        strategies.extend(
            self.strategies
                .iter()
                .map(|(name, config)| (name.clone(), config.clone())),
        );
        strategies
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_strategy: DEFAULT_STRATEGY.to_string(),
            global_jitter_cap_ms: 5 * 60 * 1000,
            metrics_interval_ms: 60 * 60 * 1000,
            primary_queue: "agent-tasks".to_string(),
            metrics_queue: "agent-metrics".to_string(),
            strategies: BTreeMap::new(),
        }
    }
}

/// Task worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Skill run for primary task jobs.
    pub primary_skill: String,
    /// Skill run for metrics jobs.
    pub metrics_skill: String,
    /// Known cost per skill id in micro-units. Unlisted skills are free.
    pub skill_costs: BTreeMap<String, u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            primary_skill: "primary_task".to_string(),
            metrics_skill: "collect_metrics".to_string(),
            skill_costs: BTreeMap::new(),
        }
    }
}

impl AutonomyConfig {
    /// Load config from the default location, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, or defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: AutonomyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(config_dir.join("autonomy").join("config.toml"))
    }

    /// Data directory, configured or platform default.
    pub fn data_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.data_dir {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Config("could not determine data directory".into()))?;
        Ok(data_dir.join("autonomy"))
    }

    /// Path of the SQLite ledger database.
    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_path()?.join("ledger.db"))
    }

    /// Reject configurations the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.default_timeout_ms == 0 {
            return Err(Error::Config("executor.default_timeout_ms must be > 0".into()));
        }
        if self.scheduler.metrics_interval_ms == 0 {
            return Err(Error::Config("scheduler.metrics_interval_ms must be > 0".into()));
        }
        if self.scheduler.primary_queue == self.scheduler.metrics_queue {
            return Err(Error::Config(
                "scheduler.primary_queue and scheduler.metrics_queue must differ".into(),
            ));
        }
        let strategies = self.scheduler.resolved_strategies();
        if !strategies.contains_key(&self.scheduler.default_strategy) {
            return Err(Error::Config(format!(
                "default strategy {:?} is not defined",
                self.scheduler.default_strategy
            )));
        }
        if let Some((name, _)) = strategies.iter().find(|(_, s)| s.interval.is_zero()) {
            return Err(Error::Config(format!("strategy {name:?} has a zero interval")));
        }
        Ok(())
    }

    /// Set the reserve floor.
    pub fn with_min_reserve(mut self, micro: u64) -> Self {
        self.ledger.min_reserve_micro = micro;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
