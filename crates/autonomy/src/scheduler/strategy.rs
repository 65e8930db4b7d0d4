//! Named cadence strategies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Cadence of an agent's primary task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Repeat interval of the primary entry.
    #[serde(rename = "interval_ms", with = "crate::config::duration_ms")]
    pub interval: Duration,
    /// Informational runs per day.
    pub target_runs_per_period: u32,
    /// Upper bound on the first firing's random delay.
    #[serde(rename = "max_jitter_ms", with = "crate::config::duration_ms")]
    pub max_jitter: Duration,
}

impl ScheduleConfig {
    pub fn new(interval: Duration, target_runs_per_period: u32, max_jitter: Duration) -> Self {
        Self {
            interval,
            target_runs_per_period,
            max_jitter,
        }
    }

    /// Draw an initial delay uniformly from `[0, min(max_jitter, cap)]`.
    pub fn initial_delay(&self, cap: Duration) -> Duration {
        let bound = self.max_jitter.min(cap).as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

impl Default for ScheduleConfig {
    /// The `balanced` cadence.
    fn default() -> Self {
        Self::new(4 * HOUR, 6, 15 * MINUTE)
    }
}

/// Strategy used when none is configured.
pub const DEFAULT_STRATEGY: &str = "balanced";

/// The strategy table shipped with the crate.
pub fn builtin_strategies() -> BTreeMap<String, ScheduleConfig> {
    BTreeMap::from([
        (
            "aggressive".to_string(),
            ScheduleConfig::new(HOUR, 24, 5 * MINUTE),
        ),
        (DEFAULT_STRATEGY.to_string(), ScheduleConfig::default()),
        (
            "conservative".to_string(),
            ScheduleConfig::new(12 * HOUR, 2, 30 * MINUTE),
        ),
        (
            "lead_hunter".to_string(),
            ScheduleConfig::new(2 * HOUR, 12, 10 * MINUTE),
        ),
    ])
}
