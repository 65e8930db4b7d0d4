//! Recurring scheduler.
//!
//! Keeps, per agent, exactly one recurring primary-task entry and one
//! recurring metrics entry in two external queues. Entries are keyed
//! deterministically (`primary-<agent>`, `metrics-<agent>`) and every
//! `schedule_agent` call tears down whatever exists under those keys before
//! creating anything, so re-scheduling never leaves duplicates behind.
//!
//! The primary entry's first firing is delayed by a random jitter so agents
//! sharing a cadence do not fire in lockstep.

mod memory;
mod queue;
mod strategy;

pub use memory::{DispatchedJob, InMemoryQueue};
pub use queue::{QueueCounts, RecurringEntry, RecurringOptions, RecurringQueue};
pub use strategy::{DEFAULT_STRATEGY, ScheduleConfig, builtin_strategies};

use crate::config::SchedulerConfig;
use crate::error::{QueueError, SchedulerError};
use crate::locks::KeyedMutex;
use crate::types::{AgentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which of an agent's two recurring entries a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Primary,
    Metrics,
}

/// Payload carried by every recurring entry the scheduler creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub agent_id: AgentId,
    pub kind: JobKind,
    /// Strategy that produced the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// Deterministic key of an agent's primary entry.
pub fn primary_key(agent_id: &AgentId) -> String {
    format!("primary-{agent_id}")
}

/// Deterministic key of an agent's metrics entry.
pub fn metrics_key(agent_id: &AgentId) -> String {
    format!("metrics-{agent_id}")
}

/// What is currently scheduled for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub agent_id: AgentId,
    /// Strategy actually applied, after fallback.
    pub strategy: String,
    pub primary_job: RecurringEntry,
    pub metrics_job: RecurringEntry,
    /// Jitter applied to the primary entry's first firing.
    pub initial_delay: Duration,
    pub scheduled_at: Timestamp,
}

/// Creates, replaces, and removes per-agent recurring entries.
pub struct RecurringScheduler {
    primary: Arc<dyn RecurringQueue>,
    metrics: Arc<dyn RecurringQueue>,
    strategies: BTreeMap<String, ScheduleConfig>,
    default_strategy: String,
    fallback: ScheduleConfig,
    jitter_cap: Duration,
    metrics_interval: Duration,
    active: RwLock<HashMap<AgentId, ScheduleEntry>>,
    locks: KeyedMutex<AgentId>,
}

impl RecurringScheduler {
    pub fn new(
        primary: Arc<dyn RecurringQueue>,
        metrics: Arc<dyn RecurringQueue>,
        config: &SchedulerConfig,
    ) -> Self {
        let strategies = config.resolved_strategies();
        let fallback = strategies
            .get(&config.default_strategy)
            .cloned()
            .unwrap_or_default();
        Self {
            primary,
            metrics,
            strategies,
            default_strategy: config.default_strategy.clone(),
            fallback,
            jitter_cap: config.global_jitter_cap(),
            metrics_interval: config.metrics_interval(),
            active: RwLock::new(HashMap::new()),
            locks: KeyedMutex::new(),
        }
    }

    /// Known strategies, built-in and configured.
    pub fn strategies(&self) -> &BTreeMap<String, ScheduleConfig> {
        &self.strategies
    }

    /// Resolve a strategy name, falling back to the default strategy.
    pub fn resolve_strategy(&self, name: &str) -> (&str, &ScheduleConfig) {
        match self.strategies.get_key_value(name) {
            Some((name, config)) => (name.as_str(), config),
            None => (self.default_strategy.as_str(), &self.fallback),
        }
    }

    /// Replace the agent's recurring entries with ones for `strategy`.
    ///
    /// Unknown strategy names fall back to the default. If either entry
    /// cannot be created the call fails, nothing is recorded, and a primary
    /// entry that was already created is removed again.
    pub async fn schedule_agent(
        &self,
        agent_id: &AgentId,
        strategy: &str,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let _guard = self.locks.lock(agent_id).await;
        self.teardown(agent_id).await?;

        let (strategy_name, config) = self.resolve_strategy(strategy);
        if strategy_name != strategy {
            warn!(
                agent_id = %agent_id,
                requested = strategy,
                applied = strategy_name,
                "Unknown strategy, using default"
            );
        }
        let initial_delay = config.initial_delay(self.jitter_cap);

        let primary_key = primary_key(agent_id);
        let primary_job = self
            .primary
            .add_recurring(
                &primary_key,
                payload(agent_id, JobKind::Primary, Some(strategy_name)),
                RecurringOptions {
                    interval: config.interval,
                    initial_delay,
                    dedupe_key: primary_key.clone(),
                },
            )
            .await?;

        let metrics_key = metrics_key(agent_id);
        let metrics_job = match self
            .metrics
            .add_recurring(
                &metrics_key,
                payload(agent_id, JobKind::Metrics, None),
                RecurringOptions {
                    interval: self.metrics_interval,
                    initial_delay: Duration::ZERO,
                    dedupe_key: metrics_key.clone(),
                },
            )
            .await
        {
            Ok(job) => job,
            Err(err) => {
                if let Err(cleanup) = remove_matching(self.primary.as_ref(), &primary_key).await {
                    warn!(
                        agent_id = %agent_id,
                        queue = self.primary.name(),
                        error = %cleanup,
                        "Failed to remove primary entry after metrics entry failed"
                    );
                }
                return Err(err.into());
            }
        };

        let entry = ScheduleEntry {
            agent_id: agent_id.clone(),
            strategy: strategy_name.to_string(),
            primary_job,
            metrics_job,
            initial_delay,
            scheduled_at: Timestamp::now(),
        };
        self.write_active().insert(agent_id.clone(), entry.clone());

        info!(
            agent_id = %agent_id,
            strategy = strategy_name,
            interval_ms = config.interval.as_millis() as u64,
            initial_delay_ms = initial_delay.as_millis() as u64,
            "Agent scheduled"
        );
        Ok(entry)
    }

    /// Remove the agent's recurring entries and forget its schedule.
    ///
    /// A no-op for agents with nothing scheduled. Every removal is attempted
    /// even if an earlier one fails; failures are reported together.
    pub async fn unschedule_agent(&self, agent_id: &AgentId) -> Result<(), SchedulerError> {
        let guard = self.locks.lock(agent_id).await;
        let result = self.teardown(agent_id).await;
        drop(guard);
        self.locks.prune(agent_id);
        result
    }

    /// Snapshot of every agent's schedule.
    pub fn active_schedules(&self) -> BTreeMap<AgentId, ScheduleEntry> {
        self.read_active()
            .iter()
            .map(|(agent, entry)| (agent.clone(), entry.clone()))
            .collect()
    }

    pub fn schedule_for(&self, agent_id: &AgentId) -> Option<ScheduleEntry> {
        self.read_active().get(agent_id).cloned()
    }

    /// Job counts per queue name.
    pub async fn queue_stats(&self) -> Result<BTreeMap<String, QueueCounts>, SchedulerError> {
        let mut stats = BTreeMap::new();
        for queue in [&self.primary, &self.metrics] {
            stats.insert(queue.name().to_string(), queue.counts().await?);
        }
        Ok(stats)
    }

    /// Close both queues, attempting each regardless of the other.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut errors = Vec::new();
        for queue in [&self.primary, &self.metrics] {
            if let Err(err) = queue.close().await {
                warn!(queue = queue.name(), error = %err, "Queue close failed");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            info!("Scheduler shut down");
            Ok(())
        } else {
            Err(SchedulerError::Shutdown(errors))
        }
    }

    async fn teardown(&self, agent_id: &AgentId) -> Result<(), SchedulerError> {
        let mut errors = Vec::new();
        let mut removed = 0;
        for (queue, key) in [
            (&self.primary, primary_key(agent_id)),
            (&self.metrics, metrics_key(agent_id)),
        ] {
            match remove_matching(queue.as_ref(), &key).await {
                Ok(count) => removed += count,
                Err(err) => {
                    warn!(
                        agent_id = %agent_id,
                        queue = queue.name(),
                        key = %key,
                        error = %err,
                        "Failed to remove recurring entry"
                    );
                    errors.push(err);
                }
            }
        }

        let was_active = self.write_active().remove(agent_id).is_some();
        if was_active || removed > 0 {
            info!(agent_id = %agent_id, removed, "Agent unscheduled");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Teardown {
                agent_id: agent_id.clone(),
                errors,
            })
        }
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AgentId, ScheduleEntry>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<AgentId, ScheduleEntry>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn payload(agent_id: &AgentId, kind: JobKind, strategy: Option<&str>) -> serde_json::Value {
    serde_json::json!(JobPayload {
        agent_id: agent_id.clone(),
        kind,
        strategy: strategy.map(str::to_string),
    })
}

/// Remove every entry in `queue` identified by `ident`, returning how many
/// were removed.
///
/// Queues with keyed removal are asked directly. Others are listed and each
/// entry whose key, id, or name equals `ident` is removed by its key; a
/// failed removal does not stop the rest.
async fn remove_matching(queue: &dyn RecurringQueue, ident: &str) -> Result<usize, QueueError> {
    if queue.supports_keyed_removal() {
        return Ok(usize::from(queue.remove_recurring_by_key(ident).await?));
    }

    let mut removed = 0;
    let mut first_error = None;
    for entry in queue.list_recurring().await? {
        if !entry.matches(ident) {
            continue;
        }
        match queue.remove_recurring_by_key(&entry.key).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => {
                debug!(queue = queue.name(), entry_id = %entry.id, error = %err, "Entry removal failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(removed),
    }
}
