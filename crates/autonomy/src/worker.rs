//! Task worker: the budget check/debit boundary around skill execution.
//!
//! For each dispatched job the worker opens an agent session (loads the
//! budget), checks the configured cost against the reserve floor, runs the
//! skill through the executor, debits on success, and closes the session
//! (evicts the cached balance). Sessions for one agent run one at a time.

use crate::budget::BudgetLedger;
use crate::config::WorkerConfig;
use crate::executor::{BoundedExecutor, ExecutionResult, SkillContext};
use crate::locks::KeyedMutex;
use crate::scheduler::{JobKind, JobPayload};
use crate::types::AgentId;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a job was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The payload is not a [`JobPayload`].
    InvalidPayload { error: String },
    /// The agent's balance could not be read.
    LedgerUnavailable { error: String },
    /// The balance does not cover the cost plus the reserve floor.
    InsufficientBudget { cost: u64, balance: u64 },
}

/// Result of handling one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Nothing ran and nothing was charged.
    Skipped(SkipReason),
    /// The skill ran. `charged` is zero unless it succeeded with a known cost.
    Executed {
        result: ExecutionResult,
        charged: u64,
        balance: u64,
    },
    /// The skill succeeded but the debit failed; the work went unpaid.
    Unbilled { result: ExecutionResult, error: String },
}

impl TaskOutcome {
    /// Whether the skill ran and reported success.
    pub fn succeeded(&self) -> bool {
        match self {
            TaskOutcome::Executed { result, .. } | TaskOutcome::Unbilled { result, .. } => {
                result.success
            }
            TaskOutcome::Skipped(_) => false,
        }
    }
}

/// Runs dispatched jobs against the ledger and executor.
pub struct TaskWorker {
    ledger: Arc<BudgetLedger>,
    executor: Arc<BoundedExecutor>,
    config: WorkerConfig,
    sessions: KeyedMutex<AgentId>,
}

impl TaskWorker {
    pub fn new(ledger: Arc<BudgetLedger>, executor: Arc<BoundedExecutor>, config: WorkerConfig) -> Self {
        Self {
            ledger,
            executor,
            config,
            sessions: KeyedMutex::new(),
        }
    }

    /// Skill id run for a job kind.
    pub fn skill_for(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Primary => &self.config.primary_skill,
            JobKind::Metrics => &self.config.metrics_skill,
        }
    }

    /// Configured cost of a skill; unlisted skills are free.
    pub fn cost_of(&self, skill_id: &str) -> u64 {
        self.config.skill_costs.get(skill_id).copied().unwrap_or(0)
    }

    /// Parse a raw queue payload and handle it.
    pub async fn handle_payload(&self, operation_id: &str, payload: &Value) -> TaskOutcome {
        match serde_json::from_value::<JobPayload>(payload.clone()) {
            Ok(job) => self.handle(operation_id, &job).await,
            Err(err) => {
                warn!(operation_id, error = %err, "Rejected malformed job payload");
                TaskOutcome::Skipped(SkipReason::InvalidPayload {
                    error: err.to_string(),
                })
            }
        }
    }

    /// Handle one job inside an agent session.
    pub async fn handle(&self, operation_id: &str, job: &JobPayload) -> TaskOutcome {
        let agent_id = &job.agent_id;
        let session = self.sessions.lock(agent_id).await;
        let outcome = self.run(operation_id, job).await;
        self.ledger.evict(agent_id);
        drop(session);
        self.sessions.prune(agent_id);
        outcome
    }

    async fn run(&self, operation_id: &str, job: &JobPayload) -> TaskOutcome {
        let agent_id = &job.agent_id;
        let skill_id = self.skill_for(job.kind);
        let cost = self.cost_of(skill_id);

        if let Err(err) = self.ledger.load(agent_id).await {
            return TaskOutcome::Skipped(SkipReason::LedgerUnavailable {
                error: err.to_string(),
            });
        }

        if cost > 0 && !self.ledger.can_afford(agent_id, cost) {
            let balance = self.ledger.cached_balance(agent_id);
            info!(
                agent_id = %agent_id,
                skill_id,
                cost,
                balance,
                "Skipping job, budget exhausted"
            );
            return TaskOutcome::Skipped(SkipReason::InsufficientBudget { cost, balance });
        }

        let params = serde_json::to_value(job).unwrap_or(Value::Null);
        let result = self
            .executor
            .execute(skill_id, SkillContext::new(agent_id.clone(), params))
            .await;

        if !result.success || cost == 0 {
            let balance = self.ledger.cached_balance(agent_id);
            return TaskOutcome::Executed {
                result,
                charged: 0,
                balance,
            };
        }

        match self.ledger.debit(agent_id, operation_id, cost).await {
            Ok(balance) => TaskOutcome::Executed {
                result,
                charged: cost,
                balance,
            },
            Err(err) => {
                warn!(
                    agent_id = %agent_id,
                    skill_id,
                    operation_id,
                    error = %err,
                    "Skill succeeded but could not be billed"
                );
                TaskOutcome::Unbilled {
                    result,
                    error: err.to_string(),
                }
            }
        }
    }
}
