//! Coordination core for autonomous agents running recurring, costed tasks.
//!
//! Three constraints hold for every agent at once:
//! - it never spends below its reserve floor ([`BudgetLedger`])
//! - no unit of work outlives its timeout ([`BoundedExecutor`])
//! - it keeps exactly one recurring primary and metrics entry
//!   ([`RecurringScheduler`])
//!
//! [`TaskWorker`] ties them together for each job the queue dispatches.

pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod locks;
pub mod scheduler;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use budget::{BalanceStore, BudgetLedger, DeductionRecord, MemoryBalanceStore, SqliteBalanceStore};
pub use config::{AutonomyConfig, ExecutorConfig, LedgerConfig, SchedulerConfig, WorkerConfig};
pub use error::{Error, LedgerError, QueueError, Result, SchedulerError, StoreError};
pub use executor::{
    BoundedExecutor, ExecutionResult, ExecutionStatus, Skill, SkillCategory, SkillContext,
    SkillDefinition, SkillOutput, TimeoutPolicy, skill_fn,
};
pub use scheduler::{
    DispatchedJob, InMemoryQueue, JobKind, JobPayload, QueueCounts, RecurringEntry,
    RecurringOptions, RecurringQueue, RecurringScheduler, ScheduleConfig, ScheduleEntry,
};
pub use types::{AgentId, MICROS_PER_UNIT, Timestamp, format_micro};
pub use worker::{SkipReason, TaskOutcome, TaskWorker};
