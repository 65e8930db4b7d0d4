//! Error types for the budget ledger, durable stores, and recurring queues.

use crate::types::AgentId;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for operations that span components.
#[derive(Debug, Error)]
pub enum Error {
    /// Budget ledger declined or failed an operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Durable balance store failed outside of a ledger operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Scheduling failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Configuration file could not be read or written.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML for this schema.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration is structurally valid but unusable.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Errors reported by the budget ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The debit would take the balance below the reserve floor.
    #[error(
        "insufficient budget for {agent_id}: cost {cost}, balance {balance}, reserve {min_reserve}"
    )]
    InsufficientBudget {
        agent_id: AgentId,
        cost: u64,
        balance: u64,
        min_reserve: u64,
    },

    /// The durable write failed; the cached balance was rolled back.
    #[error("persistence failure, debit rolled back: {0}")]
    PersistenceFailure(#[source] StoreError),

    /// The durable store could not be read.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[source] StoreError),
}

impl LedgerError {
    /// Whether the caller may simply skip or defer the operation.
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientBudget { .. } | LedgerError::PersistenceFailure(_)
        )
    }
}

/// Errors raised by a durable balance store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected.
    #[error("store write failed: {0}")]
    Write(String),

    /// SQLite backend error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors raised by a recurring-job queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue connection is closed.
    #[error("queue {0} is closed")]
    Closed(String),

    /// The queue refused the request.
    #[error("queue rejected request: {0}")]
    Rejected(String),

    /// Any other backend failure.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Errors raised by the recurring scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A queue call failed and was propagated unchanged.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// One or more recurring entries could not be removed.
    #[error("failed to tear down schedule for {agent_id}: {}", join_errors(.errors))]
    Teardown {
        agent_id: AgentId,
        errors: Vec<QueueError>,
    },

    /// One or both queue connections failed to close.
    #[error("queue shutdown failed: {}", join_errors(.0))]
    Shutdown(Vec<QueueError>),
}

fn join_errors(errors: &[QueueError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
