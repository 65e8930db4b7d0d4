//! Contract for an external recurring-job queue.

use crate::error::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Options for a recurring entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringOptions {
    /// Time between firings.
    pub interval: Duration,
    /// One-time delay before the first firing.
    pub initial_delay: Duration,
    /// Deterministic key the entry can be found and removed by.
    pub dedupe_key: String,
}

/// A recurring entry as the queue reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringEntry {
    /// Dedupe key supplied at creation.
    pub key: String,
    /// Queue-assigned id.
    pub id: String,
    /// Job name supplied at creation.
    pub name: String,
}

impl RecurringEntry {
    /// Whether the key, id, or name equals `ident`.
    pub fn matches(&self, ident: &str) -> bool {
        self.key == ident || self.id == ident || self.name == ident
    }
}

/// Job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// A queue that owns recurring job entries and dispatches their firings.
#[async_trait]
pub trait RecurringQueue: Send + Sync {
    /// Queue name, used in stats and logs.
    fn name(&self) -> &str;

    /// Create a recurring entry.
    async fn add_recurring(
        &self,
        job_name: &str,
        payload: Value,
        options: RecurringOptions,
    ) -> Result<RecurringEntry, QueueError>;

    /// Every recurring entry currently defined.
    async fn list_recurring(&self) -> Result<Vec<RecurringEntry>, QueueError>;

    /// Remove the entry with `key`. Returns whether one existed.
    async fn remove_recurring_by_key(&self, key: &str) -> Result<bool, QueueError>;

    /// Whether [`RecurringQueue::remove_recurring_by_key`] can be used
    /// directly with a dedupe key. Queues returning false are torn down by
    /// listing and matching instead.
    fn supports_keyed_removal(&self) -> bool {
        true
    }

    /// Current job counts.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Close the connection. Later calls fail with [`QueueError::Closed`].
    async fn close(&self) -> Result<(), QueueError>;
}
