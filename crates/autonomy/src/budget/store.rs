//! Durable balance store contract and an in-memory implementation.

use crate::error::StoreError;
use crate::types::{AgentId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Append-only audit entry written for every successful debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Agent that paid.
    pub agent_id: AgentId,
    /// Operation the payment was for.
    pub operation_id: String,
    /// Amount debited in micro-units.
    pub cost: u64,
    /// Balance before the debit.
    pub balance_before: u64,
    /// Balance after the debit.
    pub balance_after: u64,
    /// When the debit was made.
    pub timestamp: Timestamp,
}

impl DeductionRecord {
    /// Build a record for a debit of `cost` against `balance_before`.
    ///
    /// Callers check affordability first; the subtraction saturates rather
    /// than wrapping if they do not.
    pub fn new(
        agent_id: AgentId,
        operation_id: impl Into<String>,
        cost: u64,
        balance_before: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            operation_id: operation_id.into(),
            cost,
            balance_before,
            balance_after: balance_before.saturating_sub(cost),
            timestamp: Timestamp::now(),
        }
    }
}

/// Durable storage for agent balances and the deduction log.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Read the durable balance. Unknown agents have a balance of zero.
    async fn get_balance(&self, agent_id: &AgentId) -> Result<u64, StoreError>;

    /// Overwrite the durable balance.
    async fn set_balance(&self, agent_id: &AgentId, balance: u64) -> Result<(), StoreError>;

    /// Append a deduction record on its own.
    async fn record_deduction(&self, record: &DeductionRecord) -> Result<(), StoreError>;

    /// Persist `record.balance_after` and append `record` as one write.
    ///
    /// Either both become visible or neither does.
    async fn commit_debit(&self, record: &DeductionRecord) -> Result<(), StoreError>;

    /// Most recent deductions for an agent, newest first.
    async fn deductions(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<DeductionRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<AgentId, u64>,
    deductions: Vec<DeductionRecord>,
}

/// Process-local balance store.
///
/// Reads and writes can be made to fail on demand, and writes can be slowed
/// down, so callers can exercise rollback and interleaving paths.
#[derive(Default)]
pub struct MemoryBalanceStore {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryBalanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with balances.
    pub fn with_balances(balances: impl IntoIterator<Item = (AgentId, u64)>) -> Self {
        let store = Self::new();
        store.lock().balances.extend(balances);
        store
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every write before applying it.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Durable balance without going through the async trait.
    pub fn balance_of(&self, agent_id: &AgentId) -> u64 {
        self.lock().balances.get(agent_id).copied().unwrap_or(0)
    }

    /// Every record written so far, oldest first.
    pub fn all_deductions(&self) -> Vec<DeductionRecord> {
        self.lock().deductions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store reads disabled".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        let delay = *self
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("memory store writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get_balance(&self, agent_id: &AgentId) -> Result<u64, StoreError> {
        self.check_read()?;
        Ok(self.balance_of(agent_id))
    }

    async fn set_balance(&self, agent_id: &AgentId, balance: u64) -> Result<(), StoreError> {
        self.before_write().await?;
        self.lock().balances.insert(agent_id.clone(), balance);
        Ok(())
    }

    async fn record_deduction(&self, record: &DeductionRecord) -> Result<(), StoreError> {
        self.before_write().await?;
        self.lock().deductions.push(record.clone());
        Ok(())
    }

    async fn commit_debit(&self, record: &DeductionRecord) -> Result<(), StoreError> {
        self.before_write().await?;
        let mut state = self.lock();
        state
            .balances
            .insert(record.agent_id.clone(), record.balance_after);
        state.deductions.push(record.clone());
        Ok(())
    }

    async fn deductions(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<DeductionRecord>, StoreError> {
        self.check_read()?;
        Ok(self
            .lock()
            .deductions
            .iter()
            .rev()
            .filter(|record| &record.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_agent_has_zero_balance() {
        let store = MemoryBalanceStore::new();
        assert_eq!(store.get_balance(&AgentId::from("nobody")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_debit_writes_balance_and_record_together() {
        let agent = AgentId::from("a1");
        let store = MemoryBalanceStore::with_balances([(agent.clone(), 100)]);
        let record = DeductionRecord::new(agent.clone(), "op", 30, 100);

        store.commit_debit(&record).await.unwrap();

        assert_eq!(store.balance_of(&agent), 70);
        assert_eq!(store.all_deductions(), vec![record]);
    }

    #[tokio::test]
    async fn failed_commit_changes_nothing() {
        let agent = AgentId::from("a1");
        let store = MemoryBalanceStore::with_balances([(agent.clone(), 100)]);
        store.fail_writes(true);

        let record = DeductionRecord::new(agent.clone(), "op", 30, 100);
        assert!(matches!(
            store.commit_debit(&record).await,
            Err(StoreError::Write(_))
        ));
        assert_eq!(store.balance_of(&agent), 100);
        assert!(store.all_deductions().is_empty());
    }

    #[tokio::test]
    async fn deductions_are_newest_first_and_filtered() {
        let a = AgentId::from("a");
        let b = AgentId::from("b");
        let store = MemoryBalanceStore::new();
        store
            .record_deduction(&DeductionRecord::new(a.clone(), "first", 1, 10))
            .await
            .unwrap();
        store
            .record_deduction(&DeductionRecord::new(b.clone(), "other", 1, 10))
            .await
            .unwrap();
        store
            .record_deduction(&DeductionRecord::new(a.clone(), "second", 1, 9))
            .await
            .unwrap();

        let ops: Vec<_> = store
            .deductions(&a, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.operation_id)
            .collect();
        assert_eq!(ops, vec!["second".to_string(), "first".to_string()]);
        assert_eq!(store.deductions(&a, 1).await.unwrap().len(), 1);
    }
}
