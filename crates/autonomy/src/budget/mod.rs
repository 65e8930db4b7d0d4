//! Budget ledger: per-agent spendable balances with a hard reserve floor.
//!
//! Balances are loaded from a [`BalanceStore`] into an in-memory cache at the
//! start of an agent session and mutated only through [`BudgetLedger::debit`].
//! Debits are write-through: the cache is updated optimistically, then the new
//! balance and its [`DeductionRecord`] are committed durably in one write. A
//! failed commit rolls the cache back.
//!
//! Debits for one agent are serialized through a per-agent mutex, so two
//! concurrent debits can never both observe the pre-debit balance. Debits for
//! different agents never contend.

mod sqlite;
mod store;

pub use sqlite::SqliteBalanceStore;
pub use store::{BalanceStore, DeductionRecord, MemoryBalanceStore};

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::locks::KeyedMutex;
use crate::types::AgentId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Single source of truth for whether an agent can afford an operation.
pub struct BudgetLedger {
    store: Arc<dyn BalanceStore>,
    min_reserve: u64,
    cache: RwLock<HashMap<AgentId, u64>>,
    locks: KeyedMutex<AgentId>,
}

impl BudgetLedger {
    /// Create a ledger over `store` that never lets a balance drop below
    /// `min_reserve` micro-units.
    pub fn new(store: Arc<dyn BalanceStore>, min_reserve: u64) -> Self {
        Self {
            store,
            min_reserve,
            cache: RwLock::new(HashMap::new()),
            locks: KeyedMutex::new(),
        }
    }

    /// Create a ledger using the configured reserve floor.
    pub fn from_config(store: Arc<dyn BalanceStore>, config: &LedgerConfig) -> Self {
        Self::new(store, config.min_reserve_micro)
    }

    /// The reserve floor in micro-units.
    pub fn min_reserve(&self) -> u64 {
        self.min_reserve
    }

    /// Load the durable balance into the cache, replacing any cached value.
    ///
    /// On failure the cached entry is dropped so no debit can run against a
    /// stale balance.
    pub async fn load(&self, agent_id: &AgentId) -> Result<u64, LedgerError> {
        let _guard = self.locks.lock(agent_id).await;
        match self.store.get_balance(agent_id).await {
            Ok(balance) => {
                self.write_cache().insert(agent_id.clone(), balance);
                debug!(agent_id = %agent_id, balance, "Loaded budget");
                Ok(balance)
            }
            Err(err) => {
                self.write_cache().remove(agent_id);
                warn!(agent_id = %agent_id, error = %err, "Budget load failed");
                Err(LedgerError::PersistenceUnavailable(err))
            }
        }
    }

    /// Cached balance, or zero if the agent was never loaded.
    pub fn cached_balance(&self, agent_id: &AgentId) -> u64 {
        self.read_cache().get(agent_id).copied().unwrap_or(0)
    }

    /// True iff the cached balance covers `cost` plus the reserve floor.
    pub fn can_afford(&self, agent_id: &AgentId, cost: u64) -> bool {
        affordable(self.cached_balance(agent_id), cost, self.min_reserve)
    }

    /// Debit `cost` for `operation_id`, returning the new balance.
    ///
    /// The reserve check runs before anything is touched. A failed durable
    /// write restores the pre-debit cached balance and reports
    /// [`LedgerError::PersistenceFailure`]; the operation counts as unpaid.
    pub async fn debit(
        &self,
        agent_id: &AgentId,
        operation_id: &str,
        cost: u64,
    ) -> Result<u64, LedgerError> {
        let _guard = self.locks.lock(agent_id).await;

        let before = self.cached_balance(agent_id);
        if !affordable(before, cost, self.min_reserve) {
            warn!(
                agent_id = %agent_id,
                operation_id,
                cost,
                balance = before,
                min_reserve = self.min_reserve,
                "Debit declined by reserve floor"
            );
            return Err(LedgerError::InsufficientBudget {
                agent_id: agent_id.clone(),
                cost,
                balance: before,
                min_reserve: self.min_reserve,
            });
        }

        let record = DeductionRecord::new(agent_id.clone(), operation_id, cost, before);
        let after = record.balance_after;
        self.write_cache().insert(agent_id.clone(), after);

        match self.store.commit_debit(&record).await {
            Ok(()) => {
                debug!(
                    agent_id = %agent_id,
                    operation_id,
                    cost,
                    balance_before = before,
                    balance_after = after,
                    "Debit committed"
                );
                Ok(after)
            }
            Err(err) => {
                // An eviction during the write must not resurrect the entry.
                if let Some(balance) = self.write_cache().get_mut(agent_id) {
                    *balance = before;
                }
                warn!(
                    agent_id = %agent_id,
                    operation_id,
                    cost,
                    error = %err,
                    "Debit commit failed, rolled back"
                );
                Err(LedgerError::PersistenceFailure(err))
            }
        }
    }

    /// Add `amount` to the durable balance and refresh the cache.
    pub async fn fund(&self, agent_id: &AgentId, amount: u64) -> Result<u64, LedgerError> {
        let _guard = self.locks.lock(agent_id).await;
        let current = self
            .store
            .get_balance(agent_id)
            .await
            .map_err(LedgerError::PersistenceUnavailable)?;
        let balance = current.saturating_add(amount);
        self.store
            .set_balance(agent_id, balance)
            .await
            .map_err(LedgerError::PersistenceFailure)?;
        self.write_cache().insert(agent_id.clone(), balance);
        debug!(agent_id = %agent_id, amount, balance, "Budget funded");
        Ok(balance)
    }

    /// Recent deduction records for reconciliation, newest first.
    pub async fn history(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<DeductionRecord>, LedgerError> {
        self.store
            .deductions(agent_id, limit)
            .await
            .map_err(LedgerError::PersistenceUnavailable)
    }

    /// Drop the agent's cached balance. The durable record is untouched.
    pub fn evict(&self, agent_id: &AgentId) {
        if self.write_cache().remove(agent_id).is_some() {
            debug!(agent_id = %agent_id, "Evicted budget");
        }
        self.locks.prune(agent_id);
    }

    /// Agents currently held in the cache.
    pub fn loaded_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<_> = self.read_cache().keys().cloned().collect();
        agents.sort();
        agents
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AgentId, u64>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<AgentId, u64>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn affordable(balance: u64, cost: u64, min_reserve: u64) -> bool {
    cost.checked_add(min_reserve)
        .is_some_and(|needed| balance >= needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    const MIN_RESERVE: u64 = 1_000_000;

    fn ledger_with(agent: &AgentId, balance: u64) -> (Arc<MemoryBalanceStore>, BudgetLedger) {
        let store = Arc::new(MemoryBalanceStore::with_balances([(agent.clone(), balance)]));
        let ledger = BudgetLedger::new(store.clone(), MIN_RESERVE);
        (store, ledger)
    }

    #[tokio::test]
    async fn concrete_debit_scenario() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 50_000_000);
        assert_eq!(ledger.load(&agent).await.unwrap(), 50_000_000);

        assert!(ledger.can_afford(&agent, 10_000_000));
        assert_eq!(ledger.debit(&agent, "op1", 10_000_000).await.unwrap(), 40_000_000);

        let records = store.all_deductions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_id, "op1");
        assert_eq!(records[0].balance_before, 50_000_000);
        assert_eq!(records[0].balance_after, 40_000_000);

        let err = ledger.debit(&agent, "op2", 40_000_000).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBudget { balance: 40_000_000, .. }));
        assert_eq!(ledger.cached_balance(&agent), 40_000_000);
        assert_eq!(store.balance_of(&agent), 40_000_000);
        assert_eq!(store.all_deductions().len(), 1);
    }

    #[tokio::test]
    async fn debit_succeeds_iff_reserve_is_preserved() {
        let cases = [
            (10_000_000u64, 9_000_000u64, true),
            (10_000_000, 9_000_001, false),
            (1_000_000, 0, true),
            (999_999, 0, false),
            (0, 1, false),
            (u64::MAX, u64::MAX, false),
        ];
        for (balance, cost, expected) in cases {
            let agent = AgentId::from("agent");
            let (_store, ledger) = ledger_with(&agent, balance);
            ledger.load(&agent).await.unwrap();

            assert_eq!(ledger.can_afford(&agent, cost), expected, "can_afford({balance}, {cost})");
            let result = ledger.debit(&agent, "op", cost).await;
            assert_eq!(result.is_ok(), expected, "debit({balance}, {cost})");
            if expected {
                assert_eq!(result.unwrap(), balance - cost);
            } else {
                assert_eq!(ledger.cached_balance(&agent), balance);
            }
        }
    }

    #[tokio::test]
    async fn unloaded_agent_reads_zero_and_cannot_debit() {
        let agent = AgentId::from("agent");
        let (_store, ledger) = ledger_with(&agent, 50_000_000);
        assert_eq!(ledger.cached_balance(&agent), 0);
        assert!(!ledger.can_afford(&agent, 1));
        assert!(matches!(
            ledger.debit(&agent, "op", 1).await,
            Err(LedgerError::InsufficientBudget { balance: 0, .. })
        ));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_cache() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 50_000_000);
        ledger.load(&agent).await.unwrap();
        store.fail_writes(true);

        let err = ledger.debit(&agent, "op1", 10_000_000).await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailure(StoreError::Write(_))));
        assert!(err.is_declined());
        assert_eq!(ledger.cached_balance(&agent), 50_000_000);
        assert_eq!(store.balance_of(&agent), 50_000_000);
        assert!(store.all_deductions().is_empty());
    }

    #[tokio::test]
    async fn failed_load_drops_stale_cache() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 50_000_000);
        ledger.load(&agent).await.unwrap();
        store.fail_reads(true);

        assert!(matches!(
            ledger.load(&agent).await,
            Err(LedgerError::PersistenceUnavailable(_))
        ));
        assert_eq!(ledger.cached_balance(&agent), 0);
        assert!(!ledger.can_afford(&agent, 1));
    }

    #[tokio::test]
    async fn load_overwrites_cached_value() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 5_000_000);
        ledger.load(&agent).await.unwrap();
        store.set_balance(&agent, 7_000_000).await.unwrap();
        assert_eq!(ledger.cached_balance(&agent), 5_000_000);
        assert_eq!(ledger.load(&agent).await.unwrap(), 7_000_000);
        assert_eq!(ledger.cached_balance(&agent), 7_000_000);
    }

    #[tokio::test]
    async fn evict_is_idempotent_and_keeps_durable_balance() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 5_000_000);
        ledger.load(&agent).await.unwrap();
        assert_eq!(ledger.loaded_agents(), vec![agent.clone()]);

        ledger.evict(&agent);
        ledger.evict(&agent);
        assert_eq!(ledger.cached_balance(&agent), 0);
        assert!(ledger.loaded_agents().is_empty());
        assert_eq!(store.balance_of(&agent), 5_000_000);
    }

    #[tokio::test]
    async fn fund_tops_up_store_and_cache() {
        let agent = AgentId::from("agent");
        let (store, ledger) = ledger_with(&agent, 1_000_000);
        assert_eq!(ledger.fund(&agent, 2_500_000).await.unwrap(), 3_500_000);
        assert_eq!(store.balance_of(&agent), 3_500_000);
        assert_eq!(ledger.cached_balance(&agent), 3_500_000);
    }

    #[tokio::test]
    async fn history_returns_newest_first() {
        let agent = AgentId::from("agent");
        let (_store, ledger) = ledger_with(&agent, 10_000_000);
        ledger.load(&agent).await.unwrap();
        ledger.debit(&agent, "a", 1_000_000).await.unwrap();
        ledger.debit(&agent, "b", 1_000_000).await.unwrap();

        let ops: Vec<_> = ledger
            .history(&agent, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.operation_id)
            .collect();
        assert_eq!(ops, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_never_double_spend() {
        let agent = AgentId::from("agent");
        let balance = 10_500_000;
        let cost = 1_000_000;
        let (store, ledger) = ledger_with(&agent, balance);
        store.set_write_delay(Some(Duration::from_millis(2)));
        let ledger = Arc::new(ledger);
        ledger.load(&agent).await.unwrap();

        // floor((10.5 - 1.0) / 1.0) = 9 affordable debits
        let expected_successes = 9;
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let agent = agent.clone();
            handles.push(tokio::spawn(async move {
                ledger.debit(&agent, &format!("op{i}"), cost).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, expected_successes);
        let final_balance = balance - expected_successes * cost;
        assert_eq!(ledger.cached_balance(&agent), final_balance);
        assert_eq!(store.balance_of(&agent), final_balance);
        assert_eq!(store.all_deductions().len() as u64, expected_successes);
    }

    /// Store whose writes for one agent block until released.
    struct GatedStore {
        inner: MemoryBalanceStore,
        gated: AgentId,
        gate: Notify,
    }

    #[async_trait]
    impl BalanceStore for GatedStore {
        async fn get_balance(&self, agent_id: &AgentId) -> Result<u64, StoreError> {
            self.inner.get_balance(agent_id).await
        }

        async fn set_balance(&self, agent_id: &AgentId, balance: u64) -> Result<(), StoreError> {
            self.inner.set_balance(agent_id, balance).await
        }

        async fn record_deduction(&self, record: &DeductionRecord) -> Result<(), StoreError> {
            self.inner.record_deduction(record).await
        }

        async fn commit_debit(&self, record: &DeductionRecord) -> Result<(), StoreError> {
            if record.agent_id == self.gated {
                self.gate.notified().await;
            }
            self.inner.commit_debit(record).await
        }

        async fn deductions(
            &self,
            agent_id: &AgentId,
            limit: usize,
        ) -> Result<Vec<DeductionRecord>, StoreError> {
            self.inner.deductions(agent_id, limit).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn debits_for_different_agents_do_not_contend() {
        let slow = AgentId::from("slow");
        let fast = AgentId::from("fast");
        let store = Arc::new(GatedStore {
            inner: MemoryBalanceStore::with_balances([
                (slow.clone(), 10_000_000),
                (fast.clone(), 10_000_000),
            ]),
            gated: slow.clone(),
            gate: Notify::new(),
        });
        let ledger = Arc::new(BudgetLedger::new(store.clone(), MIN_RESERVE));
        ledger.load(&slow).await.unwrap();
        ledger.load(&fast).await.unwrap();

        let blocked = {
            let ledger = ledger.clone();
            let slow = slow.clone();
            tokio::spawn(async move { ledger.debit(&slow, "op", 1_000_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast_result =
            tokio::time::timeout(Duration::from_secs(1), ledger.debit(&fast, "op", 1_000_000))
                .await
                .expect("fast agent must not wait on slow agent");
        assert_eq!(fast_result.unwrap(), 9_000_000);

        store.gate.notify_one();
        assert_eq!(blocked.await.unwrap().unwrap(), 9_000_000);
    }
}
