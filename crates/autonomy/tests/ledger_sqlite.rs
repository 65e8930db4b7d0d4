//! Ledger behaviour over the SQLite store.

use autonomy::{
    AgentId, BalanceStore, BudgetLedger, LedgerError, RecurringScheduler, SchedulerConfig,
    InMemoryQueue, SqliteBalanceStore,
};
use std::sync::Arc;

const UNIT: u64 = 1_000_000;

#[tokio::test]
async fn debit_then_decline_against_the_reserve() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteBalanceStore::open(dir.path().join("ledger.db")).expect("open"));
    let agent = AgentId::from("agent");
    store.set_balance(&agent, 50 * UNIT).await.unwrap();

    let ledger = BudgetLedger::new(store.clone(), UNIT);
    ledger.load(&agent).await.unwrap();
    assert!(ledger.can_afford(&agent, 10 * UNIT));

    assert_eq!(ledger.debit(&agent, "op1", 10 * UNIT).await.unwrap(), 40 * UNIT);
    let err = ledger.debit(&agent, "op2", 40 * UNIT).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBudget { balance, .. } if balance == 40 * UNIT));
    assert_eq!(ledger.cached_balance(&agent), 40 * UNIT);

    let history = ledger.history(&agent, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation_id, "op1");
    assert_eq!(history[0].balance_before, 50 * UNIT);
    assert_eq!(history[0].balance_after, 40 * UNIT);

    // A new session sees the durable balance.
    ledger.evict(&agent);
    drop(ledger);
    let reopened = SqliteBalanceStore::open(dir.path().join("ledger.db")).expect("reopen");
    assert_eq!(reopened.get_balance(&agent).await.unwrap(), 40 * UNIT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_debits_spend_exactly_the_affordable_amount() {
    let store = Arc::new(SqliteBalanceStore::open_in_memory().expect("open"));
    let agent = AgentId::from("agent");
    // (B - reserve) / c = (25 - 1) / 3 = 8 affordable debits.
    store.set_balance(&agent, 25 * UNIT).await.unwrap();

    let ledger = Arc::new(BudgetLedger::new(store.clone(), UNIT));
    ledger.load(&agent).await.unwrap();

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let ledger = ledger.clone();
            let agent = agent.clone();
            tokio::spawn(async move { ledger.debit(&agent, &format!("op{i}"), 3 * UNIT).await })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 8);
    assert_eq!(ledger.cached_balance(&agent), UNIT);
    assert_eq!(store.get_balance(&agent).await.unwrap(), UNIT);
    assert_eq!(store.deductions(&agent, 100).await.unwrap().len(), 8);
}

#[tokio::test]
async fn unknown_strategy_schedules_with_the_default_cadence() {
    let config = SchedulerConfig::default();
    let scheduler = RecurringScheduler::new(
        Arc::new(InMemoryQueue::new("agent-tasks")),
        Arc::new(InMemoryQueue::new("agent-metrics")),
        &config,
    );

    let entry = scheduler
        .schedule_agent(&AgentId::from("a1"), "UnknownStrategy")
        .await
        .unwrap();
    let (_, default) = scheduler.resolve_strategy("balanced");
    assert_eq!(entry.strategy, "balanced");
    assert!(entry.initial_delay <= default.max_jitter.min(config.global_jitter_cap()));
}
