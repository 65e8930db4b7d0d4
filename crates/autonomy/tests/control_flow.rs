//! End-to-end tests: scheduler -> queue -> worker -> executor -> ledger.

use autonomy::{
    AgentId, AutonomyConfig, BalanceStore, BoundedExecutor, BudgetLedger, InMemoryQueue,
    RecurringQueue, RecurringScheduler, SkillCategory, SkillContext, SkillDefinition, SkillOutput,
    SqliteBalanceStore, TaskOutcome, TaskWorker, Timestamp, skill_fn,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const UNIT: u64 = 1_000_000;
const HOUR_MS: u64 = 60 * 60 * 1000;

struct System {
    tasks: Arc<InMemoryQueue>,
    metrics: Arc<InMemoryQueue>,
    scheduler: RecurringScheduler,
    worker: TaskWorker,
    store: Arc<SqliteBalanceStore>,
    runs: Arc<AtomicUsize>,
}

fn system(config: &AutonomyConfig, primary_timeout: Option<Duration>) -> System {
    let tasks = Arc::new(InMemoryQueue::new(config.scheduler.primary_queue.clone()));
    let metrics = Arc::new(InMemoryQueue::new(config.scheduler.metrics_queue.clone()));
    let scheduler = RecurringScheduler::new(tasks.clone(), metrics.clone(), &config.scheduler);

    let store = Arc::new(SqliteBalanceStore::open_in_memory().expect("open ledger"));
    let ledger = Arc::new(BudgetLedger::from_config(store.clone(), &config.ledger));
    let executor = Arc::new(BoundedExecutor::from_config(&config.executor));

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let mut primary = SkillDefinition::new(
        "primary_task",
        "Write a post",
        SkillCategory::ContentGeneration,
        skill_fn(move |ctx: SkillContext| {
            let counter = counter.clone();
            async move {
                let run = counter.fetch_add(1, Ordering::SeqCst);
                if run == 1 {
                    // Second cycle hangs past any timeout.
                    std::future::pending::<()>().await;
                }
                Ok(SkillOutput::success(json!({ "agent": ctx.agent_id, "run": run })))
            }
        }),
    );
    if let Some(timeout) = primary_timeout {
        primary = primary.with_timeout(timeout);
    }
    executor.register(primary);
    executor.register(SkillDefinition::new(
        "collect_metrics",
        "Collect metrics",
        SkillCategory::Analytics,
        skill_fn(|_ctx: SkillContext| async { Ok(SkillOutput::success(json!({ "followers": 7 }))) }),
    ));

    let worker = TaskWorker::new(ledger, executor, config.worker.clone());
    System {
        tasks,
        metrics,
        scheduler,
        worker,
        store,
        runs,
    }
}

fn config() -> AutonomyConfig {
    let mut config = AutonomyConfig::default();
    config.executor.default_timeout_ms = 200;
    config
        .worker
        .skill_costs
        .insert("primary_task".to_string(), 10 * UNIT);
    config
}

/// Dispatch everything due at `at` through the worker and settle the jobs.
async fn drain(system: &System, queue: &InMemoryQueue, at: Timestamp) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::new();
    for job in queue.poll_due(at) {
        let outcome = system.worker.handle_payload(&job.id, &job.payload).await;
        if outcome.succeeded() {
            queue.complete(&job.id);
        } else {
            queue.fail(&job.id, "unsuccessful");
        }
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test]
async fn recurring_cycles_spend_until_the_reserve_floor() {
    let config = config();
    let system = system(&config, None);
    let agent = AgentId::from("agent-1");
    system.store.set_balance(&agent, 35 * UNIT).await.unwrap();

    let entry = system
        .scheduler
        .schedule_agent(&agent, "aggressive")
        .await
        .unwrap();
    assert_eq!(entry.primary_job.key, "primary-agent-1");

    let start = Timestamp::now();
    let mut charged = Vec::new();
    let mut skipped = 0;
    for cycle in 1..=4u64 {
        // Cycle 2 hangs and times out; every other cycle completes.
        for outcome in drain(&system, &system.tasks, start.plus_millis(cycle * HOUR_MS)).await {
            match outcome {
                TaskOutcome::Executed { charged: c, .. } => charged.push(c),
                TaskOutcome::Skipped(_) => skipped += 1,
                TaskOutcome::Unbilled { error, .. } => panic!("unexpected unbilled run: {error}"),
            }
        }
    }

    // 35 units, 1 unit floor, 10 per run: cycles 1 and 3 pay, cycle 2 times
    // out unpaid, cycle 4 charges the last affordable run.
    assert_eq!(charged, vec![10 * UNIT, 0, 10 * UNIT, 10 * UNIT]);
    assert_eq!(skipped, 0);
    assert_eq!(system.store.get_balance(&agent).await.unwrap(), 5 * UNIT);
    assert_eq!(system.runs.load(Ordering::SeqCst), 4);

    // Budget exhausted: the agent stays scheduled but the next cycle is skipped.
    let outcomes = drain(&system, &system.tasks, start.plus_millis(5 * HOUR_MS)).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], TaskOutcome::Skipped(_)));
    assert!(system.scheduler.schedule_for(&agent).is_some());

    let history = system.store.deductions(&agent, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].balance_after, 5 * UNIT);

    let stats = system.scheduler.queue_stats().await.unwrap();
    assert_eq!(stats["agent-tasks"].completed, 3);
    assert_eq!(stats["agent-tasks"].failed, 2);
}

#[tokio::test]
async fn metrics_jobs_run_for_free() {
    let config = config();
    let system = system(&config, None);
    let agent = AgentId::from("agent-2");

    system
        .scheduler
        .schedule_agent(&agent, "conservative")
        .await
        .unwrap();
    let outcomes = drain(&system, &system.metrics, Timestamp::now().plus_millis(1)).await;

    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        TaskOutcome::Executed {
            result, charged, ..
        } => {
            assert!(result.success);
            assert_eq!(result.output, Some(json!({ "followers": 7 })));
            assert_eq!(*charged, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn unscheduled_agents_stop_firing() {
    let config = config();
    let system = system(&config, Some(Duration::from_millis(100)));
    let agent = AgentId::from("agent-3");

    system
        .scheduler
        .schedule_agent(&agent, "balanced")
        .await
        .unwrap();
    system
        .scheduler
        .schedule_agent(&agent, "balanced")
        .await
        .unwrap();
    assert_eq!(system.tasks.list_recurring().await.unwrap().len(), 1);

    system.scheduler.unschedule_agent(&agent).await.unwrap();
    assert!(system.scheduler.active_schedules().is_empty());

    let later = Timestamp::now().plus_millis(24 * HOUR_MS);
    assert!(system.tasks.poll_due(later).is_empty());
    assert!(system.metrics.poll_due(later).is_empty());

    system.scheduler.shutdown().await.unwrap();
    assert!(system.tasks.is_closed());
}
