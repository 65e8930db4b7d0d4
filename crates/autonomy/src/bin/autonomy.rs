//! autonomy - operator CLI for agent budgets and schedules

use anyhow::Context;
use autonomy::{
    AgentId, AutonomyConfig, BudgetLedger, SqliteBalanceStore, format_micro, telemetry,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autonomy")]
#[command(about = "Manage agent budgets and recurring schedules", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add funds to an agent's balance
    Fund {
        agent: String,
        /// Amount in micro-units
        amount: u64,
    },
    /// Show an agent's durable balance
    Balance {
        agent: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show an agent's recent deductions, newest first
    History {
        agent: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the scheduling strategies in effect
    Strategies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("autonomy=info");
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AutonomyConfig::load_from(path)?,
        None => AutonomyConfig::load()?,
    };

    match cli.command {
        Commands::Fund { agent, amount } => {
            let ledger = open_ledger(&config)?;
            let balance = ledger.fund(&AgentId::new(agent.clone()), amount).await?;
            println!(
                "Funded {agent} with {}; balance now {}",
                format_micro(amount),
                format_micro(balance)
            );
        }
        Commands::Balance { agent, json } => {
            let ledger = open_ledger(&config)?;
            let agent_id = AgentId::new(agent);
            let balance = ledger.load(&agent_id).await?;
            let spendable = balance.saturating_sub(ledger.min_reserve());
            if json {
                let value = serde_json::json!({
                    "agent_id": agent_id,
                    "balance_micro": balance,
                    "min_reserve_micro": ledger.min_reserve(),
                    "spendable_micro": spendable,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Agent:     {agent_id}");
                println!("Balance:   {}", format_micro(balance));
                println!("Reserve:   {}", format_micro(ledger.min_reserve()));
                println!("Spendable: {}", format_micro(spendable));
            }
        }
        Commands::History { agent, limit, json } => {
            let ledger = open_ledger(&config)?;
            let records = ledger.history(&AgentId::new(agent.clone()), limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No deductions recorded for {agent}");
            } else {
                for record in records {
                    let at = chrono::DateTime::from_timestamp_millis(record.timestamp.as_millis() as i64)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_else(|| record.timestamp.to_string());
                    println!(
                        "{at}  {:<24} -{}  {} -> {}",
                        record.operation_id,
                        format_micro(record.cost),
                        format_micro(record.balance_before),
                        format_micro(record.balance_after),
                    );
                }
            }
        }
        Commands::Strategies => {
            let scheduler = &config.scheduler;
            for (name, strategy) in scheduler.resolved_strategies() {
                let marker = if name == scheduler.default_strategy {
                    " (default)"
                } else {
                    ""
                };
                println!(
                    "{name}{marker}: every {}s, {} runs/day, jitter up to {}s",
                    strategy.interval.as_secs(),
                    strategy.target_runs_per_period,
                    strategy.max_jitter.min(scheduler.global_jitter_cap()).as_secs(),
                );
            }
        }
    }

    Ok(())
}

fn open_ledger(config: &AutonomyConfig) -> anyhow::Result<BudgetLedger> {
    let path = config.database_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = SqliteBalanceStore::open(&path)
        .with_context(|| format!("opening ledger database {}", path.display()))?;
    Ok(BudgetLedger::from_config(Arc::new(store), &config.ledger))
}
