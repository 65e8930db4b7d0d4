//! SQLite persistence for balances and the deduction log.

use super::store::{BalanceStore, DeductionRecord};
use crate::error::StoreError;
use crate::types::{AgentId, Timestamp};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Balance store backed by a single SQLite connection.
///
/// Calls run on the blocking thread pool so they never stall the async
/// workers that drive agent sessions.
#[derive(Clone)]
pub struct SqliteBalanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBalanceStore {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    run_migration(conn, "001_balances_and_deductions", MIGRATION_001)?;
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<(), StoreError> {
    let applied: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?1)",
        [name],
        |row| row.get(0),
    )?;
    if applied {
        return Ok(());
    }

    conn.execute_batch(sql)?;
    conn.execute(
        "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
        params![name, chrono::Utc::now().timestamp()],
    )?;

    tracing::info!(migration = name, "Applied ledger migration");
    Ok(())
}

const MIGRATION_001: &str = r#"
CREATE TABLE IF NOT EXISTS balances (
    agent_id TEXT PRIMARY KEY,
    balance_micro INTEGER NOT NULL CHECK(balance_micro >= 0),
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS deductions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    cost_micro INTEGER NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deductions_agent ON deductions(agent_id, created_at);
"#;

const UPSERT_BALANCE: &str = "INSERT INTO balances (agent_id, balance_micro, updated_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT(agent_id) DO UPDATE SET
         balance_micro = excluded.balance_micro,
         updated_at = excluded.updated_at";

const INSERT_DEDUCTION: &str = "INSERT INTO deductions
     (id, agent_id, operation_id, cost_micro, balance_before, balance_after, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

fn insert_deduction(conn: &Connection, record: &DeductionRecord) -> rusqlite::Result<usize> {
    conn.execute(
        INSERT_DEDUCTION,
        params![
            record.id.to_string(),
            record.agent_id.as_str(),
            record.operation_id,
            record.cost,
            record.balance_before,
            record.balance_after,
            record.timestamp.as_millis(),
        ],
    )
}

fn deduction_from_row(row: &Row<'_>) -> rusqlite::Result<DeductionRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))?;
    let agent_id: String = row.get(1)?;
    let created_at: u64 = row.get(6)?;
    Ok(DeductionRecord {
        id,
        agent_id: AgentId::new(agent_id),
        operation_id: row.get(2)?,
        cost: row.get(3)?,
        balance_before: row.get(4)?,
        balance_after: row.get(5)?,
        timestamp: Timestamp::from_millis(created_at),
    })
}

#[async_trait]
impl BalanceStore for SqliteBalanceStore {
    async fn get_balance(&self, agent_id: &AgentId) -> Result<u64, StoreError> {
        let agent_id = agent_id.clone();
        self.with_conn(move |conn| {
            let balance: Option<u64> = conn
                .query_row(
                    "SELECT balance_micro FROM balances WHERE agent_id = ?1",
                    [agent_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(balance.unwrap_or(0))
        })
        .await
    }

    async fn set_balance(&self, agent_id: &AgentId, balance: u64) -> Result<(), StoreError> {
        let agent_id = agent_id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                UPSERT_BALANCE,
                params![agent_id.as_str(), balance, Timestamp::now().as_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_deduction(&self, record: &DeductionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            insert_deduction(conn, &record)?;
            Ok(())
        })
        .await
    }

    async fn commit_debit(&self, record: &DeductionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                UPSERT_BALANCE,
                params![
                    record.agent_id.as_str(),
                    record.balance_after,
                    record.timestamp.as_millis()
                ],
            )?;
            insert_deduction(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn deductions(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<DeductionRecord>, StoreError> {
        let agent_id = agent_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, operation_id, cost_micro, balance_before, balance_after, created_at
                 FROM deductions WHERE agent_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![agent_id.as_str(), limit], deduction_from_row)?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }
}
