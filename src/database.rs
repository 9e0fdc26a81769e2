use crate::error::{AccordError, Result};
use crate::model::{AgentRecord, AgentStatus, AgentType, Transaction, TransactionStatus};
use crate::AgentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Sqlite-backed persistence for the broker's durable state: registered
/// agents and settled transactions. Sessions are deliberately kept in
/// memory; they are short-lived and reconstructible.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '',
                endpoint TEXT,
                status TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                offer_id TEXT NOT NULL,
                status TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn agent_type_str(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Scout => "scout",
        AgentType::Beacon => "beacon",
    }
}

fn parse_agent_type(raw: &str) -> Result<AgentType> {
    match raw {
        "scout" => Ok(AgentType::Scout),
        "beacon" => Ok(AgentType::Beacon),
        other => Err(AccordError::Storage(format!("unknown agent type '{}'", other))),
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "active",
        AgentStatus::Suspended => "suspended",
        AgentStatus::Revoked => "revoked",
    }
}

fn parse_status(raw: &str) -> Result<AgentStatus> {
    match raw {
        "active" => Ok(AgentStatus::Active),
        "suspended" => Ok(AgentStatus::Suspended),
        "revoked" => Ok(AgentStatus::Revoked),
        other => Err(AccordError::Storage(format!("unknown agent status '{}'", other))),
    }
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| AccordError::Storage(format!("corrupt uuid in column '{}'", column)))
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AccordError::Storage(format!("corrupt timestamp in column '{}'", column)))
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord> {
    Ok(AgentRecord {
        agent_id: parse_uuid(&row.get::<String, _>("agent_id"), "agent_id")?,
        agent_type: parse_agent_type(&row.get::<String, _>("agent_type"))?,
        name: row.get::<String, _>("name"),
        public_key: row.get::<String, _>("public_key"),
        capabilities: row.get::<String, _>("capabilities"),
        endpoint: row.get::<Option<String>, _>("endpoint"),
        status: parse_status(&row.get::<String, _>("status"))?,
        registered_at: parse_timestamp(&row.get::<String, _>("registered_at"), "registered_at")?,
        last_seen_at: parse_timestamp(&row.get::<String, _>("last_seen_at"), "last_seen_at")?,
    })
}

fn transaction_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
    let status = match row.get::<String, _>("status").as_str() {
        "authorized" => TransactionStatus::Authorized,
        other => {
            return Err(AccordError::Storage(format!(
                "unknown transaction status '{}'",
                other
            )))
        }
    };
    Ok(Transaction {
        id: parse_uuid(&row.get::<String, _>("id"), "id")?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"), "session_id")?,
        offer_id: parse_uuid(&row.get::<String, _>("offer_id"), "offer_id")?,
        status,
        amount: row.get::<f64, _>("amount"),
        currency: row.get::<String, _>("currency"),
        idempotency_key: row.get::<String, _>("idempotency_key"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"), "created_at")?,
    })
}

pub struct SqliteAgentRepository {
    db: Database,
}

impl SqliteAgentRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl crate::repository::AgentRepository for SqliteAgentRepository {
    async fn get(&self, id: AgentId) -> Result<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn put(&self, record: AgentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents
                (agent_id, agent_type, name, public_key, capabilities, endpoint,
                 status, registered_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                name = excluded.name,
                public_key = excluded.public_key,
                capabilities = excluded.capabilities,
                endpoint = excluded.endpoint,
                status = excluded.status,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(record.agent_id.to_string())
        .bind(agent_type_str(record.agent_type))
        .bind(&record.name)
        .bind(&record.public_key)
        .bind(&record.capabilities)
        .bind(&record.endpoint)
        .bind(status_str(record.status))
        .bind(record.registered_at.to_rfc3339())
        .bind(record.last_seen_at.to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn delete(&self, id: AgentId) -> Result<()> {
        sqlx::query("DELETE FROM agents WHERE agent_id = ?")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn list_active(&self, agent_type: AgentType) -> Result<Vec<AgentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE agent_type = ? AND status = 'active' \
             ORDER BY registered_at DESC",
        )
        .bind(agent_type_str(agent_type))
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }
}

pub struct SqliteTransactionRepository {
    db: Database,
}

impl SqliteTransactionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl crate::repository::TransactionRepository for SqliteTransactionRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn put(&self, transaction: Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, session_id, offer_id, status, amount, currency,
                 idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(transaction.session_id.to_string())
        .bind(transaction.offer_id.to_string())
        .bind(match transaction.status {
            TransactionStatus::Authorized => "authorized",
        })
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.idempotency_key)
        .bind(transaction.created_at.to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }
}
