use crate::error::Result;
use crate::model::{AgentRecord, AgentStatus, AgentType, BrokerSession, Transaction};
use crate::{AgentId, SessionId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Broker-side agent store. Reads happen on every authenticated request, so
/// implementations must make status updates (suspend/revoke) visible to the
/// very next lookup.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, id: AgentId) -> Result<Option<AgentRecord>>;
    async fn put(&self, record: AgentRecord) -> Result<()>;
    async fn delete(&self, id: AgentId) -> Result<()>;
    async fn list_active(&self, agent_type: AgentType) -> Result<Vec<AgentRecord>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, id: SessionId) -> Result<Option<BrokerSession>>;
    async fn put(&self, session: BrokerSession) -> Result<()>;
    async fn delete(&self, id: SessionId) -> Result<()>;
    async fn list_active(&self) -> Result<Vec<BrokerSession>>;
}

/// Transactions are exactly-once per idempotency key; the lookup is what
/// makes a retried commit return the original record.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn get(&self, id: uuid::Uuid) -> Result<Option<Transaction>>;
    async fn put(&self, transaction: Transaction) -> Result<()>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>>;
}

#[derive(Default)]
pub struct MemoryAgentRepository {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl MemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for MemoryAgentRepository {
    async fn get(&self, id: AgentId) -> Result<Option<AgentRecord>> {
        Ok(self.agents.read().get(&id).cloned())
    }

    async fn put(&self, record: AgentRecord) -> Result<()> {
        self.agents.write().insert(record.agent_id, record);
        Ok(())
    }

    async fn delete(&self, id: AgentId) -> Result<()> {
        self.agents.write().remove(&id);
        Ok(())
    }

    async fn list_active(&self, agent_type: AgentType) -> Result<Vec<AgentRecord>> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .read()
            .values()
            .filter(|r| r.agent_type == agent_type && r.status == AgentStatus::Active)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<SessionId, BrokerSession>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn get(&self, id: SessionId) -> Result<Option<BrokerSession>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn put(&self, session: BrokerSession) -> Result<()> {
        self.sessions.write().insert(session.id, session);
        Ok(())
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        self.sessions.write().remove(&id);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<BrokerSession>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryTransactionRepository {
    transactions: RwLock<HashMap<uuid::Uuid, Transaction>>,
}

impl MemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionRepository for MemoryTransactionRepository {
    async fn get(&self, id: uuid::Uuid) -> Result<Option<Transaction>> {
        Ok(self.transactions.read().get(&id).cloned())
    }

    async fn put(&self, transaction: Transaction) -> Result<()> {
        self.transactions.write().insert(transaction.id, transaction);
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>> {
        Ok(self
            .transactions
            .read()
            .values()
            .find(|t| t.idempotency_key == key)
            .cloned())
    }
}
