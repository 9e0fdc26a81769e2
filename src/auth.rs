use crate::error::{AccordError, AuthReason, Result};
use crate::identity::{decode_public_key, decode_signature, SigningContext};
use crate::model::{AgentRecord, AgentStatus, RegisterBody};
use crate::repository::AgentRepository;
use crate::AgentId;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::Verifier;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum allowed drift between the request timestamp and server time.
/// Balances clock-skew tolerance against replay risk.
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 300;

/// Server-side verification of proof-of-possession and per-request
/// signatures. Every authenticated call goes through [`authenticate`],
/// which re-reads the agent record so suspend/revoke takes effect on the
/// very next request.
///
/// [`authenticate`]: RequestAuthenticator::authenticate
pub struct RequestAuthenticator {
    agents: Arc<dyn AgentRepository>,
    replay_window: Duration,
}

impl RequestAuthenticator {
    pub fn new(agents: Arc<dyn AgentRepository>) -> Self {
        Self::with_replay_window(agents, DEFAULT_REPLAY_WINDOW_SECS)
    }

    pub fn with_replay_window(agents: Arc<dyn AgentRepository>, window_secs: i64) -> Self {
        Self {
            agents,
            replay_window: Duration::seconds(window_secs),
        }
    }

    /// Registration with proof-of-possession: the signature must cover the
    /// exact serialized body bytes, verified against the public key the
    /// body itself claims. Only then is an [`AgentRecord`] created.
    pub async fn register(
        &self,
        body: &[u8],
        signature_b64: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord> {
        let request: RegisterBody = serde_json::from_slice(body).map_err(|e| {
            AccordError::Auth(AuthReason::MalformedInput(format!("register body: {}", e)))
        })?;

        let public_key = decode_public_key(&request.public_key)?;
        let signature = decode_signature(signature_b64)?;
        public_key
            .verify(body, &signature)
            .map_err(|_| AccordError::Auth(AuthReason::VerificationFailed))?;

        let record = AgentRecord {
            agent_id: Uuid::new_v4(),
            agent_type: request.agent_type,
            name: request.manifest.name,
            public_key: request.public_key,
            capabilities: request.manifest.capabilities,
            endpoint: request.manifest.endpoint,
            status: AgentStatus::Active,
            registered_at: now,
            last_seen_at: now,
        };
        self.agents.put(record.clone()).await?;

        tracing::info!(
            agent_id = %record.agent_id,
            key_id = %crate::identity::derive_key_id(public_key.as_bytes()),
            "agent registered"
        );
        Ok(record)
    }

    /// Verifies one authenticated request. The canonical string is rebuilt
    /// from the actually-received method, path, timestamp, and body, so a
    /// signature cannot be replayed against a different endpoint or
    /// payload.
    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        agent_id: Option<&str>,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<AgentRecord> {
        let (agent_id, signature, timestamp) = match (agent_id, signature, timestamp) {
            (Some(id), Some(sig), Some(ts)) => (id, sig, ts),
            (None, None, _) => {
                return Err(AccordError::Auth(AuthReason::IncompleteCredentials));
            }
            _ => return Err(AccordError::Auth(AuthReason::IncompleteCredentials)),
        };

        let agent_id: AgentId = agent_id.parse().map_err(|_| {
            AccordError::Auth(AuthReason::MalformedInput("agent id is not a UUID".to_string()))
        })?;

        let mut record = self
            .agents
            .get(agent_id)
            .await?
            .ok_or(AccordError::Auth(AuthReason::UnknownAgent))?;

        match record.status {
            AgentStatus::Suspended => return Err(AccordError::Auth(AuthReason::AgentSuspended)),
            AgentStatus::Revoked => return Err(AccordError::Auth(AuthReason::AgentRevoked)),
            AgentStatus::Active => {}
        }

        let timestamp_ms: i64 = timestamp.parse().map_err(|_| {
            AccordError::Auth(AuthReason::MalformedInput(
                "timestamp is not unix milliseconds".to_string(),
            ))
        })?;
        let drift = (now.timestamp_millis() - timestamp_ms).abs();
        if drift > self.replay_window.num_milliseconds() {
            return Err(AccordError::Auth(AuthReason::StaleTimestamp));
        }

        let signature = decode_signature(signature)?;
        let public_key = decode_public_key(&record.public_key)?;
        let context = SigningContext::for_request(method, path, timestamp_ms, body);
        public_key
            .verify(context.canonical_string().as_bytes(), &signature)
            .map_err(|_| AccordError::Auth(AuthReason::VerificationFailed))?;

        record.last_seen_at = now;
        self.agents.put(record.clone()).await?;
        Ok(record)
    }

    /// Broker-authorized status transition. Suspension is recoverable,
    /// revocation is terminal.
    pub async fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<()> {
        let mut record = self
            .agents
            .get(agent_id)
            .await?
            .ok_or(AccordError::AgentNotFound(agent_id))?;
        if record.status == AgentStatus::Revoked && status != AgentStatus::Revoked {
            return Err(AccordError::Validation(
                "revoked agents cannot be reinstated".to_string(),
            ));
        }
        record.status = status;
        self.agents.put(record).await?;
        tracing::info!(agent_id = %agent_id, status = ?status, "agent status updated");
        Ok(())
    }
}
