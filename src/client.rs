use crate::error::{AccordError, Result};
use crate::identity::KeyIdentity;
use crate::model::{CommitRequest, CreateSessionRequest, Offer, SessionDescriptor, Transaction};
use crate::{AgentId, SessionId};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::sync::Arc;

/// The scout's view of the broker's session/offers/commit surface. The
/// concrete transport is a collaborator: in-process for tests, signed HTTP
/// for deployments.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionDescriptor>;
    async fn get_session(&self, session_id: SessionId) -> Result<SessionDescriptor>;
    async fn get_offers(&self, session_id: SessionId) -> Result<Vec<Offer>>;
    async fn commit(&self, session_id: SessionId, request: CommitRequest) -> Result<Transaction>;
    async fn cancel(&self, session_id: SessionId) -> Result<()>;
}

/// HTTP transport that signs every request with the agent's key, producing
/// the `X-Agent-*` header triple the broker verifies.
pub struct HttpBrokerClient {
    base_url: String,
    agent_id: AgentId,
    identity: Arc<KeyIdentity>,
    client: Client,
}

impl HttpBrokerClient {
    pub fn new(base_url: impl Into<String>, agent_id: AgentId, identity: Arc<KeyIdentity>) -> Self {
        Self {
            base_url: base_url.into(),
            agent_id,
            identity,
            client: Client::new(),
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let body = body.unwrap_or_default();
        let signed = self.identity.sign_request(
            self.agent_id,
            method.as_str(),
            path,
            &body,
            Utc::now().timestamp_millis(),
        );

        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("content-type", "application/json")
            .body(body);
        for (name, value) in signed.as_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        response.error_for_status().map_err(AccordError::Connection)
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionDescriptor> {
        let body = serde_json::to_vec(&request)?;
        let response = self.send(reqwest::Method::POST, "/sessions", Some(body)).await?;
        Ok(response.json().await?)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDescriptor> {
        let path = format!("/sessions/{}", session_id);
        let response = self.send(reqwest::Method::GET, &path, None).await?;
        Ok(response.json().await?)
    }

    async fn get_offers(&self, session_id: SessionId) -> Result<Vec<Offer>> {
        let path = format!("/sessions/{}/offers", session_id);
        let response = self.send(reqwest::Method::GET, &path, None).await?;
        Ok(response.json().await?)
    }

    async fn commit(&self, session_id: SessionId, request: CommitRequest) -> Result<Transaction> {
        let path = format!("/sessions/{}/commit", session_id);
        let body = serde_json::to_vec(&request)?;
        let response = self.send(reqwest::Method::POST, &path, Some(body)).await?;
        Ok(response.json().await?)
    }

    async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let path = format!("/sessions/{}/cancel", session_id);
        self.send(reqwest::Method::POST, &path, None).await?;
        Ok(())
    }
}
