use crate::constraint::Constraint;
use crate::{AgentId, OfferId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Buyer agent expressing purchase intent.
    Scout,
    /// Seller agent responding with offers.
    Beacon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Suspended,
    Revoked,
}

/// Broker-side record created at registration, after proof-of-possession
/// succeeds. Status transitions are broker-authorized only and gate every
/// authenticated call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub name: String,
    /// Base64 of the raw 32-byte Ed25519 public key.
    pub public_key: String,
    /// Declared capability text, matched against session requirements.
    pub capabilities: String,
    pub endpoint: Option<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Declarative self-description submitted at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    #[serde(default)]
    pub capabilities: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Registration request body. The `X-Agent-Signature` header carries a
/// signature over these exact serialized bytes, proving control of the
/// private key matching `public_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBody {
    /// Base64 raw 32-byte Ed25519 public key.
    pub public_key: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub manifest: AgentManifest,
}

/// A seller's response to a session. Immutable once submitted; owned by the
/// session that solicited it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub seller_id: AgentId,
    pub seller_name: String,
    pub product: String,
    pub unit_price: f64,
    pub quantity: u32,
    pub total_price: f64,
    pub currency: String,
    pub delivery_date: Option<DateTime<Utc>>,
    pub terms: Option<String>,
}

impl Offer {
    pub fn new(
        seller_id: AgentId,
        seller_name: String,
        product: String,
        unit_price: f64,
        quantity: u32,
        currency: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller_id,
            seller_name,
            product,
            unit_price,
            quantity,
            total_price: unit_price * quantity as f64,
            currency,
            delivery_date: None,
            terms: None,
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.quantity == 0 {
            return Err(crate::error::AccordError::Validation(
                "Offer quantity must be greater than 0".to_string(),
            ));
        }
        if self.unit_price <= 0.0 || self.total_price <= 0.0 {
            return Err(crate::error::AccordError::Validation(
                "Offer price must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of intent interpretation, an external collaborator behind
/// [`crate::intent::IntentInterpreter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredRequirements {
    pub keywords: Vec<String>,
    pub category: Option<String>,
    pub quantity: Option<u32>,
    pub max_budget: Option<f64>,
    pub currency: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

/// The purchase a mandate chain is asked to authorize, derived from a
/// selected offer plus session context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedPurchase {
    pub total_amount: f64,
    pub currency: String,
    pub category: Option<String>,
    pub merchant_id: AgentId,
    pub merchant_name: String,
}

impl ProposedPurchase {
    pub fn from_offer(offer: &Offer, category: Option<String>) -> Self {
        Self {
            total_amount: offer.total_price,
            currency: offer.currency.clone(),
            category,
            merchant_id: offer.seller_id,
            merchant_name: offer.seller_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Tokenized authorization recorded; no funds movement happens here.
    Authorized,
}

/// Created exactly once per committed session, keyed by a client-supplied
/// idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub session_id: SessionId,
    pub offer_id: OfferId,
    pub status: TransactionStatus,
    pub amount: f64,
    pub currency: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerSessionStatus {
    Interpreting,
    Discovering,
    CollectingOffers,
    OffersReady,
    Committed,
    Cancelled,
}

impl BrokerSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerSessionStatus::Committed | BrokerSessionStatus::Cancelled)
    }
}

/// Broker-side session state. Mutated only through
/// [`crate::broker::SessionBroker`] operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSession {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub intent_text: String,
    pub requirements: StructuredRequirements,
    pub constraints: Vec<Constraint>,
    pub candidate_beacons: Vec<AgentId>,
    pub offers: Vec<Offer>,
    pub status: BrokerSessionStatus,
    pub collect_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a scout sees of a broker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    pub status: BrokerSessionStatus,
    pub offer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub intent: String,
    pub agent_id: AgentId,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub offer_id: OfferId,
    pub idempotency_key: String,
    pub intent_mandate: crate::mandate::IntentMandate,
    pub cart_mandate: crate::mandate::CartMandate,
    pub payment_mandate: crate::mandate::PaymentMandate,
}
