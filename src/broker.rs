use crate::error::{AccordError, Result};
use crate::intent::IntentInterpreter;
use crate::mandate::{validate_intent_coverage, verify_chain};
use crate::matcher::rank_sellers;
use crate::model::{
    AgentRecord, AgentType, BrokerSession, BrokerSessionStatus, CommitRequest,
    CreateSessionRequest, Offer, ProposedPurchase, SessionDescriptor, Transaction,
    TransactionStatus,
};
use crate::repository::{AgentRepository, SessionRepository, TransactionRepository};
use crate::{AgentId, SessionId};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const NOTIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a session collects offers before flipping to offers_ready.
    pub collection_window: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            collection_window: Duration::seconds(30),
        }
    }
}

/// Outbound solicitation to a matched seller. Delivery is best-effort: a
/// seller that never hears about a session simply submits no offer.
#[async_trait]
pub trait BeaconNotifier: Send + Sync {
    async fn notify(&self, beacon: &AgentRecord, session: &BrokerSession) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl BeaconNotifier for NoopNotifier {
    async fn notify(&self, _: &AgentRecord, _: &BrokerSession) -> Result<()> {
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct Solicitation<'a> {
    session_id: SessionId,
    requirements: &'a crate::model::StructuredRequirements,
    collect_deadline: Option<chrono::DateTime<Utc>>,
}

/// Delivers solicitations to the endpoint each beacon declared at
/// registration.
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BeaconNotifier for HttpNotifier {
    async fn notify(&self, beacon: &AgentRecord, session: &BrokerSession) -> Result<()> {
        let endpoint = beacon
            .endpoint
            .as_deref()
            .ok_or_else(|| AccordError::Validation("beacon has no endpoint".to_string()))?;
        self.client
            .post(format!("{}/solicitations", endpoint.trim_end_matches('/')))
            .json(&Solicitation {
                session_id: session.id,
                requirements: &session.requirements,
                collect_deadline: session.collect_deadline,
            })
            .send()
            .await?
            .error_for_status()
            .map_err(AccordError::Connection)?;
        Ok(())
    }
}

/// The neutral session core: interprets intent, matches sellers, collects
/// offers inside a bounded window, and settles exactly one mandate-gated
/// commit per session.
pub struct SessionBroker {
    agents: Arc<dyn AgentRepository>,
    sessions: Arc<dyn SessionRepository>,
    transactions: Arc<dyn TransactionRepository>,
    interpreter: Arc<dyn IntentInterpreter>,
    notifier: Arc<dyn BeaconNotifier>,
    config: BrokerConfig,
    /// Serializes the idempotency-key lookup with transaction insertion.
    commit_lock: Mutex<()>,
}

impl SessionBroker {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        sessions: Arc<dyn SessionRepository>,
        transactions: Arc<dyn TransactionRepository>,
        interpreter: Arc<dyn IntentInterpreter>,
        notifier: Arc<dyn BeaconNotifier>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            agents,
            sessions,
            transactions,
            interpreter,
            notifier,
            config,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn agents(&self) -> Arc<dyn AgentRepository> {
        self.agents.clone()
    }

    /// Opens a session for a scout's intent. Interpretation and discovery
    /// failures degrade the session (fewer or no candidates) rather than
    /// failing it: an open session with zero offers is a valid outcome.
    pub async fn open_session(&self, request: CreateSessionRequest) -> Result<SessionDescriptor> {
        let now = Utc::now();
        let requirements = match self.interpreter.parse(&request.intent, &request.constraints) {
            Ok(requirements) => requirements,
            Err(e) => {
                tracing::warn!(error = %e, "intent interpretation failed, degrading to keywords-free session");
                Default::default()
            }
        };

        let beacons = match self.agents.list_active(AgentType::Beacon).await {
            Ok(beacons) => beacons,
            Err(e) => {
                tracing::warn!(error = %e, "beacon discovery failed, session opens with no candidates");
                Vec::new()
            }
        };
        let candidates = rank_sellers(beacons, &requirements);

        let session = BrokerSession {
            id: Uuid::new_v4(),
            agent_id: request.agent_id,
            intent_text: request.intent,
            requirements,
            constraints: request.constraints,
            candidate_beacons: candidates.iter().map(|c| c.agent.agent_id).collect(),
            offers: Vec::new(),
            status: BrokerSessionStatus::CollectingOffers,
            collect_deadline: Some(now + self.config.collection_window),
            created_at: now,
            updated_at: now,
        };
        self.sessions.put(session.clone()).await?;

        tracing::info!(
            session_id = %session.id,
            candidates = candidates.len(),
            "session opened"
        );

        for candidate in candidates {
            if candidate.agent.endpoint.is_none() {
                continue;
            }
            let notifier = self.notifier.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let outcome =
                    tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&candidate.agent, &session))
                        .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(beacon = %candidate.agent.agent_id, error = %e, "solicitation failed");
                    }
                    Err(_) => {
                        tracing::warn!(beacon = %candidate.agent.agent_id, "solicitation timed out");
                    }
                }
            });
        }

        Ok(descriptor(&session))
    }

    /// Loads a session and applies the deadline flip: a session whose
    /// collection window has elapsed reads as offers_ready even though no
    /// background task touched it.
    async fn load_session(&self, session_id: SessionId) -> Result<BrokerSession> {
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(AccordError::SessionNotFound(session_id))?;
        if session.status == BrokerSessionStatus::CollectingOffers {
            if let Some(deadline) = session.collect_deadline {
                if Utc::now() >= deadline {
                    session.status = BrokerSessionStatus::OffersReady;
                    session.updated_at = Utc::now();
                    self.sessions.put(session.clone()).await?;
                }
            }
        }
        Ok(session)
    }

    pub async fn describe_session(&self, session_id: SessionId) -> Result<SessionDescriptor> {
        let session = self.load_session(session_id).await?;
        Ok(descriptor(&session))
    }

    /// Accepts a seller's offer while the window is open. Offers are
    /// immutable once submitted and permanently owned by the session.
    pub async fn submit_offer(
        &self,
        session_id: SessionId,
        seller_id: AgentId,
        mut offer: Offer,
    ) -> Result<SessionDescriptor> {
        offer.seller_id = seller_id;
        offer.validate()?;

        let mut session = self.load_session(session_id).await?;
        if session.status != BrokerSessionStatus::CollectingOffers {
            return Err(AccordError::Session(format!(
                "session {} is not collecting offers (status {:?})",
                session_id, session.status
            )));
        }

        session.offers.push(offer);
        session.updated_at = Utc::now();
        self.sessions.put(session.clone()).await?;
        Ok(descriptor(&session))
    }

    /// Returns the session's offers, ordered by the seller match ranking
    /// established at discovery time, then by submission order.
    pub async fn session_offers(&self, session_id: SessionId) -> Result<Vec<Offer>> {
        let session = self.load_session(session_id).await?;
        let position = |seller: AgentId| {
            session
                .candidate_beacons
                .iter()
                .position(|id| *id == seller)
                .unwrap_or(usize::MAX)
        };
        let mut offers = session.offers;
        offers.sort_by_key(|o| position(o.seller_id));
        Ok(offers)
    }

    /// Settles the session: exactly one transaction per idempotency key,
    /// and only for a mandate chain that verifiably authorizes the chosen
    /// offer. A retry with the same key returns the original transaction.
    pub async fn commit_session(
        &self,
        session_id: SessionId,
        caller: AgentId,
        request: CommitRequest,
    ) -> Result<Transaction> {
        let _guard = self.commit_lock.lock().await;

        if let Some(existing) = self
            .transactions
            .find_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            if existing.session_id != session_id {
                return Err(AccordError::Session(
                    "idempotency key already used by another session".to_string(),
                ));
            }
            return Ok(existing);
        }

        let mut session = self.load_session(session_id).await?;
        if session.agent_id != caller {
            return Err(AccordError::Session(
                "session belongs to a different agent".to_string(),
            ));
        }
        if session.status != BrokerSessionStatus::OffersReady {
            return Err(AccordError::Session(format!(
                "session {} cannot commit (status {:?})",
                session_id, session.status
            )));
        }

        let offer = session
            .offers
            .iter()
            .find(|o| o.id == request.offer_id)
            .cloned()
            .ok_or(AccordError::OfferNotFound(request.offer_id))?;

        let now = Utc::now();
        let cart = &request.cart_mandate.cart;
        if cart.session_id != session.id || cart.offer_id != offer.id {
            return Err(AccordError::MandateChain(
                "cart mandate does not reference this session and offer".to_string(),
            ));
        }
        if (cart.total_amount - offer.total_price).abs() > f64::EPSILON
            || cart.currency != offer.currency
            || cart.merchant_id != offer.seller_id
        {
            return Err(AccordError::MandateChain(
                "cart mandate does not match the offer terms".to_string(),
            ));
        }

        let purchase = ProposedPurchase::from_offer(&offer, session.requirements.category.clone());
        verify_chain(
            &request.intent_mandate,
            &request.cart_mandate,
            &request.payment_mandate,
            &purchase,
            now,
        )?;

        let transaction = Transaction {
            id: Uuid::new_v4(),
            session_id: session.id,
            offer_id: offer.id,
            status: TransactionStatus::Authorized,
            amount: offer.total_price,
            currency: offer.currency.clone(),
            idempotency_key: request.idempotency_key,
            created_at: now,
        };
        self.transactions.put(transaction.clone()).await?;

        session.status = BrokerSessionStatus::Committed;
        session.updated_at = now;
        self.sessions.put(session).await?;

        tracing::info!(
            session_id = %session_id,
            transaction_id = %transaction.id,
            amount = transaction.amount,
            "session committed"
        );
        Ok(transaction)
    }

    /// Cancels a session. Cancelling an already-cancelled session is a
    /// no-op; a committed session cannot be cancelled.
    pub async fn cancel_session(&self, session_id: SessionId, caller: AgentId) -> Result<()> {
        let mut session = self.load_session(session_id).await?;
        if session.agent_id != caller {
            return Err(AccordError::Session(
                "session belongs to a different agent".to_string(),
            ));
        }
        match session.status {
            BrokerSessionStatus::Cancelled => Ok(()),
            BrokerSessionStatus::Committed => Err(AccordError::Session(
                "cannot cancel a committed session".to_string(),
            )),
            _ => {
                session.status = BrokerSessionStatus::Cancelled;
                session.updated_at = Utc::now();
                self.sessions.put(session).await?;
                Ok(())
            }
        }
    }

    /// Preflight coverage check a scout can run before building the full
    /// chain: does this intent mandate authorize this offer at all.
    pub async fn check_coverage(
        &self,
        session_id: SessionId,
        offer_id: crate::OfferId,
        intent: &crate::mandate::IntentMandate,
    ) -> Result<crate::mandate::CoverageResult> {
        let session = self.load_session(session_id).await?;
        let offer = session
            .offers
            .iter()
            .find(|o| o.id == offer_id)
            .ok_or(AccordError::OfferNotFound(offer_id))?;
        let purchase = ProposedPurchase::from_offer(offer, session.requirements.category.clone());
        Ok(validate_intent_coverage(intent, &purchase, Utc::now()))
    }
}

fn descriptor(session: &BrokerSession) -> SessionDescriptor {
    SessionDescriptor {
        session_id: session.id,
        status: session.status,
        offer_count: session.offers.len(),
    }
}

/// In-process client: lets a scout drive a broker living in the same
/// process, which is how the integration tests exercise the full flow.
#[async_trait]
impl crate::client::BrokerClient for SessionBroker {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionDescriptor> {
        self.open_session(request).await
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDescriptor> {
        self.describe_session(session_id).await
    }

    async fn get_offers(&self, session_id: SessionId) -> Result<Vec<Offer>> {
        self.session_offers(session_id).await
    }

    async fn commit(&self, session_id: SessionId, request: CommitRequest) -> Result<Transaction> {
        let session = self.load_session(session_id).await?;
        self.commit_session(session_id, session.agent_id, request).await
    }

    async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let session = self.load_session(session_id).await?;
        self.cancel_session(session_id, session.agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyIdentity;
    use crate::intent::KeywordInterpreter;
    use crate::mandate::{
        create_cart_mandate, create_intent_mandate, create_payment_mandate, IntentConstraints,
    };
    use crate::model::{AgentStatus, Offer};
    use crate::repository::{
        MemoryAgentRepository, MemorySessionRepository, MemoryTransactionRepository,
    };
    use crate::storage::MemoryStorage;

    fn broker_with_window(window: Duration) -> SessionBroker {
        SessionBroker::new(
            Arc::new(MemoryAgentRepository::new()),
            Arc::new(MemorySessionRepository::new()),
            Arc::new(MemoryTransactionRepository::new()),
            Arc::new(KeywordInterpreter::new()),
            Arc::new(NoopNotifier),
            BrokerConfig {
                collection_window: window,
            },
        )
    }

    async fn register_beacon(broker: &SessionBroker, capabilities: &str) -> AgentRecord {
        let now = Utc::now();
        let record = AgentRecord {
            agent_id: Uuid::new_v4(),
            agent_type: AgentType::Beacon,
            name: "Widget Forge".to_string(),
            public_key: String::new(),
            capabilities: capabilities.to_string(),
            endpoint: None,
            status: AgentStatus::Active,
            registered_at: now,
            last_seen_at: now,
        };
        broker.agents.put(record.clone()).await.unwrap();
        record
    }

    fn widget_request(scout: AgentId) -> CreateSessionRequest {
        CreateSessionRequest {
            intent: "I need 500 industrial widgets, budget max 50000".to_string(),
            agent_id: scout,
            constraints: vec![],
        }
    }

    fn chain_for(
        signer: &KeyIdentity,
        scout: AgentId,
        session_id: SessionId,
        offer: &Offer,
        max_amount: f64,
    ) -> (
        crate::mandate::IntentMandate,
        crate::mandate::CartMandate,
        crate::mandate::PaymentMandate,
    ) {
        let now = Utc::now();
        let intent = create_intent_mandate(
            signer,
            scout,
            "user-7",
            IntentConstraints {
                max_amount,
                currency: offer.currency.clone(),
                categories: vec![],
                merchant_allowlist: None,
                merchant_blocklist: None,
                valid_from: None,
                valid_until: Some(now + Duration::hours(1)),
                require_user_present: false,
                max_transactions: None,
            },
            now,
        )
        .unwrap();
        let cart =
            create_cart_mandate(signer, session_id, offer, Some(intent.id), true, now).unwrap();
        let payment =
            create_payment_mandate(signer, &cart, "card", "visa", scout, now, now).unwrap();
        (intent, cart, payment)
    }

    #[tokio::test]
    async fn zero_offer_sessions_still_reach_offers_ready() {
        let broker = broker_with_window(Duration::zero());
        let descriptor = broker.open_session(widget_request(Uuid::new_v4())).await.unwrap();
        assert_eq!(descriptor.status, BrokerSessionStatus::CollectingOffers);

        // The elapsed window flips the status on the next read.
        let descriptor = broker.describe_session(descriptor.session_id).await.unwrap();
        assert_eq!(descriptor.status, BrokerSessionStatus::OffersReady);
        assert_eq!(descriptor.offer_count, 0);
    }

    #[tokio::test]
    async fn offers_after_the_window_are_rejected() {
        let broker = broker_with_window(Duration::zero());
        let beacon = register_beacon(&broker, "industrial widgets").await;
        let descriptor = broker.open_session(widget_request(Uuid::new_v4())).await.unwrap();

        let offer = Offer::new(
            beacon.agent_id,
            beacon.name.clone(),
            "industrial widgets".to_string(),
            85.0,
            500,
            "USD".to_string(),
        );
        let err = broker
            .submit_offer(descriptor.session_id, beacon.agent_id, offer)
            .await
            .unwrap_err();
        assert!(matches!(err, AccordError::Session(_)));
    }

    #[tokio::test]
    async fn commit_is_idempotent_per_key() {
        let broker = broker_with_window(Duration::seconds(3600));
        let beacon = register_beacon(&broker, "industrial widgets").await;
        let scout = Uuid::new_v4();
        let descriptor = broker.open_session(widget_request(scout)).await.unwrap();

        let offer = Offer::new(
            beacon.agent_id,
            beacon.name.clone(),
            "industrial widgets".to_string(),
            85.0,
            500,
            "USD".to_string(),
        );
        let offer_id = offer.id;
        broker
            .submit_offer(descriptor.session_id, beacon.agent_id, offer.clone())
            .await
            .unwrap();

        // Close the window by hand so commit becomes legal.
        let mut session = broker.sessions.get(descriptor.session_id).await.unwrap().unwrap();
        session.status = BrokerSessionStatus::OffersReady;
        broker.sessions.put(session).await.unwrap();

        let storage = MemoryStorage::new();
        let signer = KeyIdentity::load_or_generate(&storage, "scout").unwrap();
        let (intent, cart, payment) =
            chain_for(&signer, scout, descriptor.session_id, &offer, 50_000.0);

        let request = CommitRequest {
            offer_id,
            idempotency_key: "commit-1".to_string(),
            intent_mandate: intent,
            cart_mandate: cart,
            payment_mandate: payment,
        };

        let first = broker
            .commit_session(descriptor.session_id, scout, request.clone())
            .await
            .unwrap();
        assert_eq!(first.status, TransactionStatus::Authorized);
        assert_eq!(first.offer_id, offer_id);

        let second = broker
            .commit_session(descriptor.session_id, scout, request)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);

        let session = broker.sessions.get(descriptor.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, BrokerSessionStatus::Committed);
    }

    #[tokio::test]
    async fn commit_rejects_a_chain_over_budget() {
        let broker = broker_with_window(Duration::seconds(3600));
        let beacon = register_beacon(&broker, "industrial widgets").await;
        let scout = Uuid::new_v4();
        let descriptor = broker.open_session(widget_request(scout)).await.unwrap();

        let offer = Offer::new(
            beacon.agent_id,
            beacon.name.clone(),
            "industrial widgets".to_string(),
            85.0,
            500,
            "USD".to_string(),
        );
        let offer_id = offer.id;
        broker
            .submit_offer(descriptor.session_id, beacon.agent_id, offer.clone())
            .await
            .unwrap();
        let mut session = broker.sessions.get(descriptor.session_id).await.unwrap().unwrap();
        session.status = BrokerSessionStatus::OffersReady;
        broker.sessions.put(session).await.unwrap();

        let storage = MemoryStorage::new();
        let signer = KeyIdentity::load_or_generate(&storage, "scout").unwrap();
        // Budget below the 42500 offer total.
        let (intent, cart, payment) =
            chain_for(&signer, scout, descriptor.session_id, &offer, 40_000.0);

        let err = broker
            .commit_session(
                descriptor.session_id,
                scout,
                CommitRequest {
                    offer_id,
                    idempotency_key: "commit-2".to_string(),
                    intent_mandate: intent,
                    cart_mandate: cart,
                    payment_mandate: payment,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AccordError::MandateChain(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_commit_blocks_it() {
        let broker = broker_with_window(Duration::seconds(3600));
        let scout = Uuid::new_v4();
        let descriptor = broker.open_session(widget_request(scout)).await.unwrap();

        broker.cancel_session(descriptor.session_id, scout).await.unwrap();
        broker.cancel_session(descriptor.session_id, scout).await.unwrap();

        let descriptor = broker.describe_session(descriptor.session_id).await.unwrap();
        assert_eq!(descriptor.status, BrokerSessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn candidate_ranking_orders_returned_offers() {
        let broker = broker_with_window(Duration::seconds(3600));
        let weak = register_beacon(&broker, "widgets").await;
        let strong = register_beacon(&broker, "industrial widgets supplier").await;
        let descriptor = broker.open_session(widget_request(Uuid::new_v4())).await.unwrap();

        // Submit in reverse rank order.
        let weak_offer = Offer::new(
            weak.agent_id,
            weak.name.clone(),
            "widgets".to_string(),
            90.0,
            500,
            "USD".to_string(),
        );
        let strong_offer = Offer::new(
            strong.agent_id,
            strong.name.clone(),
            "industrial widgets".to_string(),
            85.0,
            500,
            "USD".to_string(),
        );
        broker
            .submit_offer(descriptor.session_id, weak.agent_id, weak_offer)
            .await
            .unwrap();
        broker
            .submit_offer(descriptor.session_id, strong.agent_id, strong_offer.clone())
            .await
            .unwrap();

        let offers = broker.session_offers(descriptor.session_id).await.unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].seller_id, strong.agent_id);
    }
}
