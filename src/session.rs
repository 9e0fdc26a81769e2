use crate::client::BrokerClient;
use crate::constraint::{rank_offers, Constraint, ScoredOffer};
use crate::error::{AccordError, Result};
use crate::intent::{IntentInterpreter, KeywordInterpreter};
use crate::mandate::{CartMandate, IntentMandate, PaymentMandate};
use crate::model::{
    BrokerSessionStatus, CommitRequest, CreateSessionRequest, StructuredRequirements, Transaction,
};
use crate::storage::StorageAdapter;
use crate::{AgentId, OfferId, SessionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoutState {
    Idle,
    Searching,
    OffersReady,
    MandateFlow,
    Checkout,
    Confirmation,
    Error,
}

impl ScoutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScoutState::Confirmation | ScoutState::Error)
    }
}

/// Input to the state machine. Poll ticks, push notifications, and user
/// actions all arrive here, so there is exactly one write path into the
/// session.
#[derive(Debug, Clone)]
pub enum SessionInput {
    IntentSubmitted(SessionId),
    BrokerStatus(BrokerSessionStatus),
    OffersFetched(Vec<ScoredOffer>),
    /// Local offer ranking hit a fatal constraint-evaluation error.
    RankingFailed(String),
    PollCeilingExceeded,
    OfferSelected(OfferId),
    CommitStarted,
    CommitSucceeded(Uuid),
    CommitFailed(String),
    Cancelled,
}

/// Outbound notification produced by a transition, consumed by whatever
/// dispatcher (UI, log, test) subscribed. The state machine knows nothing
/// about the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ScoutState),
    OffersAvailable(usize),
    OfferSelected(OfferId),
    TransactionCompleted(Uuid),
    SessionFailed(String),
}

/// The pure state-transition function. User actions in the wrong state are
/// session errors; stale or duplicated status inputs (a dropped or
/// reordered push, a poll racing a push) are benign no-ops, which is what
/// makes the push channel a pure latency optimization.
pub fn transition(
    state: ScoutState,
    input: &SessionInput,
) -> Result<(ScoutState, Vec<SessionEvent>)> {
    use ScoutState::*;

    let outcome = match (state, input) {
        (Idle, SessionInput::IntentSubmitted(_)) => {
            (Searching, vec![SessionEvent::StateChanged(Searching)])
        }
        (_, SessionInput::IntentSubmitted(_)) => {
            return Err(AccordError::Session(
                "a negotiation session is already active".to_string(),
            ));
        }

        (Searching, SessionInput::BrokerStatus(status)) => match status {
            BrokerSessionStatus::Cancelled | BrokerSessionStatus::Committed => (
                Error,
                vec![
                    SessionEvent::StateChanged(Error),
                    SessionEvent::SessionFailed(format!(
                        "broker reported terminal status {:?} while searching",
                        status
                    )),
                ],
            ),
            _ => (Searching, vec![]),
        },
        (_, SessionInput::BrokerStatus(_)) => (state, vec![]),

        (Searching, SessionInput::OffersFetched(offers)) => (
            OffersReady,
            vec![
                SessionEvent::StateChanged(OffersReady),
                SessionEvent::OffersAvailable(offers.len()),
            ],
        ),
        (_, SessionInput::OffersFetched(_)) => (state, vec![]),

        (Searching, SessionInput::RankingFailed(reason)) => (
            Error,
            vec![
                SessionEvent::StateChanged(Error),
                SessionEvent::SessionFailed(reason.clone()),
            ],
        ),
        (_, SessionInput::RankingFailed(_)) => (state, vec![]),

        (Searching, SessionInput::PollCeilingExceeded) => (
            Error,
            vec![
                SessionEvent::StateChanged(Error),
                SessionEvent::SessionFailed("no offers arrived before the poll ceiling".to_string()),
            ],
        ),
        (_, SessionInput::PollCeilingExceeded) => (state, vec![]),

        (OffersReady, SessionInput::OfferSelected(offer_id)) => (
            MandateFlow,
            vec![
                SessionEvent::StateChanged(MandateFlow),
                SessionEvent::OfferSelected(*offer_id),
            ],
        ),
        (_, SessionInput::OfferSelected(_)) => {
            return Err(AccordError::Session(
                "cannot select an offer before offers are ready".to_string(),
            ));
        }

        (MandateFlow, SessionInput::CommitStarted) => {
            (Checkout, vec![SessionEvent::StateChanged(Checkout)])
        }
        (_, SessionInput::CommitStarted) => {
            return Err(AccordError::Session(
                "commit requires a selected offer and an authorized mandate chain".to_string(),
            ));
        }

        (Checkout, SessionInput::CommitSucceeded(tx_id)) => (
            Confirmation,
            vec![
                SessionEvent::StateChanged(Confirmation),
                SessionEvent::TransactionCompleted(*tx_id),
            ],
        ),
        (_, SessionInput::CommitSucceeded(_)) => (state, vec![]),

        (Checkout, SessionInput::CommitFailed(reason)) => (
            Error,
            vec![
                SessionEvent::StateChanged(Error),
                SessionEvent::SessionFailed(reason.clone()),
            ],
        ),
        (_, SessionInput::CommitFailed(_)) => (state, vec![]),

        (Confirmation, SessionInput::Cancelled) => {
            return Err(AccordError::Session(
                "cannot cancel a confirmed session".to_string(),
            ));
        }
        (_, SessionInput::Cancelled) => (Idle, vec![SessionEvent::StateChanged(Idle)]),
    };

    Ok(outcome)
}

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub poll_interval: std::time::Duration,
    pub poll_ceiling: u32,
    /// Storage namespace for key material and crash-recovery state.
    pub namespace: String,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(500),
            poll_ceiling: 20,
            namespace: "scout".to_string(),
        }
    }
}

#[derive(Default)]
struct ScoutCore {
    state: ScoutStateCell,
    session_id: Option<SessionId>,
    requirements: StructuredRequirements,
    constraints: Vec<Constraint>,
    offers: Vec<ScoredOffer>,
    selected: Option<OfferId>,
    idempotency_key: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScoutStateCell(ScoutState);

impl Default for ScoutStateCell {
    fn default() -> Self {
        Self(ScoutState::Idle)
    }
}

struct ScoutShared {
    core: Mutex<ScoutCore>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    poll_active: AtomicBool,
}

impl ScoutShared {
    fn state(&self) -> ScoutState {
        self.core.lock().state.0
    }

    /// The single write path. Runs the pure transition under the session
    /// lock, applies the input's data effects, then dispatches events
    /// outside the lock.
    fn apply(&self, input: SessionInput) -> Result<ScoutState> {
        let (new_state, events) = {
            let mut core = self.core.lock();
            let (new_state, events) = transition(core.state.0, &input)?;
            core.state = ScoutStateCell(new_state);
            match input {
                SessionInput::IntentSubmitted(session_id) => {
                    core.session_id = Some(session_id);
                    core.started_at = Some(Utc::now());
                }
                SessionInput::OffersFetched(offers) => {
                    if core.offers.is_empty() {
                        core.offers = offers;
                    }
                }
                SessionInput::OfferSelected(offer_id) => core.selected = Some(offer_id),
                SessionInput::Cancelled => {
                    core.session_id = None;
                    core.offers.clear();
                    core.selected = None;
                    core.idempotency_key = None;
                }
                _ => {}
            }
            (new_state, events)
        };

        if let Some(sender) = self.events.lock().as_ref() {
            for event in events {
                let _ = sender.send(event);
            }
        }
        Ok(new_state)
    }
}

/// Buyer-side negotiation session. Drives the broker through intent
/// submission, offer collection, local ranking, mandate-gated commit, and
/// cancellation. Polling is the correctness-bearing mechanism; push
/// notifications arrive through [`Scout::notify_status`] and may be
/// dropped or reordered without changing behavior.
pub struct Scout {
    client: Arc<dyn BrokerClient>,
    storage: Arc<dyn StorageAdapter>,
    agent_id: AgentId,
    config: ScoutConfig,
    shared: Arc<ScoutShared>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scout {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        storage: Arc<dyn StorageAdapter>,
        agent_id: AgentId,
        config: ScoutConfig,
    ) -> Self {
        Self {
            client,
            storage,
            agent_id,
            config,
            shared: Arc::new(ScoutShared {
                core: Mutex::new(ScoutCore::default()),
                events: Mutex::new(None),
                poll_active: AtomicBool::new(false),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Registers the single event sink. Events emitted before subscription
    /// are dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.shared.events.lock() = Some(sender);
        receiver
    }

    pub fn state(&self) -> ScoutState {
        self.shared.state()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.core.lock().session_id
    }

    /// When the current session was opened. Feeds the payment mandate's
    /// session-duration risk signal.
    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.core.lock().started_at
    }

    pub fn offers(&self) -> Vec<ScoredOffer> {
        self.shared.core.lock().offers.clone()
    }

    pub fn selected_offer(&self) -> Option<ScoredOffer> {
        let core = self.shared.core.lock();
        let selected = core.selected?;
        core.offers.iter().find(|o| o.offer.id == selected).cloned()
    }

    fn recovery_key(&self) -> String {
        format!("{}:active_session", self.config.namespace)
    }

    /// Session id persisted for crash recovery, if any.
    pub fn recover_session_id(&self) -> Result<Option<SessionId>> {
        match self.storage.get(&self.recovery_key())? {
            Some(raw) => Ok(Some(raw.parse().map_err(|_| {
                AccordError::Storage("corrupt persisted session id".to_string())
            })?)),
            None => Ok(None),
        }
    }

    /// Submits intent to the broker and starts polling. Transitions to
    /// `Searching` synchronously; offers arrive via the poll loop or a
    /// push notification.
    pub async fn start(&self, intent: &str, constraints: Vec<Constraint>) -> Result<SessionId> {
        {
            let mut core = self.shared.core.lock();
            if core.state.0 == ScoutState::Error {
                *core = ScoutCore::default();
            } else if core.state.0 != ScoutState::Idle {
                return Err(AccordError::Session(
                    "a negotiation session is already active".to_string(),
                ));
            }
            // Local requirements mirror what the broker extracts, so
            // ranking works without a second round trip.
            core.requirements = KeywordInterpreter::new().parse(intent, &constraints)?;
            core.constraints = constraints.clone();
        }

        let descriptor = self
            .client
            .create_session(CreateSessionRequest {
                intent: intent.to_string(),
                agent_id: self.agent_id,
                constraints,
            })
            .await?;

        self.storage
            .set(&self.recovery_key(), &descriptor.session_id.to_string())?;
        self.shared
            .apply(SessionInput::IntentSubmitted(descriptor.session_id))?;
        self.start_polling()?;
        Ok(descriptor.session_id)
    }

    /// Starts the poll loop. Idempotent: calling while a loop is active is
    /// a no-op, not a duplicate timer.
    pub fn start_polling(&self) -> Result<()> {
        if self.shared.poll_active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session_id) = self.session_id() else {
            self.shared.poll_active.store(false, Ordering::SeqCst);
            return Err(AccordError::Session("no active session to poll".to_string()));
        };

        let shared = self.shared.clone();
        let client = self.client.clone();
        let interval = self.config.poll_interval;
        let ceiling = self.config.poll_ceiling;
        let (requirements, constraints) = {
            let core = self.shared.core.lock();
            (core.requirements.clone(), core.constraints.clone())
        };

        let handle = tokio::spawn(async move {
            let mut resolved = false;
            for _ in 0..ceiling {
                tokio::time::sleep(interval).await;
                if !shared.poll_active.load(Ordering::SeqCst) {
                    return;
                }
                if shared.state() != ScoutState::Searching {
                    // A push notification already advanced the session.
                    resolved = true;
                    break;
                }
                match client.get_session(session_id).await {
                    Ok(descriptor) => match descriptor.status {
                        BrokerSessionStatus::OffersReady => {
                            fetch_and_apply_offers(
                                &shared,
                                client.as_ref(),
                                session_id,
                                &requirements,
                                &constraints,
                            )
                            .await;
                            resolved = true;
                            break;
                        }
                        status if status.is_terminal() => {
                            let _ = shared.apply(SessionInput::BrokerStatus(status));
                            resolved = true;
                            break;
                        }
                        status => {
                            let _ = shared.apply(SessionInput::BrokerStatus(status));
                        }
                    },
                    Err(e) => {
                        // Connection errors are retried on the next tick;
                        // the ceiling bounds the total wait.
                        tracing::warn!(session_id = %session_id, error = %e, "session poll failed");
                    }
                }
            }
            if !resolved && shared.state() == ScoutState::Searching {
                let _ = shared.apply(SessionInput::PollCeilingExceeded);
            }
            shared.poll_active.store(false, Ordering::SeqCst);
        });
        *self.poll_task.lock() = Some(handle);
        Ok(())
    }

    fn stop_polling(&self) {
        self.shared.poll_active.store(false, Ordering::SeqCst);
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }

    /// Push-channel entry point. Routes through the same transition
    /// function as the poll loop, so duplicates and reordering are safe.
    pub async fn notify_status(&self, status: BrokerSessionStatus) -> Result<()> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };
        if status == BrokerSessionStatus::OffersReady && self.state() == ScoutState::Searching {
            let (requirements, constraints) = {
                let core = self.shared.core.lock();
                (core.requirements.clone(), core.constraints.clone())
            };
            fetch_and_apply_offers(
                &self.shared,
                self.client.as_ref(),
                session_id,
                &requirements,
                &constraints,
            )
            .await;
        } else {
            self.shared.apply(SessionInput::BrokerStatus(status))?;
        }
        Ok(())
    }

    /// Selects an offer for the mandate flow. The id must belong to the
    /// fetched set and the offer must be free of hard-constraint
    /// violations.
    pub fn select_offer(&self, offer_id: OfferId) -> Result<()> {
        {
            let core = self.shared.core.lock();
            let scored = core
                .offers
                .iter()
                .find(|o| o.offer.id == offer_id)
                .ok_or(AccordError::OfferNotFound(offer_id))?;
            if !scored.eligible() {
                return Err(AccordError::Constraint(format!(
                    "offer violates hard constraints: {}",
                    scored.violations.join("; ")
                )));
            }
        }
        self.shared.apply(SessionInput::OfferSelected(offer_id))?;
        Ok(())
    }

    /// Commits the selected offer under the supplied mandate chain. The
    /// persisted crash-recovery session id is cleared once the commit has
    /// been attempted, whatever the outcome.
    pub async fn commit(
        &self,
        intent_mandate: IntentMandate,
        cart_mandate: CartMandate,
        payment_mandate: PaymentMandate,
    ) -> Result<Transaction> {
        let (session_id, offer_id, idempotency_key) = {
            let mut core = self.shared.core.lock();
            let session_id = core
                .session_id
                .ok_or_else(|| AccordError::Session("no active session".to_string()))?;
            let offer_id = core
                .selected
                .ok_or_else(|| AccordError::Session("no offer selected".to_string()))?;
            let key = core
                .idempotency_key
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            (session_id, offer_id, key)
        };

        self.shared.apply(SessionInput::CommitStarted)?;
        let result = self
            .client
            .commit(
                session_id,
                CommitRequest {
                    offer_id,
                    idempotency_key,
                    intent_mandate,
                    cart_mandate,
                    payment_mandate,
                },
            )
            .await;

        // The commit outcome must reach the caller even if clearing the
        // crash-recovery marker fails.
        if let Err(e) = self.storage.remove(&self.recovery_key()) {
            tracing::warn!(error = %e, "failed to clear persisted session marker");
        }

        match result {
            Ok(transaction) => {
                self.shared.apply(SessionInput::CommitSucceeded(transaction.id))?;
                Ok(transaction)
            }
            Err(e) => {
                self.shared.apply(SessionInput::CommitFailed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Cooperative cancellation: stops the poll task, tells the broker,
    /// and clears local session state. Offers already submitted remain
    /// with the broker as immutable history.
    pub async fn cancel(&self) -> Result<()> {
        self.stop_polling();
        let session_id = self.session_id();
        if let Some(session_id) = session_id {
            if let Err(e) = self.client.cancel(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "broker cancel failed");
            }
        }
        self.storage.remove(&self.recovery_key())?;
        self.shared.apply(SessionInput::Cancelled)?;
        Ok(())
    }
}

async fn fetch_and_apply_offers(
    shared: &ScoutShared,
    client: &dyn BrokerClient,
    session_id: SessionId,
    requirements: &StructuredRequirements,
    constraints: &[Constraint],
) {
    match client.get_offers(session_id).await {
        Ok(offers) => match rank_offers(&offers, requirements, constraints, Utc::now()) {
            Ok(scored) => {
                let _ = shared.apply(SessionInput::OffersFetched(scored));
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "offer ranking failed");
                let _ = shared.apply(SessionInput::RankingFailed(e.to_string()));
            }
        },
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "offer fetch failed");
        }
    }
}
