use crate::error::{AccordError, Result};
use crate::identity::{decode_public_key, decode_signature, KeyIdentity};
use crate::model::{Offer, ProposedPurchase};
use crate::{AgentId, OfferId, SessionId};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Applied when an intent mandate is issued without a currency.
pub const DEFAULT_CURRENCY: &str = "USD";

/// A cart represents a time-boxed purchase decision; the expiry is fixed
/// protocol-wide.
pub const CART_MANDATE_TTL_MINS: i64 = 30;

const PROOF_TYPE: &str = "Ed25519Signature2020";

/// Signature envelope attached to every mandate. `verification_method`
/// carries the issuer's base64 raw public key so the chain can be verified
/// without any registry lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: DateTime<Utc>,
    pub verification_method: String,
    pub proof_value: String,
}

/// Spending bounds a human grants an agent. Unset optional fields mean
/// "unrestricted"; nothing restrictive is ever defaulted permissive behind
/// the issuer's back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConstraints {
    pub max_amount: f64,
    pub currency: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub merchant_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub merchant_blocklist: Option<Vec<String>>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub require_user_present: bool,
    #[serde(default)]
    pub max_transactions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMandate {
    pub id: Uuid,
    /// The human who authorized the spend.
    pub issuer: String,
    /// The agent authorized to spend.
    pub subject: AgentId,
    pub constraints: IntentConstraints,
    pub proof: Proof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartContents {
    pub session_id: SessionId,
    pub offer_id: OfferId,
    pub total_amount: f64,
    pub currency: String,
    pub merchant_id: AgentId,
    pub merchant_name: String,
    pub items: Vec<CartItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartMandate {
    pub id: Uuid,
    pub intent_mandate_ref: Option<Uuid>,
    pub cart: CartContents,
    pub user_present: bool,
    pub expires_at: DateTime<Utc>,
    pub proof: Proof,
}

impl CartMandate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAgent {
    pub id: AgentId,
    #[serde(default)]
    pub delegated_identity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub amount: f64,
    pub currency: String,
    pub merchant_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    #[serde(rename = "type")]
    pub method_type: String,
    pub network: String,
    /// Always true: a mandate carries a tokenized authorization, never raw
    /// payment credentials.
    pub tokenized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSignals {
    pub intent_mandate_present: bool,
    pub user_auth_time: DateTime<Utc>,
    pub agent_session_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMandate {
    pub id: Uuid,
    pub cart_mandate_ref: Uuid,
    pub agent: PaymentAgent,
    pub transaction: PaymentTransaction,
    pub payment_method: PaymentMethod,
    pub risk_signals: RiskSignals,
    pub proof: Proof,
}

/// Serializes a mandate minus its proof. serde_json orders object keys
/// deterministically, so both sides of a verification produce identical
/// bytes.
fn signing_bytes<T: Serialize>(mandate: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(mandate)?;
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("proof");
    }
    Ok(serde_json::to_vec(&value)?)
}

fn unsigned_proof(now: DateTime<Utc>, signer: &KeyIdentity) -> Proof {
    Proof {
        proof_type: PROOF_TYPE.to_string(),
        created: now,
        verification_method: signer.public_key_base64(),
        proof_value: String::new(),
    }
}

fn attach_signature<T: Serialize>(mandate: &T, signer: &KeyIdentity) -> Result<String> {
    Ok(signer.sign(&signing_bytes(mandate)?))
}

fn verify_proof<T: Serialize>(mandate: &T, proof: &Proof, label: &str) -> Result<()> {
    let public_key = decode_public_key(&proof.verification_method)
        .map_err(|e| AccordError::MandateChain(format!("{} proof key: {}", label, e)))?;
    let signature = decode_signature(&proof.proof_value)
        .map_err(|e| AccordError::MandateChain(format!("{} proof signature: {}", label, e)))?;
    let bytes = signing_bytes(mandate)?;
    public_key
        .verify(&bytes, &signature)
        .map_err(|_| AccordError::MandateChain(format!("{} proof verification failed", label)))
}

/// Builds and signs an Intent Mandate. Currency defaults to
/// [`DEFAULT_CURRENCY`] if unspecified; every other unset field stays
/// unset, meaning unrestricted.
pub fn create_intent_mandate(
    signer: &KeyIdentity,
    agent_id: AgentId,
    user_id: &str,
    mut constraints: IntentConstraints,
    now: DateTime<Utc>,
) -> Result<IntentMandate> {
    if constraints.max_amount <= 0.0 {
        return Err(AccordError::Validation(
            "intent mandate max_amount must be positive".to_string(),
        ));
    }
    if constraints.currency.is_empty() {
        constraints.currency = DEFAULT_CURRENCY.to_string();
    }

    let mut mandate = IntentMandate {
        id: Uuid::new_v4(),
        issuer: user_id.to_string(),
        subject: agent_id,
        constraints,
        proof: unsigned_proof(now, signer),
    };
    mandate.proof.proof_value = attach_signature(&mandate, signer)?;
    Ok(mandate)
}

/// Binds one specific offer to one specific intent mandate. The cart total
/// is taken from the offer's supplied total, never re-derived from unit
/// price and quantity, so the authorized amount matches what was displayed.
pub fn create_cart_mandate(
    signer: &KeyIdentity,
    session_id: SessionId,
    offer: &Offer,
    intent_mandate_ref: Option<Uuid>,
    user_present: bool,
    now: DateTime<Utc>,
) -> Result<CartMandate> {
    let mut mandate = CartMandate {
        id: Uuid::new_v4(),
        intent_mandate_ref,
        cart: CartContents {
            session_id,
            offer_id: offer.id,
            total_amount: offer.total_price,
            currency: offer.currency.clone(),
            merchant_id: offer.seller_id,
            merchant_name: offer.seller_name.clone(),
            items: vec![CartItem {
                description: offer.product.clone(),
                quantity: offer.quantity,
                unit_price: offer.unit_price,
            }],
        },
        user_present,
        expires_at: now + Duration::minutes(CART_MANDATE_TTL_MINS),
        proof: unsigned_proof(now, signer),
    };
    mandate.proof.proof_value = attach_signature(&mandate, signer)?;
    Ok(mandate)
}

/// References the cart mandate and records the risk signals a downstream
/// processor needs. `tokenized` is forced true regardless of input.
pub fn create_payment_mandate(
    signer: &KeyIdentity,
    cart: &CartMandate,
    method_type: &str,
    network: &str,
    agent_id: AgentId,
    session_started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PaymentMandate> {
    let mut mandate = PaymentMandate {
        id: Uuid::new_v4(),
        cart_mandate_ref: cart.id,
        agent: PaymentAgent {
            id: agent_id,
            delegated_identity_id: None,
        },
        transaction: PaymentTransaction {
            amount: cart.cart.total_amount,
            currency: cart.cart.currency.clone(),
            merchant_id: cart.cart.merchant_id,
        },
        payment_method: PaymentMethod {
            method_type: method_type.to_string(),
            network: network.to_string(),
            tokenized: true,
        },
        risk_signals: RiskSignals {
            intent_mandate_present: cart.intent_mandate_ref.is_some(),
            user_auth_time: cart.proof.created,
            agent_session_duration_secs: (now - session_started_at).num_seconds().max(0),
        },
        proof: unsigned_proof(now, signer),
    };
    mandate.proof.proof_value = attach_signature(&mandate, signer)?;
    Ok(mandate)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

fn merchant_matches(entry: &str, purchase: &ProposedPurchase) -> bool {
    entry.eq_ignore_ascii_case(&purchase.merchant_name)
        || entry.eq_ignore_ascii_case(&purchase.merchant_id.to_string())
}

/// The authorization gate invoked before committing to any offer. Never
/// panics and never fails fast: every violated rule is accumulated so the
/// caller can present the complete reason list.
pub fn validate_intent_coverage(
    intent: &IntentMandate,
    purchase: &ProposedPurchase,
    now: DateTime<Utc>,
) -> CoverageResult {
    let constraints = &intent.constraints;
    let mut errors = Vec::new();

    if purchase.total_amount > constraints.max_amount {
        errors.push(format!(
            "Amount {:.2} exceeds max {:.2}",
            purchase.total_amount, constraints.max_amount
        ));
    }

    if !purchase.currency.eq_ignore_ascii_case(&constraints.currency) {
        errors.push(format!(
            "Currency mismatch: mandate authorizes {}, purchase is {}",
            constraints.currency, purchase.currency
        ));
    }

    if !constraints.categories.is_empty() {
        let permitted = purchase
            .category
            .as_deref()
            .map(|c| constraints.categories.iter().any(|p| p.eq_ignore_ascii_case(c)))
            .unwrap_or(false);
        if !permitted {
            errors.push(format!(
                "Category not permitted: {}",
                purchase.category.as_deref().unwrap_or("(none)")
            ));
        }
    }

    if let Some(allowlist) = &constraints.merchant_allowlist {
        if !allowlist.is_empty() && !allowlist.iter().any(|m| merchant_matches(m, purchase)) {
            errors.push(format!("merchant not in allowlist: {}", purchase.merchant_name));
        }
    }

    if let Some(blocklist) = &constraints.merchant_blocklist {
        if blocklist.iter().any(|m| merchant_matches(m, purchase)) {
            errors.push(format!("merchant blocklisted: {}", purchase.merchant_name));
        }
    }

    if let Some(valid_from) = constraints.valid_from {
        if now < valid_from {
            errors.push("mandate not yet valid".to_string());
        }
    }
    if let Some(valid_until) = constraints.valid_until {
        if now > valid_until {
            errors.push("mandate expired".to_string());
        }
    }

    CoverageResult {
        valid: errors.is_empty(),
        errors,
    }
}

pub fn verify_intent_proof(intent: &IntentMandate) -> Result<()> {
    verify_proof(intent, &intent.proof, "intent mandate")
}

pub fn verify_cart_proof(cart: &CartMandate) -> Result<()> {
    verify_proof(cart, &cart.proof, "cart mandate")
}

pub fn verify_payment_proof(payment: &PaymentMandate) -> Result<()> {
    verify_proof(payment, &payment.proof, "payment mandate")
}

/// A chain is transaction-ready only if intent coverage passes, the cart
/// references that exact intent, the payment references that exact cart,
/// the cart is unexpired, and every proof verifies. Broken or re-pointed
/// references are fatal, never silently accepted.
pub fn verify_chain(
    intent: &IntentMandate,
    cart: &CartMandate,
    payment: &PaymentMandate,
    purchase: &ProposedPurchase,
    now: DateTime<Utc>,
) -> Result<()> {
    verify_intent_proof(intent)?;
    verify_cart_proof(cart)?;
    verify_payment_proof(payment)?;

    if cart.intent_mandate_ref != Some(intent.id) {
        return Err(AccordError::MandateChain(
            "cart mandate does not reference the presented intent mandate".to_string(),
        ));
    }
    if payment.cart_mandate_ref != cart.id {
        return Err(AccordError::MandateChain(
            "payment mandate does not reference the presented cart mandate".to_string(),
        ));
    }
    if cart.is_expired(now) {
        return Err(AccordError::MandateChain("cart mandate expired".to_string()));
    }
    if !payment.payment_method.tokenized {
        return Err(AccordError::MandateChain(
            "payment mandate must carry a tokenized method".to_string(),
        ));
    }
    if (payment.transaction.amount - cart.cart.total_amount).abs() > f64::EPSILON {
        return Err(AccordError::MandateChain(format!(
            "payment amount {:.2} does not match cart total {:.2}",
            payment.transaction.amount, cart.cart.total_amount
        )));
    }

    let coverage = validate_intent_coverage(intent, purchase, now);
    if !coverage.valid {
        return Err(AccordError::MandateChain(coverage.errors.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Offer;

    fn signer() -> KeyIdentity {
        KeyIdentity::generate()
    }

    fn constraints(max_amount: f64) -> IntentConstraints {
        IntentConstraints {
            max_amount,
            currency: String::new(),
            categories: vec![],
            merchant_allowlist: None,
            merchant_blocklist: None,
            valid_from: None,
            valid_until: None,
            require_user_present: false,
            max_transactions: None,
        }
    }

    fn sample_offer() -> Offer {
        let mut offer = Offer::new(
            Uuid::new_v4(),
            "Widget Forge".to_string(),
            "industrial widgets".to_string(),
            85.0,
            500,
            "USD".to_string(),
        );
        offer.total_price = 42_500.0;
        offer
    }

    fn purchase(total: f64, currency: &str, category: Option<&str>) -> ProposedPurchase {
        ProposedPurchase {
            total_amount: total,
            currency: currency.to_string(),
            category: category.map(str::to_string),
            merchant_id: Uuid::new_v4(),
            merchant_name: "Widget Forge".to_string(),
        }
    }

    #[test]
    fn currency_defaults_but_limits_do_not() {
        let mandate = create_intent_mandate(
            &signer(),
            Uuid::new_v4(),
            "user-1",
            constraints(50_000.0),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(mandate.constraints.currency, DEFAULT_CURRENCY);
        assert!(mandate.constraints.merchant_allowlist.is_none());
        assert!(mandate.constraints.valid_until.is_none());
    }

    #[test]
    fn coverage_accumulates_all_violations() {
        let mut limits = constraints(1_500.0);
        limits.currency = "USD".to_string();
        limits.categories = vec!["electronics".to_string()];
        let mandate =
            create_intent_mandate(&signer(), Uuid::new_v4(), "user-1", limits, Utc::now()).unwrap();

        let result = validate_intent_coverage(
            &mandate,
            &purchase(2_000.0, "EUR", Some("travel")),
            Utc::now(),
        );
        assert!(!result.valid);
        assert!(result.errors.len() >= 3, "got {:?}", result.errors);
        assert!(result.errors.iter().any(|e| e.contains("exceeds max")));
        assert!(result.errors.iter().any(|e| e.contains("Currency mismatch")));
        assert!(result.errors.iter().any(|e| e.contains("Category not permitted")));
    }

    #[test]
    fn coverage_checks_validity_window_and_merchants() {
        let now = Utc::now();
        let mut limits = constraints(50_000.0);
        limits.currency = "USD".to_string();
        limits.merchant_allowlist = Some(vec!["Acme Supply".to_string()]);
        limits.merchant_blocklist = Some(vec!["Widget Forge".to_string()]);
        limits.valid_until = Some(now - Duration::hours(1));
        let mandate =
            create_intent_mandate(&signer(), Uuid::new_v4(), "user-1", limits, now).unwrap();

        let result = validate_intent_coverage(&mandate, &purchase(100.0, "USD", None), now);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("not in allowlist")));
        assert!(result.errors.iter().any(|e| e.contains("blocklisted")));
        assert!(result.errors.iter().any(|e| e.contains("mandate expired")));
    }

    #[test]
    fn cart_total_comes_from_offer_total() {
        let key = signer();
        let mut offer = sample_offer();
        // Supplied total deliberately differs from unit * quantity.
        offer.total_price = 42_000.0;
        let cart = create_cart_mandate(
            &key,
            Uuid::new_v4(),
            &offer,
            Some(Uuid::new_v4()),
            true,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cart.cart.total_amount, 42_000.0);
    }

    #[test]
    fn payment_mandate_is_always_tokenized() {
        let key = signer();
        let now = Utc::now();
        let cart = create_cart_mandate(
            &key,
            Uuid::new_v4(),
            &sample_offer(),
            None,
            false,
            now,
        )
        .unwrap();
        let payment = create_payment_mandate(&key, &cart, "card", "visa", Uuid::new_v4(), now, now)
            .unwrap();
        assert!(payment.payment_method.tokenized);
        assert!(!payment.risk_signals.intent_mandate_present);
    }

    #[test]
    fn tampered_mandate_fails_proof_verification() {
        let key = signer();
        let mut mandate = create_intent_mandate(
            &key,
            Uuid::new_v4(),
            "user-1",
            constraints(1_000.0),
            Utc::now(),
        )
        .unwrap();
        assert!(verify_intent_proof(&mandate).is_ok());

        mandate.constraints.max_amount = 1_000_000.0;
        assert!(verify_intent_proof(&mandate).is_err());
    }

    #[test]
    fn repointed_payment_reference_is_rejected() {
        let key = signer();
        let now = Utc::now();
        let offer = sample_offer();
        let mut limits = constraints(50_000.0);
        limits.currency = "USD".to_string();
        let intent =
            create_intent_mandate(&key, Uuid::new_v4(), "user-1", limits, now).unwrap();
        let session_id = Uuid::new_v4();
        let cart = create_cart_mandate(&key, session_id, &offer, Some(intent.id), true, now)
            .unwrap();
        let mut payment =
            create_payment_mandate(&key, &cart, "card", "visa", Uuid::new_v4(), now, now).unwrap();

        let proposed = ProposedPurchase::from_offer(&offer, None);
        assert!(verify_chain(&intent, &cart, &payment, &proposed, now).is_ok());

        // Re-point the payment at a different cart and re-sign it; the chain
        // must still be rejected.
        payment.cart_mandate_ref = Uuid::new_v4();
        payment.proof.proof_value = key.sign(&signing_bytes(&payment).unwrap());
        let err = verify_chain(&intent, &cart, &payment, &proposed, now).unwrap_err();
        assert!(matches!(err, AccordError::MandateChain(_)));
    }

    #[test]
    fn expired_cart_breaks_the_chain() {
        let key = signer();
        let created = Utc::now() - Duration::minutes(CART_MANDATE_TTL_MINS + 5);
        let offer = sample_offer();
        let mut limits = constraints(50_000.0);
        limits.currency = "USD".to_string();
        let intent =
            create_intent_mandate(&key, Uuid::new_v4(), "user-1", limits, created).unwrap();
        let cart = create_cart_mandate(
            &key,
            Uuid::new_v4(),
            &offer,
            Some(intent.id),
            true,
            created,
        )
        .unwrap();
        let payment =
            create_payment_mandate(&key, &cart, "card", "visa", Uuid::new_v4(), created, created)
                .unwrap();

        let proposed = ProposedPurchase::from_offer(&offer, None);
        let err = verify_chain(&intent, &cart, &payment, &proposed, Utc::now()).unwrap_err();
        match err {
            AccordError::MandateChain(msg) => assert!(msg.contains("expired")),
            other => panic!("expected mandate chain error, got {:?}", other),
        }
    }
}
