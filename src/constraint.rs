use crate::error::{AccordError, Result};
use crate::model::{Offer, StructuredRequirements};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed operator union. Anything outside this set is rejected when the
/// constraint is parsed, never at evaluation time, and there is no
/// default-permit branch anywhere in evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

/// Allow-listed offer fields a constraint may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintField {
    UnitPrice,
    TotalPrice,
    Quantity,
    Currency,
    DeliveryDate,
    SellerName,
    Product,
    Terms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Pass/fail eligibility rule; a violating offer is never committable.
    #[default]
    Hard,
    /// Weighted contributor to the ranking score, non-blocking.
    Soft,
}

pub const DEFAULT_SOFT_WEIGHT: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub field: ConstraintField,
    pub op: ConstraintOp,
    pub value: ConstraintValue,
    #[serde(default)]
    pub kind: ConstraintKind,
    /// Ranking weight for soft preferences; ignored for hard constraints.
    #[serde(default)]
    pub weight: Option<f64>,
}

impl Constraint {
    pub fn hard(field: ConstraintField, op: ConstraintOp, value: ConstraintValue) -> Self {
        Self { field, op, value, kind: ConstraintKind::Hard, weight: None }
    }

    pub fn soft(
        field: ConstraintField,
        op: ConstraintOp,
        value: ConstraintValue,
        weight: Option<f64>,
    ) -> Self {
        Self { field, op, value, kind: ConstraintKind::Soft, weight }
    }

    /// Evaluates the predicate against an offer. Type mismatches between
    /// the field and the comparison value are errors, not silent passes.
    pub fn evaluate(&self, offer: &Offer) -> Result<bool> {
        match self.field {
            ConstraintField::UnitPrice => self.compare_number(offer.unit_price),
            ConstraintField::TotalPrice => self.compare_number(offer.total_price),
            ConstraintField::Quantity => self.compare_number(offer.quantity as f64),
            ConstraintField::Currency => self.compare_text(&offer.currency),
            ConstraintField::SellerName => self.compare_text(&offer.seller_name),
            ConstraintField::Product => self.compare_text(&offer.product),
            ConstraintField::Terms => self.compare_text(offer.terms.as_deref().unwrap_or("")),
            ConstraintField::DeliveryDate => {
                let Some(delivery) = offer.delivery_date else {
                    // No declared delivery date cannot satisfy a date rule.
                    return Ok(false);
                };
                self.compare_date(delivery)
            }
        }
    }

    fn compare_number(&self, actual: f64) -> Result<bool> {
        let ConstraintValue::Number(expected) = self.value else {
            return Err(self.mismatch("a number"));
        };
        match self.op {
            ConstraintOp::Eq => Ok(actual == expected),
            ConstraintOp::Ne => Ok(actual != expected),
            ConstraintOp::Gt => Ok(actual > expected),
            ConstraintOp::Gte => Ok(actual >= expected),
            ConstraintOp::Lt => Ok(actual < expected),
            ConstraintOp::Lte => Ok(actual <= expected),
            ConstraintOp::Contains | ConstraintOp::In => Err(AccordError::Constraint(format!(
                "operator {:?} is not defined for numeric field {:?}",
                self.op, self.field
            ))),
        }
    }

    fn compare_text(&self, actual: &str) -> Result<bool> {
        match (&self.op, &self.value) {
            (ConstraintOp::Eq, ConstraintValue::Text(expected)) => {
                Ok(actual.eq_ignore_ascii_case(expected))
            }
            (ConstraintOp::Ne, ConstraintValue::Text(expected)) => {
                Ok(!actual.eq_ignore_ascii_case(expected))
            }
            (ConstraintOp::Contains, ConstraintValue::Text(expected)) => {
                Ok(actual.to_lowercase().contains(&expected.to_lowercase()))
            }
            (ConstraintOp::In, ConstraintValue::List(options)) => {
                Ok(options.iter().any(|o| o.eq_ignore_ascii_case(actual)))
            }
            (ConstraintOp::Eq | ConstraintOp::Ne | ConstraintOp::Contains, _) => {
                Err(self.mismatch("text"))
            }
            (ConstraintOp::In, _) => Err(self.mismatch("a list")),
            (op, _) => Err(AccordError::Constraint(format!(
                "operator {:?} is not defined for text field {:?}",
                op, self.field
            ))),
        }
    }

    fn compare_date(&self, actual: DateTime<Utc>) -> Result<bool> {
        let ConstraintValue::Text(expected) = &self.value else {
            return Err(self.mismatch("an RFC 3339 timestamp"));
        };
        let expected = DateTime::parse_from_rfc3339(expected)
            .map_err(|e| AccordError::Constraint(format!("bad timestamp in constraint: {}", e)))?
            .with_timezone(&Utc);
        match self.op {
            ConstraintOp::Eq => Ok(actual == expected),
            ConstraintOp::Ne => Ok(actual != expected),
            ConstraintOp::Gt => Ok(actual > expected),
            ConstraintOp::Gte => Ok(actual >= expected),
            ConstraintOp::Lt => Ok(actual < expected),
            ConstraintOp::Lte => Ok(actual <= expected),
            ConstraintOp::Contains | ConstraintOp::In => Err(AccordError::Constraint(format!(
                "operator {:?} is not defined for date field {:?}",
                self.op, self.field
            ))),
        }
    }

    fn mismatch(&self, expected: &str) -> AccordError {
        AccordError::Constraint(format!(
            "field {:?} with operator {:?} requires {} value",
            self.field, self.op, expected
        ))
    }

    fn describe(&self) -> String {
        format!("{:?} {:?} {:?}", self.field, self.op, self.value)
    }
}

/// An offer annotated with its ranking score and any hard-constraint
/// violations. Eligibility and score are independent: a high-scoring offer
/// that violates a hard constraint is never offerable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredOffer {
    pub offer: Offer,
    pub score: f64,
    pub violations: Vec<String>,
}

impl ScoredOffer {
    pub fn eligible(&self) -> bool {
        self.violations.is_empty()
    }
}

const BASE_SCORE: f64 = 50.0;
const BUDGET_BONUS_MAX: f64 = 20.0;
const DELIVERY_BONUS_MAX: f64 = 15.0;

/// Buyer-side ranking. Base 50, up to 20 for budget headroom, up to 15 for
/// early delivery, plus the weight of each satisfied soft preference,
/// clamped to [0, 100].
pub fn score_offer(
    offer: &Offer,
    requirements: &StructuredRequirements,
    constraints: &[Constraint],
    now: DateTime<Utc>,
) -> Result<ScoredOffer> {
    let mut score = BASE_SCORE;
    let mut violations = Vec::new();

    if let Some(max_budget) = requirements.max_budget {
        if max_budget > 0.0 {
            let headroom = (1.0 - offer.total_price / max_budget).clamp(0.0, 1.0);
            score += headroom * BUDGET_BONUS_MAX;
        }
    }

    if let (Some(deadline), Some(delivery)) = (requirements.deadline, offer.delivery_date) {
        let window = (deadline - now).num_seconds();
        let lead = (deadline - delivery).num_seconds();
        if window > 0 {
            let early = (lead as f64 / window as f64).clamp(0.0, 1.0);
            score += early * DELIVERY_BONUS_MAX;
        }
    }

    for constraint in constraints {
        let satisfied = constraint.evaluate(offer)?;
        match constraint.kind {
            ConstraintKind::Hard => {
                if !satisfied {
                    violations.push(constraint.describe());
                }
            }
            ConstraintKind::Soft => {
                if satisfied {
                    score += constraint.weight.unwrap_or(DEFAULT_SOFT_WEIGHT);
                }
            }
        }
    }

    Ok(ScoredOffer {
        offer: offer.clone(),
        score: score.clamp(0.0, 100.0),
        violations,
    })
}

/// Scores every offer and sorts descending. Evaluation errors (the fatal
/// input cases) abort the whole ranking rather than skipping an offer.
pub fn rank_offers(
    offers: &[Offer],
    requirements: &StructuredRequirements,
    constraints: &[Constraint],
    now: DateTime<Utc>,
) -> Result<Vec<ScoredOffer>> {
    let mut scored = offers
        .iter()
        .map(|offer| score_offer(offer, requirements, constraints, now))
        .collect::<Result<Vec<_>>>()?;
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn offer(total: f64) -> Offer {
        Offer {
            id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            seller_name: "Widget Forge".to_string(),
            product: "industrial widgets".to_string(),
            unit_price: total / 10.0,
            quantity: 10,
            total_price: total,
            currency: "USD".to_string(),
            delivery_date: None,
            terms: None,
        }
    }

    fn requirements(max_budget: f64) -> StructuredRequirements {
        StructuredRequirements {
            max_budget: Some(max_budget),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_operator_rejected_at_parse_time() {
        let raw = r#"{"field":"total_price","op":"matches","value":10}"#;
        assert!(serde_json::from_str::<Constraint>(raw).is_err());

        let raw = r#"{"field":"loyalty_tier","op":"eq","value":"gold"}"#;
        assert!(serde_json::from_str::<Constraint>(raw).is_err());
    }

    #[test]
    fn known_constraint_parses_with_hard_default() {
        let raw = r#"{"field":"total_price","op":"lte","value":50000}"#;
        let constraint: Constraint = serde_json::from_str(raw).unwrap();
        assert_eq!(constraint.kind, ConstraintKind::Hard);
        assert!(constraint.evaluate(&offer(42500.0)).unwrap());
        assert!(!constraint.evaluate(&offer(60000.0)).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_error_not_a_pass() {
        let constraint = Constraint::hard(
            ConstraintField::TotalPrice,
            ConstraintOp::Eq,
            ConstraintValue::Text("cheap".to_string()),
        );
        assert!(constraint.evaluate(&offer(100.0)).is_err());

        let constraint = Constraint::hard(
            ConstraintField::Currency,
            ConstraintOp::Gt,
            ConstraintValue::Text("USD".to_string()),
        );
        assert!(constraint.evaluate(&offer(100.0)).is_err());
    }

    #[test]
    fn in_operator_matches_case_insensitively() {
        let constraint = Constraint::hard(
            ConstraintField::Currency,
            ConstraintOp::In,
            ConstraintValue::List(vec!["usd".to_string(), "eur".to_string()]),
        );
        assert!(constraint.evaluate(&offer(100.0)).unwrap());
    }

    #[test]
    fn cheaper_eligible_offer_never_scores_lower() {
        let reqs = requirements(50_000.0);
        let now = Utc::now();
        let cheap = score_offer(&offer(30_000.0), &reqs, &[], now).unwrap();
        let pricey = score_offer(&offer(45_000.0), &reqs, &[], now).unwrap();
        assert!(cheap.score >= pricey.score);
    }

    #[test]
    fn hard_violation_makes_offer_ineligible_regardless_of_score() {
        let reqs = requirements(1_000_000.0);
        let constraints = vec![Constraint::hard(
            ConstraintField::Currency,
            ConstraintOp::Eq,
            ConstraintValue::Text("EUR".to_string()),
        )];
        let scored = score_offer(&offer(100.0), &reqs, &constraints, Utc::now()).unwrap();
        assert!(scored.score > 50.0);
        assert!(!scored.eligible());
        assert_eq!(scored.violations.len(), 1);
    }

    #[test]
    fn soft_preference_adds_default_weight() {
        let reqs = StructuredRequirements::default();
        let soft = vec![Constraint::soft(
            ConstraintField::SellerName,
            ConstraintOp::Contains,
            ConstraintValue::Text("forge".to_string()),
            None,
        )];
        let with = score_offer(&offer(100.0), &reqs, &soft, Utc::now()).unwrap();
        let without = score_offer(&offer(100.0), &reqs, &[], Utc::now()).unwrap();
        assert_eq!(with.score - without.score, DEFAULT_SOFT_WEIGHT);
    }

    #[test]
    fn early_delivery_earns_up_to_fifteen() {
        let now = Utc::now();
        let reqs = StructuredRequirements {
            deadline: Some(now + Duration::days(10)),
            ..Default::default()
        };
        let mut prompt = offer(100.0);
        prompt.delivery_date = Some(now + Duration::days(1));
        let mut slow = offer(100.0);
        slow.delivery_date = Some(now + Duration::days(9));

        let prompt_score = score_offer(&prompt, &reqs, &[], now).unwrap().score;
        let slow_score = score_offer(&slow, &reqs, &[], now).unwrap().score;
        assert!(prompt_score > slow_score);
        assert!(prompt_score <= 50.0 + DELIVERY_BONUS_MAX);
    }

    #[test]
    fn score_clamped_to_hundred() {
        let reqs = requirements(1_000_000.0);
        let soft: Vec<Constraint> = (0..20)
            .map(|_| {
                Constraint::soft(
                    ConstraintField::Currency,
                    ConstraintOp::Eq,
                    ConstraintValue::Text("USD".to_string()),
                    Some(10.0),
                )
            })
            .collect();
        let scored = score_offer(&offer(1.0), &reqs, &soft, Utc::now()).unwrap();
        assert_eq!(scored.score, 100.0);
    }

    #[test]
    fn ranking_sorts_descending() {
        let reqs = requirements(50_000.0);
        let offers = vec![offer(45_000.0), offer(20_000.0), offer(30_000.0)];
        let ranked = rank_offers(&offers, &reqs, &[], Utc::now()).unwrap();
        assert_eq!(ranked[0].offer.total_price, 20_000.0);
        assert_eq!(ranked[2].offer.total_price, 45_000.0);
    }
}
