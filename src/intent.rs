use crate::constraint::{Constraint, ConstraintField, ConstraintOp, ConstraintValue};
use crate::error::Result;
use crate::model::StructuredRequirements;

/// Intent interpretation is an external collaborator: free text plus
/// structured hints in, structured requirements out. The quality of the
/// extraction is explicitly not this crate's concern; the broker only
/// depends on this interface.
pub trait IntentInterpreter: Send + Sync {
    fn parse(&self, text: &str, hints: &[Constraint]) -> Result<StructuredRequirements>;
}

const STOPWORDS: &[&str] = &[
    "i", "a", "an", "the", "need", "want", "buy", "get", "some", "of", "for", "to", "with",
    "budget", "max", "maximum", "under", "at", "most", "please", "me", "my", "per",
];

/// Keyword-based default interpreter. Good enough for demos and tests;
/// production deployments are expected to plug in something smarter.
#[derive(Default)]
pub struct KeywordInterpreter;

impl KeywordInterpreter {
    pub fn new() -> Self {
        Self
    }
}

impl IntentInterpreter for KeywordInterpreter {
    fn parse(&self, text: &str, hints: &[Constraint]) -> Result<StructuredRequirements> {
        let lowered = text.to_lowercase();
        let tokens: Vec<String> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let mut requirements = StructuredRequirements::default();

        // Numbers following a budget word cap the spend; the first other
        // number is read as a quantity.
        let mut previous: Option<&str> = None;
        for token in tokens.iter().map(String::as_str) {
            if let Ok(number) = token.parse::<f64>() {
                let after_budget_word =
                    matches!(previous, Some("budget") | Some("max") | Some("maximum") | Some("under"));
                if after_budget_word && requirements.max_budget.is_none() {
                    requirements.max_budget = Some(number);
                } else if requirements.quantity.is_none() && number.fract() == 0.0 {
                    requirements.quantity = Some(number as u32);
                }
            }
            previous = Some(token);
        }

        requirements.keywords = tokens
            .into_iter()
            .filter(|t| t.parse::<f64>().is_err() && !STOPWORDS.contains(&t.as_str()))
            .collect();
        requirements.keywords.dedup();

        for hint in hints {
            match (hint.field, hint.op, &hint.value) {
                (
                    ConstraintField::TotalPrice,
                    ConstraintOp::Lte | ConstraintOp::Lt,
                    ConstraintValue::Number(max),
                ) => {
                    requirements.max_budget = Some(*max);
                }
                (ConstraintField::Currency, ConstraintOp::Eq, ConstraintValue::Text(code)) => {
                    requirements.currency = Some(code.to_uppercase());
                }
                (ConstraintField::DeliveryDate, ConstraintOp::Lte, ConstraintValue::Text(ts)) => {
                    if let Ok(deadline) = chrono::DateTime::parse_from_rfc3339(ts) {
                        requirements.deadline = Some(deadline.with_timezone(&chrono::Utc));
                    }
                }
                _ => {}
            }
        }

        Ok(requirements)
    }
}
