use crate::model::{AgentRecord, AgentStatus, StructuredRequirements};
use serde::{Deserialize, Serialize};

const KEYWORD_POINTS: u32 = 15;
const KEYWORD_CAP: u32 = 60;
const CATEGORY_POINTS: u32 = 20;
const ACTIVE_POINTS: u32 = 20;
const SCORE_CAP: u32 = 100;

/// A beacon paired with its suitability score for one session. This is the
/// seller-selection pass; ranking of the resulting offers on the buyer side
/// is a separate concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub agent: AgentRecord,
    pub score: u32,
}

/// Scores one seller against structured requirements: 15 per matched
/// keyword capped at 60, 20 for a category match, 20 for active status,
/// capped at 100.
pub fn score_seller(record: &AgentRecord, requirements: &StructuredRequirements) -> u32 {
    let capabilities = record.capabilities.to_lowercase();

    let keyword_hits = requirements
        .keywords
        .iter()
        .filter(|k| capabilities.contains(&k.to_lowercase()))
        .count() as u32;
    let mut score = (keyword_hits * KEYWORD_POINTS).min(KEYWORD_CAP);

    if let Some(category) = &requirements.category {
        if capabilities.contains(&category.to_lowercase()) {
            score += CATEGORY_POINTS;
        }
    }

    if record.status == AgentStatus::Active {
        score += ACTIVE_POINTS;
    }

    score.min(SCORE_CAP)
}

/// Scores and ranks candidate sellers. Zero-score sellers are excluded;
/// ties break by descending score, then by registration recency.
pub fn rank_sellers(
    records: Vec<AgentRecord>,
    requirements: &StructuredRequirements,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = records
        .into_iter()
        .map(|agent| {
            let score = score_seller(&agent, requirements);
            MatchCandidate { agent, score }
        })
        .filter(|c| c.score > 0)
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.agent.registered_at.cmp(&a.agent.registered_at))
    });
    candidates
}
