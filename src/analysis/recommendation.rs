//! Recommendation ranking
//!
//! Merges the recommendations emitted by every domain (for one or more
//! sessions) into a short prioritized list.

use std::collections::HashMap;

use crate::types::{DomainScore, RankedRecommendation, Recommendation, RecommendationType};

/// Number of recommendations kept after ranking
pub const DEFAULT_TOP_N: usize = 5;

/// Characters of the description used to detect duplicates
const DEDUP_PREFIX_CHARS: usize = 20;

fn dedup_key(rec: &Recommendation) -> (RecommendationType, String) {
    (
        rec.kind,
        rec.description.chars().take(DEDUP_PREFIX_CHARS).collect(),
    )
}

/// Aggregate duplicate recommendations and keep the `limit` most important.
///
/// Duplicates share a type and the first 20 characters of their description;
/// the first occurrence is kept and its frequency counts every duplicate.
/// Entries sort by priority (`alta` first), then frequency, then first
/// appearance, so the order follows the input domain order on ties.
pub fn rank_recommendations<'a, I>(scores: I, limit: usize) -> Vec<RankedRecommendation>
where
    I: IntoIterator<Item = &'a DomainScore>,
{
    let mut ranked: Vec<RankedRecommendation> = Vec::new();
    let mut index: HashMap<(RecommendationType, String), usize> = HashMap::new();

    for rec in scores.into_iter().flat_map(|s| s.recommendations.iter()) {
        let key = dedup_key(rec);
        match index.get(&key) {
            Some(&position) => ranked[position].frequency += 1,
            None => {
                index.insert(key, ranked.len());
                ranked.push(RankedRecommendation {
                    recommendation: rec.clone(),
                    frequency: 1,
                });
            }
        }
    }

    // stable sort keeps first-appearance order on ties
    ranked.sort_by(|a, b| {
        a.recommendation
            .priority
            .rank()
            .cmp(&b.recommendation.priority.rank())
            .then(b.frequency.cmp(&a.frequency))
    });
    ranked.truncate(limit);
    ranked
}
