// ---------------------------------------------------------------------------
// Composite scoring: pure sub-score functions and ranking order
// ---------------------------------------------------------------------------
//
// Every sub-score lives on a 0–10 scale before weighting, so the composite
// is also 0–10. No side effects.
// ---------------------------------------------------------------------------

use std::cmp::Ordering;

use serde::Serialize;

use super::weights::NormalizedWeights;
use crate::content::{ContentItem, LearningMode};
use crate::topics::{relation, TopicRelation};

const SCORE_MAX: f64 = 10.0;
/// Alignment credited for an ancestor/descendant topic match.
const RELATED_TOPIC_SCORE: f64 = 6.0;
/// Mode credit when the item suits one of the user's preferred modes but
/// not the requested one.
const PREFERRED_MODE_SCORE: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
	pub alignment: f64,
	pub mode: f64,
	pub momentum: f64,
	pub novelty: f64,
	/// Cosine similarity to the query vector; absent for momentum-only ranking.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub similarity: Option<f64>,
	pub composite: f64,
	pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
	pub item: ContentItem,
	pub score: f64,
	pub breakdown: ScoreBreakdown,
}

// -- Sub-scores -------------------------------------------------------------

/// Best topical match between the item's tags and the user's preferences.
pub fn alignment_score(item_tags: &[String], preferred: &[String]) -> f64 {
	let mut best = 0.0f64;
	for tag in item_tags {
		for pref in preferred {
			let score = match relation(tag, pref) {
				TopicRelation::Same => SCORE_MAX,
				TopicRelation::Ancestor | TopicRelation::Descendant => RELATED_TOPIC_SCORE,
				TopicRelation::Unrelated => 0.0,
			};
			best = best.max(score);
			if best == SCORE_MAX {
				return best;
			}
		}
	}
	best
}

pub fn mode_score(item: &ContentItem, requested: LearningMode, preferred: &[LearningMode]) -> f64 {
	if item.suits(requested) {
		SCORE_MAX
	} else if preferred.iter().any(|m| item.suits(*m)) {
		PREFERRED_MODE_SCORE
	} else {
		0.0
	}
}

/// Strongest trend among the item's tags, already on the 0–10 scale.
pub fn momentum_score<F>(item_tags: &[String], lookup: F) -> f64
where
	F: Fn(&str) -> Option<f64>,
{
	item_tags
		.iter()
		.filter_map(|t| lookup(t.as_str()))
		.fold(0.0, f64::max)
		.clamp(0.0, SCORE_MAX)
}

pub fn composite(b: &ScoreBreakdown, w: &NormalizedWeights) -> f64 {
	b.alignment * w.alignment + b.mode * w.mode + b.momentum * w.momentum + b.novelty * w.novelty
}

// -- Ordering ---------------------------------------------------------------

/// Composite desc, then momentum desc, then shorter duration, then id.
pub fn rank_order(a: &RankedItem, b: &RankedItem) -> Ordering {
	b.score
		.total_cmp(&a.score)
		.then(b.breakdown.momentum.total_cmp(&a.breakdown.momentum))
		.then(a.item.duration_minutes.total_cmp(&b.item.duration_minutes))
		.then_with(|| a.item.id.cmp(&b.item.id))
}

/// Momentum desc, then shorter duration, then id.
pub fn momentum_order(a: &RankedItem, b: &RankedItem) -> Ordering {
	b.breakdown
		.momentum
		.total_cmp(&a.breakdown.momentum)
		.then(a.item.duration_minutes.total_cmp(&b.item.duration_minutes))
		.then_with(|| a.item.id.cmp(&b.item.id))
}
