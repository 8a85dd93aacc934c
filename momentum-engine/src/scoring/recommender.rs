use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use super::composite::{
	alignment_score, composite, mode_score, momentum_order, momentum_score, rank_order,
	RankedItem, ScoreBreakdown,
};
use super::weights::{normalize_weights, NormalizedWeights};
use crate::config::ScoringConfig;
use crate::content::{ContentCatalog, ContentItem, LearningMode};
use crate::deadline::Deadline;
use crate::error::EngineError;
use crate::index::distance::similarity_from_distance;
use crate::index::{SearchFilter, SearchHit};
use crate::profile::{UserHistory, UserStore};
use crate::topics::{relation, TopicRelation};
use crate::trend::TrendStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
	/// Vector search around the user's interests, composite-scored.
	Similarity,
	/// No usable history: live items ranked by topic momentum.
	MomentumOnly,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
	pub user_id: String,
	pub mode: LearningMode,
	pub items: Vec<RankedItem>,
	pub partial: bool,
	pub strategy: RankingStrategy,
	/// Candidates considered before truncation to `k`.
	pub candidates: usize,
}

// ---------------------------------------------------------------------------
// Interest vector
// ---------------------------------------------------------------------------

/// Decay-weighted unit centroid of completed items' embeddings.
fn interest_centroid(
	history: &UserHistory,
	catalog: &ContentCatalog,
	half_life_ms: f64,
	now: u64,
) -> Option<Vec<f32>> {
	let lambda = f64::ln(2.0) / half_life_ms.max(1.0);
	let mut weighted: Vec<f64> = Vec::new();
	let mut total_weight = 0.0f64;

	for (content_id, at) in history.completions.iter() {
		let Some(item) = catalog.get(content_id) else {
			continue;
		};
		if weighted.is_empty() {
			weighted = vec![0.0; item.embedding.len()];
		}
		if item.embedding.len() != weighted.len() {
			continue;
		}
		let age = now.saturating_sub(*at) as f64;
		let w = (-lambda * age).exp();
		total_weight += w;
		for (acc, &x) in weighted.iter_mut().zip(item.embedding.iter()) {
			*acc += x as f64 * w;
		}
	}

	if total_weight == 0.0 {
		return None;
	}
	let mag = weighted.iter().map(|v| v * v).sum::<f64>().sqrt();
	if mag == 0.0 {
		return None;
	}
	Some(weighted.iter().map(|v| (v / mag) as f32).collect())
}

// ---------------------------------------------------------------------------
// Recommender
// ---------------------------------------------------------------------------

pub struct Recommender {
	config: ScoringConfig,
	weights: NormalizedWeights,
	catalog: Arc<ContentCatalog>,
	trends: Arc<TrendStore>,
	users: Arc<UserStore>,
}

impl Recommender {
	pub fn new(
		config: ScoringConfig,
		catalog: Arc<ContentCatalog>,
		trends: Arc<TrendStore>,
		users: Arc<UserStore>,
	) -> Self {
		Self {
			weights: normalize_weights(&config.weights),
			config,
			catalog,
			trends,
			users,
		}
	}

	pub fn weights(&self) -> &NormalizedWeights {
		&self.weights
	}

	/// Rank up to `k` items for `user_id` in `mode`. Never fails on deadline
	/// expiry: whatever was scored so far comes back flagged `partial`.
	pub fn recommend(
		&self,
		user_id: &str,
		mode: LearningMode,
		k: usize,
		deadline: &Deadline,
		now: u64,
	) -> Result<Recommendations, EngineError> {
		let k = k.min(self.config.max_k);
		let (profile, history) = self.users.view(user_id);
		let history = history.unwrap_or_default();
		let preferred_tags = profile
			.as_ref()
			.map(|p| p.preferred_tags.clone())
			.unwrap_or_default();
		let preferred_modes = profile
			.as_ref()
			.map(|p| p.preferred_modes.clone())
			.unwrap_or_default();

		let ctx = Ctx {
			mode,
			k,
			preferred_tags: &preferred_tags,
			preferred_modes: &preferred_modes,
			history: &history,
			deadline,
		};

		let query = if history.has_history() {
			self.query_vector(&history, now)
		} else {
			None
		};
		let mut recs = match query {
			Some(q) => self.rank_by_similarity(&ctx, &q)?,
			None => self.rank_by_momentum(&ctx),
		};
		recs.user_id = user_id.to_string();

		tracing::debug!(
			user = user_id,
			mode = %mode,
			k,
			returned = recs.items.len(),
			partial = recs.partial,
			strategy = ?recs.strategy,
			"Ranked recommendations"
		);
		Ok(recs)
	}

	/// Latest interaction's embedding, else the completion centroid.
	fn query_vector(&self, history: &UserHistory, now: u64) -> Option<Vec<f32>> {
		if let Some(latest) = &history.latest_interaction {
			if let Some(item) = self.catalog.get(&latest.content_id) {
				return Some(item.embedding.to_vec());
			}
		}
		interest_centroid(history, &self.catalog, self.config.interest_half_life_ms, now)
	}

	fn breakdown(&self, ctx: &Ctx<'_>, item: &ContentItem, similarity: Option<f64>) -> ScoreBreakdown {
		let mut b = ScoreBreakdown {
			alignment: alignment_score(&item.tags, ctx.preferred_tags),
			mode: mode_score(item, ctx.mode, ctx.preferred_modes),
			momentum: momentum_score(&item.tags, |t| self.trends.momentum_score(t)),
			novelty: item.novelty,
			similarity,
			composite: 0.0,
			partial: false,
		};
		b.composite = composite(&b, &self.weights);
		b
	}

	// -- Similarity path -----------------------------------------------------

	fn rank_by_similarity(&self, ctx: &Ctx<'_>, query: &[f32]) -> Result<Recommendations, EngineError> {
		let index = self.catalog.index();
		let pool = ctx.k * self.config.candidate_multiplier.max(1) + ctx.history.completed.len();

		// Preferred topics cover their subtopics.
		let related = index.tags_where(|t| in_preferred(t, ctx.preferred_tags));
		let outcome = if related.is_empty() {
			if !ctx.preferred_tags.is_empty() {
				tracing::debug!("No items under preferred tags, searching unfiltered");
			}
			index.search(query, pool, None, ctx.deadline)?
		} else {
			index.search(query, pool, Some(&SearchFilter::tags(related)), ctx.deadline)?
		};
		let mut partial = outcome.partial;

		let mut ranked: Vec<RankedItem> = Vec::with_capacity(outcome.hits.len());
		for (i, SearchHit { id, distance }) in outcome.hits.iter().enumerate() {
			if i > 0 && ctx.deadline.expired() {
				partial = true;
				break;
			}
			if ctx.history.completed.contains(id) {
				continue;
			}
			let Some(item) = self.catalog.get(id) else {
				continue;
			};
			if item.retired {
				continue;
			}
			let b = self.breakdown(ctx, &item, Some(similarity_from_distance(*distance)));
			ranked.push(RankedItem {
				item: (*item).clone(),
				score: b.composite,
				breakdown: b,
			});
		}

		ranked.sort_by(rank_order);
		Ok(finish(ctx, ranked, partial, RankingStrategy::Similarity))
	}

	// -- Momentum-only path --------------------------------------------------

	fn rank_by_momentum(&self, ctx: &Ctx<'_>) -> Recommendations {
		let live: Vec<Arc<ContentItem>> = self
			.catalog
			.live_items()
			.into_iter()
			.filter(|i| !ctx.history.completed.contains(&i.id))
			.collect();

		let tagged: Vec<Arc<ContentItem>> = live
			.iter()
			.filter(|i| i.tags.iter().any(|t| in_preferred(t, ctx.preferred_tags)))
			.cloned()
			.collect();
		let pool = if tagged.is_empty() {
			if !ctx.preferred_tags.is_empty() {
				tracing::debug!("No items under preferred tags, ranking all live items");
			}
			live
		} else {
			tagged
		};

		let suited: Vec<Arc<ContentItem>> = pool.iter().filter(|i| i.suits(ctx.mode)).cloned().collect();
		let pool = if suited.is_empty() { pool } else { suited };

		let mut partial = false;
		let mut seen: HashSet<&str> = HashSet::new();
		let mut ranked: Vec<RankedItem> = Vec::with_capacity(pool.len());
		for (i, item) in pool.iter().enumerate() {
			if i > 0 && ctx.deadline.expired() {
				partial = true;
				break;
			}
			if !seen.insert(item.id.as_str()) {
				continue;
			}
			let mut b = self.breakdown(ctx, item, None);
			b.composite = b.momentum;
			ranked.push(RankedItem {
				item: (**item).clone(),
				score: b.momentum,
				breakdown: b,
			});
		}

		ranked.sort_by(momentum_order);
		finish(ctx, ranked, partial, RankingStrategy::MomentumOnly)
	}
}

/// `tag` is one of `preferred` or sits below one of them.
fn in_preferred(tag: &str, preferred: &[String]) -> bool {
	preferred
		.iter()
		.any(|p| matches!(relation(tag, p), TopicRelation::Same | TopicRelation::Descendant))
}

struct Ctx<'a> {
	mode: LearningMode,
	k: usize,
	preferred_tags: &'a [String],
	preferred_modes: &'a [LearningMode],
	history: &'a UserHistory,
	deadline: &'a Deadline,
}

fn finish(
	ctx: &Ctx<'_>,
	mut ranked: Vec<RankedItem>,
	partial: bool,
	strategy: RankingStrategy,
) -> Recommendations {
	let candidates = ranked.len();
	ranked.truncate(ctx.k);
	if partial {
		for r in &mut ranked {
			r.breakdown.partial = true;
		}
	}
	Recommendations {
		user_id: String::new(),
		mode: ctx.mode,
		items: ranked,
		partial,
		strategy,
		candidates,
	}
}
