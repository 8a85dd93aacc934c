// ---------------------------------------------------------------------------
// Content Catalog
// ---------------------------------------------------------------------------
//
// Owns every `ContentItem` the engine knows about, live or retired. The
// embedding lives both here (for interest centroids over retired items) and
// in the vector index (for search). Retired items leave the index but stay
// in the catalog so user history keeps resolving them.
//
// `trend_alignment` and `novelty` are derived: computed once when an item is
// first stored and afterwards only by `refresh_derived`.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::ContentConfig;
use crate::error::EngineError;
use crate::index::{UpsertOutcome, VectorIndex};

const DEFAULT_NOVELTY_BASE: f64 = 5.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Exploration style a piece of content suits, or a user asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
	Discovery,
	Focused,
	Practice,
	Project,
}

impl LearningMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Discovery => "discovery",
			Self::Focused => "focused",
			Self::Practice => "practice",
			Self::Project => "project",
		}
	}
}

impl fmt::Display for LearningMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for LearningMode {
	type Err = EngineError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_lowercase().as_str() {
			"discovery" => Ok(Self::Discovery),
			"focused" => Ok(Self::Focused),
			"practice" => Ok(Self::Practice),
			"project" => Ok(Self::Project),
			other => Err(EngineError::InvalidParams(format!(
				"unknown learning mode '{}'",
				other
			))),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
	pub id: String,
	#[serde(skip)]
	pub embedding: Arc<[f32]>,
	pub tags: Vec<String>,
	pub modes: Vec<LearningMode>,
	pub duration_minutes: f64,
	pub novelty_base: f64,
	pub published_at: u64,
	pub retired: bool,
	pub trend_alignment: f64,
	pub novelty: f64,
	pub updated_at: u64,
}

impl ContentItem {
	pub fn suits(&self, mode: LearningMode) -> bool {
		self.modes.contains(&mode)
	}
}

/// Content as supplied by the publishing side. Tags are raw names; the
/// engine canonicalizes them before calling `upsert`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentInput {
	pub id: String,
	pub embedding: Vec<f32>,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub modes: Vec<LearningMode>,
	#[serde(default)]
	pub duration_minutes: f64,
	#[serde(default = "default_novelty_base")]
	pub novelty_base: f64,
	pub published_at: Option<u64>,
}

fn default_novelty_base() -> f64 {
	DEFAULT_NOVELTY_BASE
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpsertResult {
	pub id: String,
	pub created: bool,
	pub index: UpsertOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSummary {
	pub items: usize,
	pub live: usize,
	pub updated: usize,
	pub mean_novelty: f64,
	pub mean_trend_alignment: f64,
}

// ---------------------------------------------------------------------------
// Derivations
// ---------------------------------------------------------------------------

/// `base` halved every `half_life_ms` since publication.
pub fn decayed_novelty(base: f64, published_at: u64, half_life_ms: f64, now: u64) -> f64 {
	if half_life_ms <= 0.0 {
		return base;
	}
	let age = now.saturating_sub(published_at) as f64;
	let lambda = f64::ln(2.0) / half_life_ms;
	(base * (-lambda * age).exp()).clamp(0.0, 10.0)
}

/// Strongest momentum score (0–10) among the item's tags; 0 when none of
/// them has a trend yet.
pub fn trend_alignment<F>(tags: &[String], momentum_score: F) -> f64
where
	F: Fn(&str) -> Option<f64>,
{
	tags.iter()
		.filter_map(|t| momentum_score(t.as_str()))
		.fold(0.0, f64::max)
}

// ---------------------------------------------------------------------------
// ContentCatalog
// ---------------------------------------------------------------------------

pub struct ContentCatalog {
	config: ContentConfig,
	index: Arc<VectorIndex>,
	items: RwLock<HashMap<String, Arc<ContentItem>>>,
	/// Serializes catalog mutations so catalog and index never disagree.
	writes: Mutex<()>,
}

impl ContentCatalog {
	pub fn new(config: ContentConfig, index: Arc<VectorIndex>) -> Self {
		Self {
			config,
			index,
			items: RwLock::new(HashMap::new()),
			writes: Mutex::new(()),
		}
	}

	pub fn index(&self) -> &Arc<VectorIndex> {
		&self.index
	}

	pub fn len(&self) -> usize {
		self.items.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn live_len(&self) -> usize {
		self.items.read().values().filter(|i| !i.retired).count()
	}

	pub fn get(&self, id: &str) -> Option<Arc<ContentItem>> {
		self.items.read().get(id).cloned()
	}

	pub fn live_items(&self) -> Vec<Arc<ContentItem>> {
		self.items
			.read()
			.values()
			.filter(|i| !i.retired)
			.cloned()
			.collect()
	}

	pub fn all_items(&self) -> Vec<Arc<ContentItem>> {
		let mut items: Vec<_> = self.items.read().values().cloned().collect();
		items.sort_by(|a, b| a.id.cmp(&b.id));
		items
	}

	/// Insert or replace an item. `tags` must already be canonical. The
	/// index is updated first; a rejected vector leaves both untouched.
	pub fn upsert<F>(
		&self,
		input: ContentInput,
		tags: Vec<String>,
		momentum_score: F,
		now: u64,
	) -> Result<ContentUpsertResult, EngineError>
	where
		F: Fn(&str) -> Option<f64>,
	{
		if input.id.trim().is_empty() {
			return Err(EngineError::InvalidParams("content id must not be empty".into()));
		}
		if !input.duration_minutes.is_finite() || input.duration_minutes < 0.0 {
			return Err(EngineError::InvalidParams(
				"durationMinutes must be a non-negative number".into(),
			));
		}
		if !(0.0..=10.0).contains(&input.novelty_base) {
			return Err(EngineError::InvalidParams(
				"noveltyBase must be within [0, 10]".into(),
			));
		}

		let _guard = self.writes.lock();
		let embedding: Arc<[f32]> = Arc::from(input.embedding);
		let outcome = self.index.upsert(&input.id, embedding.clone(), tags.clone())?;

		let previous = self.get(&input.id);
		let published_at = input
			.published_at
			.or(previous.as_ref().map(|p| p.published_at))
			.unwrap_or(now);

		let mut modes = input.modes;
		modes.sort_by_key(|m| m.as_str());
		modes.dedup();

		let item = ContentItem {
			trend_alignment: trend_alignment(&tags, &momentum_score),
			novelty: decayed_novelty(
				input.novelty_base,
				published_at,
				self.config.novelty_half_life_ms,
				now,
			),
			id: input.id.clone(),
			embedding,
			tags,
			modes,
			duration_minutes: input.duration_minutes,
			novelty_base: input.novelty_base,
			published_at,
			retired: false,
			updated_at: now,
		};
		self.items.write().insert(input.id.clone(), Arc::new(item));

		tracing::debug!(id = %input.id, created = previous.is_none(), "Upserted content");
		Ok(ContentUpsertResult {
			id: input.id,
			created: previous.is_none(),
			index: outcome,
		})
	}

	/// Soft-retire an item: drop it from the index, keep it in the catalog.
	/// Returns false when it was already retired.
	pub fn retire(&self, id: &str, now: u64) -> Result<bool, EngineError> {
		let _guard = self.writes.lock();
		let current = self
			.get(id)
			.ok_or_else(|| EngineError::NotFound(format!("content '{}'", id)))?;
		if current.retired {
			return Ok(false);
		}
		self.index.remove(id);
		let mut item = (*current).clone();
		item.retired = true;
		item.updated_at = now;
		self.items.write().insert(id.to_string(), Arc::new(item));
		tracing::info!(id, "Retired content");
		Ok(true)
	}

	/// Recompute derived fields for every item. Each changed item is replaced
	/// by a fresh `Arc`, so readers holding the old one are unaffected.
	pub fn refresh_derived<F>(&self, momentum_score: F, now: u64) -> DerivedSummary
	where
		F: Fn(&str) -> Option<f64>,
	{
		let current: Vec<Arc<ContentItem>> = self.items.read().values().cloned().collect();
		let mut summary = DerivedSummary {
			items: current.len(),
			..Default::default()
		};
		let mut replacements = Vec::new();

		for item in &current {
			let alignment = trend_alignment(&item.tags, &momentum_score);
			let novelty = decayed_novelty(
				item.novelty_base,
				item.published_at,
				self.config.novelty_half_life_ms,
				now,
			);
			if !item.retired {
				summary.live += 1;
				summary.mean_novelty += novelty;
				summary.mean_trend_alignment += alignment;
			}
			if alignment != item.trend_alignment || novelty != item.novelty {
				let mut next = (**item).clone();
				next.trend_alignment = alignment;
				next.novelty = novelty;
				replacements.push(next);
			}
		}
		if summary.live > 0 {
			summary.mean_novelty /= summary.live as f64;
			summary.mean_trend_alignment /= summary.live as f64;
		}
		summary.updated = replacements.len();

		let _guard = self.writes.lock();
		let mut items = self.items.write();
		for next in replacements {
			// An upsert that landed meanwhile wins over the stale derivation.
			if items.get(&next.id).is_some_and(|cur| cur.updated_at == next.updated_at) {
				items.insert(next.id.clone(), Arc::new(next));
			}
		}
		summary
	}

	/// Replace the catalog with persisted items, re-indexing live ones.
	pub fn restore(&self, items: Vec<ContentItem>) -> Result<(), EngineError> {
		let _guard = self.writes.lock();
		let mut restored = HashMap::with_capacity(items.len());
		for item in items {
			if !item.retired {
				self.index
					.upsert(&item.id, item.embedding.clone(), item.tags.clone())?;
			}
			restored.insert(item.id.clone(), Arc::new(item));
		}
		*self.items.write() = restored;
		Ok(())
	}
}
