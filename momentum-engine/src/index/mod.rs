// ---------------------------------------------------------------------------
// Vector Index: concurrent HNSW over content embeddings
// ---------------------------------------------------------------------------
//
// Locking:
// - `gate` serializes writers (and owns the level RNG).
// - Neighbour discovery for an insert runs under the shared graph lock, so
//   searches continue while a writer plans.
// - Only linking takes the exclusive lock; a node becomes visible to
//   searches atomically once linked.
// - Compaction builds a fresh graph off to the side and swaps it in.
//
// Filtered search picks post-filter with over-fetch when the estimated
// selectivity lets a capped factor reach the recall floor, otherwise an exact
// scan over the tag posting lists.
// ---------------------------------------------------------------------------

pub mod distance;
pub mod hnsw;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::deadline::Deadline;
use crate::error::EngineError;
use distance::validate;
use hnsw::{HnswGraph, HnswParams, LayerSearch, Node};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Narrows a search to nodes carrying at least one of `any_tags`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
	pub any_tags: Vec<String>,
}

impl SearchFilter {
	pub fn tags<I, S>(tags: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			any_tags: tags.into_iter().map(Into::into).collect(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.any_tags.is_empty()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
	pub id: String,
	pub distance: f64,
}

/// How a search was executed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SearchStrategy {
	Unfiltered,
	PostFilter { factor: usize },
	PreFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
	pub hits: Vec<SearchHit>,
	/// Set when the deadline cut the search short.
	pub partial: bool,
	pub strategy: SearchStrategy,
}

impl SearchOutcome {
	fn empty(strategy: SearchStrategy) -> Self {
		Self {
			hits: Vec::new(),
			partial: false,
			strategy,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertOutcome {
	Inserted,
	Replaced,
	Retagged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
	pub live: usize,
	pub nodes: usize,
	pub tombstones: usize,
	pub max_level: usize,
	pub dimension: usize,
}

// ---------------------------------------------------------------------------
// VectorIndex
// ---------------------------------------------------------------------------

pub struct VectorIndex {
	config: IndexConfig,
	params: HnswParams,
	graph: RwLock<HnswGraph>,
	gate: Mutex<StdRng>,
}

impl VectorIndex {
	pub fn new(config: IndexConfig) -> Self {
		let params = HnswParams::new(config.m, config.ef_construction);
		Self {
			gate: Mutex::new(StdRng::seed_from_u64(config.seed)),
			graph: RwLock::new(HnswGraph::new(params.clone())),
			params,
			config,
		}
	}

	pub fn dimension(&self) -> usize {
		self.config.dimension
	}

	pub fn len(&self) -> usize {
		self.graph.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.graph.read().is_empty()
	}

	pub fn contains(&self, id: &str) -> bool {
		self.graph.read().slot_of(id).is_some()
	}

	pub fn vector(&self, id: &str) -> Option<Arc<[f32]>> {
		self.graph.read().live_node(id).map(|n| n.vector.clone())
	}

	pub fn tag_count(&self, tag: &str) -> usize {
		self.graph.read().tag_count(tag)
	}

	/// Indexed tags for which `keep` holds.
	pub fn tags_where<F>(&self, keep: F) -> Vec<String>
	where
		F: Fn(&str) -> bool,
	{
		self.graph.read().tags_where(keep)
	}

	pub fn stats(&self) -> IndexStats {
		let g = self.graph.read();
		IndexStats {
			live: g.len(),
			nodes: g.node_count(),
			tombstones: g.tombstones(),
			max_level: g.max_level(),
			dimension: self.config.dimension,
		}
	}

	// -- Mutation ------------------------------------------------------------

	/// Insert or replace the vector for `id`. Malformed vectors are rejected
	/// before the graph is touched.
	pub fn upsert(
		&self,
		id: &str,
		vector: Arc<[f32]>,
		tags: Vec<String>,
	) -> Result<UpsertOutcome, EngineError> {
		let mag = validate(&vector, self.config.dimension)?;
		let mut rng = self.gate.lock();

		let (same_vector, exclude) = {
			let g = self.graph.read();
			match g.slot_of(id) {
				Some(slot) => (g.node(slot).vector[..] == vector[..], Some(slot)),
				None => (false, None),
			}
		};
		if same_vector {
			self.graph.write().retag(id, tags);
			return Ok(UpsertOutcome::Retagged);
		}

		let level = self.params.random_level(&mut *rng);
		let plan = self.graph.read().plan_insert(&vector, mag, level, exclude);
		let node = Node::new(id.to_string(), vector, mag, tags);
		let (_, replaced) = self.graph.write().apply_insert(node, plan);

		self.maybe_compact(&mut rng);

		tracing::debug!(id, level, replaced, "Indexed vector");
		Ok(if replaced {
			UpsertOutcome::Replaced
		} else {
			UpsertOutcome::Inserted
		})
	}

	pub fn remove(&self, id: &str) -> bool {
		let mut rng = self.gate.lock();
		let removed = self.graph.write().remove(id);
		if removed {
			self.maybe_compact(&mut rng);
		}
		removed
	}

	/// Rebuild from live nodes once tombstones exceed `compact_ratio`.
	/// Caller holds the gate.
	fn maybe_compact(&self, rng: &mut StdRng) {
		let live: Vec<(String, Arc<[f32]>, f64, Vec<String>)> = {
			let g = self.graph.read();
			if g.tombstones() == 0
				|| (g.tombstones() as f64) <= self.config.compact_ratio * g.node_count() as f64
			{
				return;
			}
			g.live_nodes()
				.map(|n| (n.id.clone(), n.vector.clone(), n.magnitude, n.tags.clone()))
				.collect()
		};

		let mut fresh = HnswGraph::new(self.params.clone());
		for (id, vector, mag, tags) in live {
			let level = self.params.random_level(rng);
			let plan = fresh.plan_insert(&vector, mag, level, None);
			fresh.apply_insert(Node::new(id, vector, mag, tags), plan);
		}
		let live_count = fresh.len();
		*self.graph.write() = fresh;
		tracing::info!(live = live_count, "Compacted vector index");
	}

	// -- Search --------------------------------------------------------------

	pub fn search(
		&self,
		query: &[f32],
		k: usize,
		filter: Option<&SearchFilter>,
		deadline: &Deadline,
	) -> Result<SearchOutcome, EngineError> {
		let q_mag = validate(query, self.config.dimension)?;
		let g = self.graph.read();

		let filter = filter.filter(|f| !f.is_empty());
		let Some(filter) = filter else {
			if k == 0 || g.is_empty() {
				return Ok(SearchOutcome::empty(SearchStrategy::Unfiltered));
			}
			let res = g.knn(query, q_mag, k, self.config.ef_search, deadline);
			return Ok(to_outcome(&g, res, SearchStrategy::Unfiltered));
		};

		let matching = g.matching_slots(&filter.any_tags);
		if k == 0 || matching.is_empty() {
			return Ok(SearchOutcome::empty(SearchStrategy::PreFilter));
		}

		let selectivity = matching.len() as f64 / g.len() as f64;
		let needed = (1.0 / (selectivity * self.config.recall_floor)).ceil().max(1.0);
		if needed <= self.config.max_overfetch as f64 {
			let factor = needed as usize;
			let fetch = k * factor;
			let res = g.knn(query, q_mag, fetch, self.config.ef_search.max(fetch), deadline);
			let expired = res.expired;
			let found: Vec<_> = res
				.found
				.into_iter()
				.filter(|s| matching.contains(&s.slot))
				.take(k)
				.collect();
			if expired || found.len() >= k.min(matching.len()) {
				let strategy = SearchStrategy::PostFilter { factor };
				return Ok(to_outcome(&g, LayerSearch { found, expired }, strategy));
			}
			tracing::debug!(
				found = found.len(),
				matching = matching.len(),
				"Post-filter under-filled, falling back to exact scan"
			);
		}

		let mut slots: Vec<_> = matching.into_iter().collect();
		slots.sort_unstable();
		let res = g.exact_scan(query, q_mag, slots, k, deadline);
		Ok(to_outcome(&g, res, SearchStrategy::PreFilter))
	}
}

fn to_outcome(g: &HnswGraph, res: LayerSearch, strategy: SearchStrategy) -> SearchOutcome {
	SearchOutcome {
		hits: res
			.found
			.iter()
			.map(|s| SearchHit {
				id: g.node(s.slot).id.clone(),
				distance: s.dist,
			})
			.collect(),
		partial: res.expired,
		strategy,
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use rand::Rng;
	use std::collections::HashSet;
	use std::time::Duration;

	fn config(dim: usize) -> IndexConfig {
		IndexConfig {
			dimension: dim,
			m: 8,
			ef_construction: 64,
			ef_search: 48,
			..IndexConfig::default()
		}
	}

	fn vecf(v: &[f32]) -> Arc<[f32]> {
		Arc::from(v)
	}

	fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
		let v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
		let mag = distance::magnitude(&v) as f32;
		v.into_iter().map(|x| x / mag).collect()
	}

	#[test]
	fn wrong_dimension_is_rejected_and_index_unchanged() {
		let index = VectorIndex::new(config(3));
		index.upsert("a", vecf(&[1.0, 0.0, 0.0]), vec![]).unwrap();
		let err = index.upsert("b", vecf(&[1.0, 0.0]), vec![]).unwrap_err();
		assert_eq!(err.code(), "DIMENSION_MISMATCH");
		assert_eq!(index.len(), 1);
		assert!(!index.contains("b"));
	}

	#[test]
	fn search_on_empty_index_is_empty() {
		let index = VectorIndex::new(config(2));
		let out = index.search(&[1.0, 0.0], 5, None, &Deadline::none()).unwrap();
		assert!(out.hits.is_empty());
		assert!(!out.partial);
	}

	#[test]
	fn search_orders_by_distance() {
		let index = VectorIndex::new(config(3));
		index.upsert("x", vecf(&[1.0, 0.0, 0.0]), vec![]).unwrap();
		index.upsert("y", vecf(&[0.9, 0.1, 0.0]), vec![]).unwrap();
		index.upsert("z", vecf(&[0.0, 0.0, 1.0]), vec![]).unwrap();
		let out = index
			.search(&[1.0, 0.0, 0.0], 2, None, &Deadline::none())
			.unwrap();
		let ids: Vec<&str> = out.hits.iter().map(|h| h.id.as_str()).collect();
		assert_eq!(ids, vec!["x", "y"]);
		assert!(out.hits[0].distance <= out.hits[1].distance);
	}

	#[test]
	fn upsert_same_vector_only_retags() {
		let index = VectorIndex::new(config(2));
		index.upsert("a", vecf(&[1.0, 0.0]), vec!["ml".into()]).unwrap();
		let outcome = index.upsert("a", vecf(&[1.0, 0.0]), vec!["go".into()]).unwrap();
		assert_eq!(outcome, UpsertOutcome::Retagged);
		assert_eq!(index.tag_count("ml"), 0);
		assert_eq!(index.tag_count("go"), 1);
		assert_eq!(index.stats().tombstones, 0);
	}

	#[test]
	fn upsert_new_vector_replaces() {
		let index = VectorIndex::new(config(2));
		index.upsert("a", vecf(&[1.0, 0.0]), vec![]).unwrap();
		index.upsert("b", vecf(&[0.5, 0.5]), vec![]).unwrap();
		index.upsert("c", vecf(&[0.2, 0.9]), vec![]).unwrap();
		index.upsert("d", vecf(&[0.7, 0.3]), vec![]).unwrap();
		let outcome = index.upsert("a", vecf(&[0.0, 1.0]), vec![]).unwrap();
		assert_eq!(outcome, UpsertOutcome::Replaced);
		assert_eq!(index.len(), 4);
		assert_eq!(&index.vector("a").unwrap()[..], &[0.0, 1.0]);
	}

	#[test]
	fn remove_then_compaction_drops_tombstones() {
		let index = VectorIndex::new(config(4));
		let mut rng = StdRng::seed_from_u64(1);
		for i in 0..20 {
			index
				.upsert(&format!("c{}", i), vecf(&random_unit(&mut rng, 4)), vec![])
				.unwrap();
		}
		for i in 0..10 {
			assert!(index.remove(&format!("c{}", i)));
		}
		assert!(!index.remove("c0"));
		let stats = index.stats();
		assert_eq!(stats.live, 10);
		// 30% ratio is crossed well before ten removals
		assert!(stats.tombstones < 10);
		let q = random_unit(&mut rng, 4);
		let out = index.search(&q, 20, None, &Deadline::none()).unwrap();
		assert_eq!(out.hits.len(), 10);
	}

	#[test]
	fn selective_filter_uses_exact_scan() {
		let index = VectorIndex::new(config(8));
		let mut rng = StdRng::seed_from_u64(2);
		for i in 0..200 {
			let tag = if i % 50 == 0 { "rare" } else { "common" };
			index
				.upsert(&format!("c{}", i), vecf(&random_unit(&mut rng, 8)), vec![tag.into()])
				.unwrap();
		}
		let q = random_unit(&mut rng, 8);
		let out = index
			.search(&q, 10, Some(&SearchFilter::tags(["rare"])), &Deadline::none())
			.unwrap();
		assert_eq!(out.strategy, SearchStrategy::PreFilter);
		assert_eq!(out.hits.len(), 4);
	}

	#[test]
	fn broad_filter_uses_post_filter_with_capped_factor() {
		let index = VectorIndex::new(config(8));
		let mut rng = StdRng::seed_from_u64(3);
		for i in 0..200 {
			// evens cluster around +x, odds around -x
			let mut v = random_unit(&mut rng, 8);
			let (tag, pull) = if i % 2 == 0 { ("even", 4.0) } else { ("odd", -4.0) };
			v[0] += pull;
			index
				.upsert(&format!("c{}", i), vecf(&v), vec![tag.into()])
				.unwrap();
		}
		let q = [1.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
		let out = index
			.search(&q, 5, Some(&SearchFilter::tags(["even"])), &Deadline::none())
			.unwrap();
		match out.strategy {
			SearchStrategy::PostFilter { factor } => assert!(factor <= 8),
			other => panic!("unexpected strategy {:?}", other),
		}
		assert_eq!(out.hits.len(), 5);
		for hit in &out.hits {
			let n: usize = hit.id[1..].parse().unwrap();
			assert_eq!(n % 2, 0);
		}
	}

	#[test]
	fn filtered_recall_against_exact() {
		let index = VectorIndex::new(config(12));
		let mut rng = StdRng::seed_from_u64(4);
		let mut tagged = Vec::new();
		for i in 0..400 {
			let v = random_unit(&mut rng, 12);
			let tag = if i % 3 == 0 { "ml" } else { "web" };
			if tag == "ml" {
				tagged.push((format!("c{}", i), v.clone()));
			}
			index.upsert(&format!("c{}", i), vecf(&v), vec![tag.into()]).unwrap();
		}
		let k = 10;
		let mut hits = 0;
		let queries = 20;
		for _ in 0..queries {
			let q = random_unit(&mut rng, 12);
			let qm = distance::magnitude(&q);
			let mut exact: Vec<(f64, &str)> = tagged
				.iter()
				.map(|(id, v)| {
					(distance::cosine_distance(&q, v, qm, distance::magnitude(v)), id.as_str())
				})
				.collect();
			exact.sort_by(|a, b| a.0.total_cmp(&b.0));
			let truth: HashSet<&str> = exact.iter().take(k).map(|(_, id)| *id).collect();
			let out = index
				.search(&q, k, Some(&SearchFilter::tags(["ml"])), &Deadline::none())
				.unwrap();
			hits += out.hits.iter().filter(|h| truth.contains(h.id.as_str())).count();
		}
		let recall = hits as f64 / (k * queries) as f64;
		assert!(recall >= 0.9, "filtered recall {}", recall);
	}

	#[test]
	fn expired_deadline_flags_partial() {
		let index = VectorIndex::new(config(8));
		let mut rng = StdRng::seed_from_u64(5);
		for i in 0..100 {
			index
				.upsert(&format!("c{}", i), vecf(&random_unit(&mut rng, 8)), vec![])
				.unwrap();
		}
		let q = random_unit(&mut rng, 8);
		let out = index
			.search(&q, 10, None, &Deadline::after(Duration::ZERO))
			.unwrap();
		assert!(out.partial);
		assert!(out.hits.len() <= 10);
	}

	#[test]
	fn concurrent_search_during_inserts() {
		let index = Arc::new(VectorIndex::new(config(8)));
		let mut rng = StdRng::seed_from_u64(6);
		for i in 0..50 {
			index
				.upsert(&format!("seed{}", i), vecf(&random_unit(&mut rng, 8)), vec![])
				.unwrap();
		}
		let writer = {
			let index = index.clone();
			std::thread::spawn(move || {
				let mut rng = StdRng::seed_from_u64(7);
				for i in 0..200 {
					index
						.upsert(&format!("w{}", i), vecf(&random_unit(&mut rng, 8)), vec![])
						.unwrap();
				}
			})
		};
		let q = random_unit(&mut rng, 8);
		for _ in 0..200 {
			let out = index.search(&q, 5, None, &Deadline::none()).unwrap();
			assert_eq!(out.hits.len(), 5);
		}
		writer.join().unwrap();
		assert_eq!(index.len(), 250);
	}
}
