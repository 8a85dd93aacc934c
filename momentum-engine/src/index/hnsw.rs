// ---------------------------------------------------------------------------
// HNSW graph: layered proximity graph for approximate nearest neighbours
// ---------------------------------------------------------------------------
//
// Single-writer data structure; `VectorIndex` owns the locking. Insertion is
// split in two so the expensive part (finding neighbours) can run under a
// shared lock:
//
// 1. `plan_insert`: greedy descent + ef_construction search per layer,
//    neighbour selection. Read-only.
// 2. `apply_insert`: push the node, write its links, back-link and prune.
//    Short, needs exclusive access.
//
// Removed nodes are tombstoned: still traversed, never returned.
// ---------------------------------------------------------------------------

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use super::distance::cosine_distance;
use crate::deadline::Deadline;

pub type Slot = u32;

/// Levels above this are never drawn; keeps pathological RNG output bounded.
const MAX_LEVEL: usize = 16;

/// How often the exact scan polls the deadline.
const SCAN_DEADLINE_STRIDE: usize = 64;

// ---------------------------------------------------------------------------
// Scored slot
// ---------------------------------------------------------------------------

/// A node slot with its distance to the current query. Ordered by distance,
/// ties broken by slot so heaps are deterministic.
#[derive(Debug, Clone, Copy)]
pub struct Scored {
	pub dist: f64,
	pub slot: Slot,
}

impl PartialEq for Scored {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for Scored {}

impl PartialOrd for Scored {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Scored {
	fn cmp(&self, other: &Self) -> Ordering {
		self.dist
			.total_cmp(&other.dist)
			.then(self.slot.cmp(&other.slot))
	}
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HnswParams {
	pub m: usize,
	pub m0: usize,
	pub ef_construction: usize,
	level_mult: f64,
}

impl HnswParams {
	pub fn new(m: usize, ef_construction: usize) -> Self {
		let m = m.max(2);
		Self {
			m,
			m0: m * 2,
			ef_construction: ef_construction.max(m),
			level_mult: 1.0 / (m as f64).ln(),
		}
	}

	pub fn max_links(&self, layer: usize) -> usize {
		if layer == 0 {
			self.m0
		} else {
			self.m
		}
	}

	/// Draw a node level from the exponential distribution `floor(-ln(U) * mL)`.
	pub fn random_level<R: Rng>(&self, rng: &mut R) -> usize {
		let u: f64 = 1.0 - rng.random::<f64>();
		let level = (-u.ln() * self.level_mult).floor();
		(level as usize).min(MAX_LEVEL)
	}
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Node {
	pub id: String,
	pub vector: Arc<[f32]>,
	pub magnitude: f64,
	pub tags: Vec<String>,
	/// `links[layer]`: neighbour slots on that layer; `len() == level + 1`.
	links: Vec<Vec<Slot>>,
	deleted: bool,
}

impl Node {
	pub fn new(id: String, vector: Arc<[f32]>, magnitude: f64, tags: Vec<String>) -> Self {
		Self {
			id,
			vector,
			magnitude,
			tags,
			links: Vec::new(),
			deleted: false,
		}
	}

	pub fn level(&self) -> usize {
		self.links.len().saturating_sub(1)
	}

	pub fn is_deleted(&self) -> bool {
		self.deleted
	}
}

/// Neighbours chosen for a node that is about to be inserted.
#[derive(Debug)]
pub struct InsertPlan {
	level: usize,
	/// One entry per layer the new node shares with the existing graph.
	neighbors: Vec<Vec<Slot>>,
}

/// Result of a layer search or exact scan, nearest first.
#[derive(Debug, Default)]
pub struct LayerSearch {
	pub found: Vec<Scored>,
	pub expired: bool,
}

// ---------------------------------------------------------------------------
// HnswGraph
// ---------------------------------------------------------------------------

pub struct HnswGraph {
	params: HnswParams,
	nodes: Vec<Node>,
	/// id -> live slot
	live: HashMap<String, Slot>,
	/// tag -> live slots carrying it
	postings: HashMap<String, HashSet<Slot>>,
	entry: Option<Slot>,
	tombstones: usize,
}

impl HnswGraph {
	pub fn new(params: HnswParams) -> Self {
		Self {
			params,
			nodes: Vec::new(),
			live: HashMap::new(),
			postings: HashMap::new(),
			entry: None,
			tombstones: 0,
		}
	}

	// -- Accessors ---------------------------------------------------------

	pub fn params(&self) -> &HnswParams {
		&self.params
	}

	pub fn len(&self) -> usize {
		self.live.len()
	}

	pub fn is_empty(&self) -> bool {
		self.live.is_empty()
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn tombstones(&self) -> usize {
		self.tombstones
	}

	pub fn max_level(&self) -> usize {
		self.entry
			.map(|e| self.nodes[e as usize].level())
			.unwrap_or(0)
	}

	pub fn slot_of(&self, id: &str) -> Option<Slot> {
		self.live.get(id).copied()
	}

	pub fn node(&self, slot: Slot) -> &Node {
		&self.nodes[slot as usize]
	}

	pub fn live_node(&self, id: &str) -> Option<&Node> {
		self.slot_of(id).map(|s| self.node(s))
	}

	/// Live nodes in insertion order.
	pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
		self.nodes.iter().filter(|n| !n.deleted)
	}

	pub fn tag_count(&self, tag: &str) -> usize {
		self.postings.get(tag).map_or(0, |s| s.len())
	}

	/// Tags with at least one live node for which `keep` holds, sorted.
	pub fn tags_where<F>(&self, keep: F) -> Vec<String>
	where
		F: Fn(&str) -> bool,
	{
		let mut out: Vec<String> = self.postings.keys().filter(|t| keep(t)).cloned().collect();
		out.sort();
		out
	}

	/// Union of the posting lists for `tags`.
	pub fn matching_slots(&self, tags: &[String]) -> HashSet<Slot> {
		let mut out = HashSet::new();
		for tag in tags {
			if let Some(slots) = self.postings.get(tag) {
				out.extend(slots.iter().copied());
			}
		}
		out
	}

	fn dist_to(&self, q: &[f32], q_mag: f64, slot: Slot) -> f64 {
		let n = &self.nodes[slot as usize];
		cosine_distance(q, &n.vector, q_mag, n.magnitude)
	}

	fn dist_between(&self, a: Slot, b: Slot) -> f64 {
		let na = &self.nodes[a as usize];
		self.dist_to(&na.vector, na.magnitude, b)
	}

	fn is_live(&self, slot: Slot) -> bool {
		!self.nodes[slot as usize].deleted
	}

	// -- Search ------------------------------------------------------------

	/// Best-first search of one layer starting from `entry_points`.
	///
	/// Every reachable node is traversed, but only slots passing `accept`
	/// enter the result set. With a deadline, the loop stops at expiry and
	/// returns what it has.
	pub fn search_layer<F>(
		&self,
		q: &[f32],
		q_mag: f64,
		entry_points: &[Scored],
		ef: usize,
		layer: usize,
		accept: F,
		deadline: Option<&Deadline>,
	) -> LayerSearch
	where
		F: Fn(Slot) -> bool,
	{
		let ef = ef.max(1);
		let mut visited: HashSet<Slot> = entry_points.iter().map(|s| s.slot).collect();
		let mut candidates: BinaryHeap<Reverse<Scored>> =
			entry_points.iter().copied().map(Reverse).collect();
		let mut results: BinaryHeap<Scored> = BinaryHeap::new();
		for ep in entry_points {
			if accept(ep.slot) {
				results.push(*ep);
			}
		}
		while results.len() > ef {
			results.pop();
		}

		let mut expired = false;
		while let Some(Reverse(current)) = candidates.pop() {
			if deadline.is_some_and(|d| d.expired()) {
				expired = true;
				break;
			}
			if results.len() >= ef {
				if let Some(worst) = results.peek() {
					if current.dist > worst.dist {
						break;
					}
				}
			}

			let node = &self.nodes[current.slot as usize];
			let Some(neighbors) = node.links.get(layer) else {
				continue;
			};
			for &nb in neighbors {
				if !visited.insert(nb) {
					continue;
				}
				let dist = self.dist_to(q, q_mag, nb);
				let improves = results.len() < ef || results.peek().map_or(true, |w| dist < w.dist);
				if !improves {
					continue;
				}
				let scored = Scored { dist, slot: nb };
				candidates.push(Reverse(scored));
				if accept(nb) {
					results.push(scored);
					if results.len() > ef {
						results.pop();
					}
				}
			}
		}

		let mut found = results.into_vec();
		found.sort();
		LayerSearch { found, expired }
	}

	/// Greedy descent from the entry point down to (but excluding)
	/// `stop_layer`, one best hop per layer.
	fn descend(&self, q: &[f32], q_mag: f64, stop_layer: usize) -> Option<Scored> {
		let entry = self.entry?;
		let mut ep = Scored {
			dist: self.dist_to(q, q_mag, entry),
			slot: entry,
		};
		let top = self.nodes[entry as usize].level();
		for layer in (stop_layer + 1..=top).rev() {
			let res = self.search_layer(q, q_mag, &[ep], 1, layer, |_| true, None);
			if let Some(best) = res.found.first() {
				ep = *best;
			}
		}
		Some(ep)
	}

	/// k nearest live nodes.
	pub fn knn(&self, q: &[f32], q_mag: f64, k: usize, ef: usize, deadline: &Deadline) -> LayerSearch {
		if k == 0 || self.live.is_empty() {
			return LayerSearch::default();
		}
		let Some(ep) = self.descend(q, q_mag, 0) else {
			return LayerSearch::default();
		};
		let mut res = self.search_layer(
			q,
			q_mag,
			&[ep],
			ef.max(k),
			0,
			|s| self.is_live(s),
			Some(deadline),
		);
		res.found.truncate(k);
		res
	}

	/// Exact top-k over an explicit slot set.
	pub fn exact_scan<I>(&self, q: &[f32], q_mag: f64, slots: I, k: usize, deadline: &Deadline) -> LayerSearch
	where
		I: IntoIterator<Item = Slot>,
	{
		let mut heap: BinaryHeap<Scored> = BinaryHeap::new();
		let mut expired = false;
		if k > 0 {
			for (i, slot) in slots.into_iter().enumerate() {
				if i % SCAN_DEADLINE_STRIDE == 0 && deadline.expired() {
					expired = true;
					break;
				}
				if !self.is_live(slot) {
					continue;
				}
				heap.push(Scored {
					dist: self.dist_to(q, q_mag, slot),
					slot,
				});
				if heap.len() > k {
					heap.pop();
				}
			}
		}
		let mut found = heap.into_vec();
		found.sort();
		LayerSearch { found, expired }
	}

	// -- Insertion ---------------------------------------------------------

	/// Find neighbours for a new node of `level`. `exclude` is the slot the
	/// new node replaces, which must not become its neighbour.
	pub fn plan_insert(&self, q: &[f32], q_mag: f64, level: usize, exclude: Option<Slot>) -> InsertPlan {
		let Some(entry) = self.entry else {
			return InsertPlan {
				level,
				neighbors: Vec::new(),
			};
		};
		let top = self.nodes[entry as usize].level();
		let shared = level.min(top);

		let Some(ep) = self.descend(q, q_mag, shared) else {
			return InsertPlan {
				level,
				neighbors: Vec::new(),
			};
		};

		let accept = |s: Slot| self.is_live(s) && Some(s) != exclude;
		let mut entry_points = vec![ep];
		let mut neighbors = vec![Vec::new(); shared + 1];
		for layer in (0..=shared).rev() {
			let res = self.search_layer(
				q,
				q_mag,
				&entry_points,
				self.params.ef_construction,
				layer,
				accept,
				None,
			);
			neighbors[layer] = self.select_neighbors(&res.found, self.params.m);
			if !res.found.is_empty() {
				entry_points = res.found;
			}
		}

		InsertPlan { level, neighbors }
	}

	/// Link a planned node into the graph. Tombstones any live node with the
	/// same id. Returns the new slot and whether an older node was replaced.
	pub fn apply_insert(&mut self, mut node: Node, plan: InsertPlan) -> (Slot, bool) {
		let slot = self.nodes.len() as Slot;
		let replaced = match self.live.get(&node.id).copied() {
			Some(old) => {
				self.tombstone(old);
				true
			}
			None => false,
		};

		let mut links = vec![Vec::new(); plan.level + 1];
		for (layer, nbs) in plan.neighbors.iter().enumerate() {
			links[layer] = nbs.clone();
		}
		node.links = links;

		for tag in &node.tags {
			self.postings.entry(tag.clone()).or_default().insert(slot);
		}
		self.live.insert(node.id.clone(), slot);
		self.nodes.push(node);

		for (layer, nbs) in plan.neighbors.iter().enumerate() {
			let cap = self.params.max_links(layer);
			for &nb in nbs {
				let list = &mut self.nodes[nb as usize].links[layer];
				list.push(slot);
				if list.len() > cap {
					self.prune(nb, layer, cap);
				}
			}
		}

		let promote = match self.entry {
			None => true,
			Some(e) => plan.level > self.nodes[e as usize].level(),
		};
		if promote {
			self.entry = Some(slot);
		}

		(slot, replaced)
	}

	/// HNSW neighbour heuristic: prefer candidates closer to the base than to
	/// anything already selected, then back-fill with the pruned ones.
	fn select_neighbors(&self, candidates: &[Scored], m: usize) -> Vec<Slot> {
		let mut selected: Vec<Scored> = Vec::with_capacity(m);
		let mut pruned: Vec<Scored> = Vec::new();
		for c in candidates {
			if selected.len() >= m {
				break;
			}
			let diverse = selected
				.iter()
				.all(|s| self.dist_between(c.slot, s.slot) > c.dist);
			if diverse {
				selected.push(*c);
			} else {
				pruned.push(*c);
			}
		}
		for p in pruned {
			if selected.len() >= m {
				break;
			}
			selected.push(p);
		}
		selected.into_iter().map(|s| s.slot).collect()
	}

	fn prune(&mut self, base: Slot, layer: usize, cap: usize) {
		let mut cands: Vec<Scored> = self.nodes[base as usize].links[layer]
			.iter()
			.map(|&s| Scored {
				dist: self.dist_between(base, s),
				slot: s,
			})
			.collect();
		// Dead links go last so they are the first to be dropped.
		cands.sort_by(|a, b| {
			self.is_live(b.slot)
				.cmp(&self.is_live(a.slot))
				.then(a.cmp(b))
		});
		let keep = self.select_neighbors(&cands, cap);
		self.nodes[base as usize].links[layer] = keep;
	}

	// -- Mutation ----------------------------------------------------------

	fn tombstone(&mut self, slot: Slot) {
		let node = &mut self.nodes[slot as usize];
		if node.deleted {
			return;
		}
		node.deleted = true;
		for tag in &node.tags {
			if let Some(set) = self.postings.get_mut(tag) {
				set.remove(&slot);
				if set.is_empty() {
					self.postings.remove(tag);
				}
			}
		}
		if self.live.get(&node.id) == Some(&slot) {
			self.live.remove(&node.id);
		}
		self.tombstones += 1;
	}

	pub fn remove(&mut self, id: &str) -> bool {
		match self.live.get(id).copied() {
			Some(slot) => {
				self.tombstone(slot);
				true
			}
			None => false,
		}
	}

	/// Replace a live node's tags without touching its links.
	pub fn retag(&mut self, id: &str, tags: Vec<String>) -> bool {
		let Some(slot) = self.slot_of(id) else {
			return false;
		};
		for tag in &self.nodes[slot as usize].tags {
			if let Some(set) = self.postings.get_mut(tag) {
				set.remove(&slot);
				if set.is_empty() {
					self.postings.remove(tag);
				}
			}
		}
		for tag in &tags {
			self.postings.entry(tag.clone()).or_default().insert(slot);
		}
		self.nodes[slot as usize].tags = tags;
		true
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
