// ---------------------------------------------------------------------------
// Topic Registry: canonical topic keys with aliases and hierarchy
// ---------------------------------------------------------------------------
//
// Signals, content tags and user preferences all name topics. Every name is
// funnelled through `canonical()` so "ML ", "ml" and an alias like
// "machine-learning" land on one key. Keys are `/`-separated paths
// ("ml/llm/agents"); registering a key registers its ancestors.
// ---------------------------------------------------------------------------

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

static TOPIC_KEY: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[a-z0-9][a-z0-9._+#-]*(/[a-z0-9][a-z0-9._+#-]*)*$")
		.expect("topic key pattern is valid")
});

/// How two topic keys relate within the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicRelation {
	Same,
	/// The first key is an ancestor of the second.
	Ancestor,
	/// The first key is a descendant of the second.
	Descendant,
	Unrelated,
}

/// Lowercase + trim. Does not validate.
pub fn normalize(raw: &str) -> String {
	raw.trim().to_lowercase()
}

/// Relation of `a` to `b` by path prefix.
pub fn relation(a: &str, b: &str) -> TopicRelation {
	if a == b {
		TopicRelation::Same
	} else if is_ancestor(a, b) {
		TopicRelation::Ancestor
	} else if is_ancestor(b, a) {
		TopicRelation::Descendant
	} else {
		TopicRelation::Unrelated
	}
}

fn is_ancestor(parent: &str, child: &str) -> bool {
	child.len() > parent.len()
		&& child.starts_with(parent)
		&& child.as_bytes()[parent.len()] == b'/'
}

/// `"a/b/c"` -> `["a", "a/b"]`
pub fn ancestors(topic: &str) -> Vec<String> {
	let parts: Vec<&str> = topic.split('/').collect();
	(1..parts.len()).map(|i| parts[..i].join("/")).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSection {
	pub topic: String,
	pub parent: Option<String>,
	pub children: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
	/// topic -> children (BTree for stable listings)
	children: BTreeMap<String, BTreeSet<String>>,
	aliases: HashMap<String, String>,
}

#[derive(Default)]
pub struct TopicRegistry {
	state: RwLock<RegistryState>,
}

impl TopicRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Resolve a raw name to its canonical key, registering it (and its
	/// ancestors) on first sight.
	pub fn canonical(&self, raw: &str) -> Result<String, EngineError> {
		let normalized = normalize(raw);
		{
			let state = self.state.read();
			if let Some(target) = state.aliases.get(&normalized) {
				return Ok(target.clone());
			}
			if state.children.contains_key(&normalized) {
				return Ok(normalized);
			}
		}
		if !TOPIC_KEY.is_match(&normalized) {
			return Err(EngineError::InvalidParams(format!(
				"invalid topic key '{}'",
				raw
			)));
		}
		self.register(&normalized);
		Ok(normalized)
	}

	/// Canonical key for `raw` without registering it. Used by lookups, which
	/// must not grow the registry.
	pub fn resolve(&self, raw: &str) -> Result<String, EngineError> {
		let normalized = normalize(raw);
		if let Some(target) = self.state.read().aliases.get(&normalized) {
			return Ok(target.clone());
		}
		if !TOPIC_KEY.is_match(&normalized) {
			return Err(EngineError::InvalidParams(format!(
				"invalid topic key '{}'",
				raw
			)));
		}
		Ok(normalized)
	}

	/// Canonicalize a list, dropping duplicates and keeping first-seen order.
	pub fn canonical_all<S: AsRef<str>>(&self, raw: &[S]) -> Result<Vec<String>, EngineError> {
		let mut out: Vec<String> = Vec::with_capacity(raw.len());
		for r in raw {
			let key = self.canonical(r.as_ref())?;
			if !out.contains(&key) {
				out.push(key);
			}
		}
		Ok(out)
	}

	fn register(&self, topic: &str) {
		let mut state = self.state.write();
		state.children.entry(topic.to_string()).or_default();
		let parts: Vec<&str> = topic.split('/').collect();
		for i in 1..parts.len() {
			let parent = parts[..i].join("/");
			let child = parts[..=i].join("/");
			state.children.entry(parent).or_default().insert(child);
		}
	}

	/// Point `alias` at `canonical`. The target is registered if new.
	pub fn add_alias(&self, alias: &str, canonical: &str) -> Result<String, EngineError> {
		let target = self.canonical(canonical)?;
		let alias = normalize(alias);
		if alias == target {
			return Ok(target);
		}
		self.state.write().aliases.insert(alias, target.clone());
		Ok(target)
	}

	pub fn contains(&self, topic: &str) -> bool {
		self.state.read().children.contains_key(&normalize(topic))
	}

	pub fn len(&self) -> usize {
		self.state.read().children.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn sections(&self) -> Vec<TopicSection> {
		let state = self.state.read();
		state
			.children
			.iter()
			.map(|(topic, children)| TopicSection {
				topic: topic.clone(),
				parent: ancestors(topic).pop(),
				children: children.iter().cloned().collect(),
			})
			.collect()
	}

	pub fn aliases(&self) -> Vec<(String, String)> {
		let mut out: Vec<(String, String)> = self
			.state
			.read()
			.aliases
			.iter()
			.map(|(a, t)| (a.clone(), t.clone()))
			.collect();
		out.sort();
		out
	}
}
