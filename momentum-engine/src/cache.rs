// ---------------------------------------------------------------------------
// Aggregate Cache
// ---------------------------------------------------------------------------
//
// Keyed, versioned snapshots of precomputed analytics. A refresh builds the
// whole payload first and then swaps one `Arc` under the write lock; readers
// clone the `Arc` they find and keep it for as long as they like. A reader
// therefore sees either the old snapshot or the new one, never a mix, and
// never waits for a recompute.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Aggregation identity. Serialized as `user:<id>`, `topic:<key>`,
/// `trends:leaderboard` or `content:derived`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregateKey {
	User(String),
	Topic(String),
	Leaderboard,
	ContentDerived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
	UserAnalytics,
	TopicHealth,
	Leaderboard,
	ContentDerived,
}

impl AggregateKey {
	pub fn kind(&self) -> AggregateKind {
		match self {
			Self::User(_) => AggregateKind::UserAnalytics,
			Self::Topic(_) => AggregateKind::TopicHealth,
			Self::Leaderboard => AggregateKind::Leaderboard,
			Self::ContentDerived => AggregateKind::ContentDerived,
		}
	}
}

impl fmt::Display for AggregateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::User(id) => write!(f, "user:{}", id),
			Self::Topic(t) => write!(f, "topic:{}", t),
			Self::Leaderboard => f.write_str("trends:leaderboard"),
			Self::ContentDerived => f.write_str("content:derived"),
		}
	}
}

impl FromStr for AggregateKey {
	type Err = EngineError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || EngineError::InvalidParams(format!("invalid aggregate key '{}'", s));
		match s {
			"trends:leaderboard" => return Ok(Self::Leaderboard),
			"content:derived" => return Ok(Self::ContentDerived),
			_ => {}
		}
		let (prefix, rest) = s.split_once(':').ok_or_else(invalid)?;
		if rest.is_empty() {
			return Err(invalid());
		}
		match prefix {
			"user" => Ok(Self::User(rest.to_string())),
			"topic" => Ok(Self::Topic(rest.to_string())),
			_ => Err(invalid()),
		}
	}
}

impl TryFrom<String> for AggregateKey {
	type Error = EngineError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<AggregateKey> for String {
	fn from(key: AggregateKey) -> Self {
		key.to_string()
	}
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
	pub key: AggregateKey,
	/// Monotonic per key.
	pub version: u64,
	pub computed_at: u64,
	pub staleness_budget_ms: u64,
	/// Refresh run that produced this snapshot.
	pub run_id: Uuid,
	pub payload: serde_json::Value,
}

impl AggregateSnapshot {
	pub fn is_stale(&self, now: u64) -> bool {
		now.saturating_sub(self.computed_at) > self.staleness_budget_ms
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
	Fresh,
	Stale,
	/// Nothing computed yet for this key.
	Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRead {
	pub key: AggregateKey,
	pub status: SnapshotStatus,
	pub snapshot: Option<Arc<AggregateSnapshot>>,
}

impl SnapshotRead {
	pub fn stale(&self) -> bool {
		self.status == SnapshotStatus::Stale
	}
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AggregateCache {
	entries: RwLock<HashMap<AggregateKey, Arc<AggregateSnapshot>>>,
}

impl AggregateCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Last published snapshot, flagged stale once older than its budget.
	pub fn get(&self, key: &AggregateKey, now: u64) -> SnapshotRead {
		let snapshot = self.entries.read().get(key).cloned();
		let status = match &snapshot {
			None => SnapshotStatus::Empty,
			Some(s) if s.is_stale(now) => SnapshotStatus::Stale,
			Some(_) => SnapshotStatus::Fresh,
		};
		SnapshotRead {
			key: key.clone(),
			status,
			snapshot,
		}
	}

	/// Swap in a fully built payload. The write lock covers only the version
	/// bump and the pointer replacement.
	pub fn publish(
		&self,
		key: &AggregateKey,
		payload: serde_json::Value,
		computed_at: u64,
		staleness_budget_ms: u64,
		run_id: Uuid,
	) -> Arc<AggregateSnapshot> {
		let mut entries = self.entries.write();
		let version = entries.get(key).map_or(1, |prev| prev.version + 1);
		let snapshot = Arc::new(AggregateSnapshot {
			key: key.clone(),
			version,
			computed_at,
			staleness_budget_ms,
			run_id,
			payload,
		});
		entries.insert(key.clone(), snapshot.clone());
		snapshot
	}

	pub fn keys(&self) -> Vec<AggregateKey> {
		let mut keys: Vec<AggregateKey> = self.entries.read().keys().cloned().collect();
		keys.sort();
		keys
	}

	pub fn export(&self) -> Vec<AggregateSnapshot> {
		let mut snaps: Vec<AggregateSnapshot> = self
			.entries
			.read()
			.values()
			.map(|s| (**s).clone())
			.collect();
		snaps.sort_by(|a, b| a.key.cmp(&b.key));
		snaps
	}

	pub fn restore(&self, snapshots: Vec<AggregateSnapshot>) {
		let mut entries = self.entries.write();
		entries.clear();
		for snap in snapshots {
			entries.insert(snap.key.clone(), Arc::new(snap));
		}
	}
}
