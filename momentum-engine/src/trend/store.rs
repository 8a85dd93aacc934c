use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::momentum::{confidence, evaluate, to_score_scale, Counters, SignalKind, TrendStatus};
use crate::config::TrendConfig;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Derived trend state of one topic as of a cadence window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicTrend {
	pub topic: String,
	pub momentum: f64,
	pub counters: Counters,
	pub window: u64,
	/// Start of `window` in ms.
	pub as_of: u64,
	pub confidence: f64,
	pub priority: f64,
	pub status: TrendStatus,
	pub recent: Vec<f64>,
	pub active: bool,
	pub first_seen: u64,
}

/// One `(topic, kind, delta)` tuple from an ingestion feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTuple {
	pub topic: String,
	pub kind: String,
	pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedSignal {
	pub index: usize,
	pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
	pub accepted: usize,
	pub rejected: Vec<RejectedSignal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeFailure {
	pub topic: String,
	pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeReport {
	pub window: u64,
	pub recomputed: usize,
	pub rising: usize,
	pub falling: usize,
	pub failed: Vec<RecomputeFailure>,
}

/// Persisted form of a topic cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRecord {
	pub topic: String,
	pub first_seen: u64,
	pub windows: Vec<(u64, Counters)>,
	#[serde(default)]
	pub last: Option<TopicTrend>,
}

// ---------------------------------------------------------------------------
// Topic cell
// ---------------------------------------------------------------------------

struct TopicState {
	first_seen: u64,
	windows: BTreeMap<u64, Counters>,
	last: Option<TopicTrend>,
}

/// Each topic is locked on its own; recomputes for one topic serialize on
/// this mutex and never touch another topic's lock.
struct TopicCell {
	topic: String,
	state: Mutex<TopicState>,
}

impl TopicCell {
	fn new(topic: String, first_seen: u64) -> Self {
		Self {
			topic,
			state: Mutex::new(TopicState {
				first_seen,
				windows: BTreeMap::new(),
				last: None,
			}),
		}
	}
}

// ---------------------------------------------------------------------------
// TrendStore
// ---------------------------------------------------------------------------

pub struct TrendStore {
	config: TrendConfig,
	topics: RwLock<HashMap<String, Arc<TopicCell>>>,
}

impl TrendStore {
	pub fn new(config: TrendConfig) -> Self {
		Self {
			config,
			topics: RwLock::new(HashMap::new()),
		}
	}

	pub fn config(&self) -> &TrendConfig {
		&self.config
	}

	pub fn window_of(&self, now: u64) -> u64 {
		now / self.config.cadence_ms.max(1)
	}

	pub fn len(&self) -> usize {
		self.topics.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn cell(&self, topic: &str) -> Option<Arc<TopicCell>> {
		self.topics.read().get(topic).cloned()
	}

	fn cell_or_create(&self, topic: &str, now: u64) -> Arc<TopicCell> {
		if let Some(cell) = self.cell(topic) {
			return cell;
		}
		let mut topics = self.topics.write();
		topics
			.entry(topic.to_string())
			.or_insert_with(|| {
				tracing::debug!(topic, "New topic observed");
				Arc::new(TopicCell::new(topic.to_string(), now))
			})
			.clone()
	}

	fn cells(&self) -> Vec<Arc<TopicCell>> {
		self.topics.read().values().cloned().collect()
	}

	// -- Signals -------------------------------------------------------------

	/// Append `delta` to the topic's counter for the window containing `now`.
	/// `topic` must already be canonical.
	pub fn record_signal(
		&self,
		topic: &str,
		kind: SignalKind,
		delta: f64,
		now: u64,
	) -> Result<(), EngineError> {
		if topic.is_empty() {
			return Err(EngineError::InvalidSignal("empty topic".into()));
		}
		if !delta.is_finite() || delta < 0.0 {
			return Err(EngineError::InvalidSignal(format!(
				"delta must be a non-negative number, got {}",
				delta
			)));
		}
		let window = self.window_of(now);
		let cell = self.cell_or_create(topic, now);
		let mut state = cell.state.lock();
		state.first_seen = state.first_seen.min(now);
		state.windows.entry(window).or_default().add(kind, delta);
		Ok(())
	}

	/// Record a batch. Each tuple is validated on its own; malformed tuples
	/// are reported and skipped. `canonical` maps raw topic names to keys.
	pub fn ingest<F>(&self, batch: &[SignalTuple], now: u64, canonical: F) -> IngestReport
	where
		F: Fn(&str) -> Result<String, EngineError>,
	{
		let mut report = IngestReport::default();
		for (index, tuple) in batch.iter().enumerate() {
			let result = tuple
				.kind
				.parse::<SignalKind>()
				.and_then(|kind| Ok((kind, canonical(&tuple.topic)?)))
				.and_then(|(kind, topic)| self.record_signal(&topic, kind, tuple.delta, now));
			match result {
				Ok(()) => report.accepted += 1,
				Err(e) => report.rejected.push(RejectedSignal {
					index,
					reason: e.to_string(),
				}),
			}
		}
		if !report.rejected.is_empty() {
			tracing::warn!(
				accepted = report.accepted,
				rejected = report.rejected.len(),
				"Signal batch had malformed tuples"
			);
		}
		report
	}

	// -- Recompute -----------------------------------------------------------

	/// Recompute a topic for the window containing `now`. Running it again in
	/// the same window without new signals yields an identical result.
	pub fn recompute(&self, topic: &str, now: u64) -> Result<TopicTrend, EngineError> {
		let cell = self
			.cell(topic)
			.ok_or_else(|| EngineError::NotFound(format!("topic '{}'", topic)))?;
		self.recompute_cell(&cell, self.window_of(now))
	}

	fn recompute_cell(&self, cell: &TopicCell, window: u64) -> Result<TopicTrend, EngineError> {
		let mut state = cell.state.lock();
		let eval = evaluate(&state.windows, state.first_seen, window, &self.config).map_err(
			|reason| EngineError::RecomputeFailed {
				key: cell.topic.clone(),
				reason,
			},
		)?;

		let conf = confidence(eval.cumulative.total(), self.config.confidence_scale);
		let silent_windows = window - eval.last_signal_window;
		let trend = TopicTrend {
			topic: cell.topic.clone(),
			momentum: eval.momentum,
			counters: eval.cumulative,
			window,
			as_of: window * self.config.cadence_ms,
			confidence: conf,
			priority: eval.momentum * conf,
			status: eval.status,
			recent: eval.recent,
			active: silent_windows < self.config.inactive_after_windows,
			first_seen: state.first_seen,
		};
		state.last = Some(trend.clone());
		Ok(trend)
	}

	/// Recompute every topic in parallel. A failing topic is reported and
	/// leaves its previous trend in place.
	pub fn recompute_all(&self, now: u64) -> RecomputeReport {
		let window = self.window_of(now);
		let results: Vec<Result<TopicTrend, RecomputeFailure>> = self
			.cells()
			.par_iter()
			.map(|cell| {
				self.recompute_cell(cell, window).map_err(|e| RecomputeFailure {
					topic: cell.topic.clone(),
					reason: e.to_string(),
				})
			})
			.collect();

		let mut report = RecomputeReport {
			window,
			..Default::default()
		};
		for result in results {
			match result {
				Ok(trend) => {
					report.recomputed += 1;
					match trend.status {
						TrendStatus::Rising => report.rising += 1,
						TrendStatus::Falling => report.falling += 1,
						TrendStatus::Flat => {}
					}
				}
				Err(failure) => {
					tracing::warn!(topic = %failure.topic, reason = %failure.reason, "Topic recompute failed");
					report.failed.push(failure);
				}
			}
		}
		report.failed.sort_by(|a, b| a.topic.cmp(&b.topic));
		tracing::info!(
			window,
			recomputed = report.recomputed,
			failed = report.failed.len(),
			"Recomputed topic trends"
		);
		report
	}

	// -- Reads ---------------------------------------------------------------

	/// Last recomputed trend for `topic`.
	pub fn get(&self, topic: &str) -> Option<TopicTrend> {
		self.cell(topic).and_then(|cell| cell.state.lock().last.clone())
	}

	pub fn momentum_of(&self, topic: &str) -> Option<f64> {
		self.cell(topic)
			.and_then(|cell| cell.state.lock().last.as_ref().map(|t| t.momentum))
	}

	/// Last momentum rescaled onto `[0, 10]`, the scale the scorer works in.
	pub fn momentum_score(&self, topic: &str) -> Option<f64> {
		self.momentum_of(topic)
			.map(|m| to_score_scale(m, &self.config))
	}

	/// Active topics ordered by priority, then momentum, then key.
	pub fn leaderboard(&self, n: usize) -> Vec<TopicTrend> {
		let mut trends: Vec<TopicTrend> = self
			.cells()
			.iter()
			.filter_map(|cell| cell.state.lock().last.clone())
			.filter(|t| t.active)
			.collect();
		trends.sort_by(|a, b| {
			b.priority
				.total_cmp(&a.priority)
				.then(b.momentum.total_cmp(&a.momentum))
				.then_with(|| a.topic.cmp(&b.topic))
		});
		trends.truncate(n);
		trends
	}

	pub fn topics(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.topics.read().keys().cloned().collect();
		keys.sort();
		keys
	}

	// -- Persistence ---------------------------------------------------------

	pub fn export(&self) -> Vec<TopicRecord> {
		let mut records: Vec<TopicRecord> = self
			.cells()
			.iter()
			.map(|cell| {
				let state = cell.state.lock();
				TopicRecord {
					topic: cell.topic.clone(),
					first_seen: state.first_seen,
					windows: state.windows.iter().map(|(w, c)| (*w, *c)).collect(),
					last: state.last.clone(),
				}
			})
			.collect();
		records.sort_by(|a, b| a.topic.cmp(&b.topic));
		records
	}

	pub fn restore(&self, records: Vec<TopicRecord>) {
		let mut topics = self.topics.write();
		topics.clear();
		for rec in records {
			let cell = TopicCell::new(rec.topic.clone(), rec.first_seen);
			{
				let mut state = cell.state.lock();
				state.windows = rec.windows.into_iter().collect();
				state.last = rec.last;
			}
			topics.insert(rec.topic, Arc::new(cell));
		}
	}
}
