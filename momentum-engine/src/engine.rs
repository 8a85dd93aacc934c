// ---------------------------------------------------------------------------
// Engine: wires the stores, scorer, cache and orchestrator together
// ---------------------------------------------------------------------------
//
// `Engine` is the single owner of every component. Request handlers call
// into it; the refresh orchestrator calls back into `EngineState` through
// the `JobRunner` trait to build aggregate payloads, recompute trends and
// write checkpoints.
//
// Raw topic names coming from callers are canonicalized here and nowhere
// else, so every store below only ever sees canonical keys.
// ---------------------------------------------------------------------------

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::aggregates;
use crate::cache::{AggregateCache, AggregateKey, AggregateSnapshot, SnapshotRead};
use crate::config::EngineConfig;
use crate::content::{ContentCatalog, ContentInput, ContentItem, ContentUpsertResult, LearningMode};
use crate::deadline::Deadline;
use crate::error::EngineError;
use crate::index::{IndexStats, SearchFilter, SearchOutcome, VectorIndex};
use crate::orchestrator::{Job, JobRunner, RefreshOrchestrator, ScheduleInfo};
use crate::persistence::{self, Checkpoint, SaveSummary, StoredContent, CHECKPOINT_VERSION};
use crate::profile::{ActivityEvent, EventOutcome, UserHistory, UserProfile, UserStore};
use crate::scoring::{Recommendations, Recommender};
use crate::topics::{TopicRegistry, TopicSection};
use crate::trend::{IngestReport, RecomputeReport, SignalKind, SignalTuple, TopicTrend, TrendStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
	pub index: IndexStats,
	pub content: usize,
	pub live_content: usize,
	pub topics: usize,
	pub trends: usize,
	pub users: usize,
	pub snapshots: usize,
	pub schedules: usize,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything a background job needs. Held by both the engine and the
/// orchestrator's runner.
pub struct EngineState {
	config: EngineConfig,
	topics: TopicRegistry,
	index: Arc<VectorIndex>,
	catalog: Arc<ContentCatalog>,
	trends: Arc<TrendStore>,
	users: Arc<UserStore>,
	cache: Arc<AggregateCache>,
	/// Serializes checkpoint writes from requests, the refresh loop and
	/// shutdown.
	save_lock: Mutex<()>,
}

impl EngineState {
	fn new(config: EngineConfig) -> Self {
		let index = Arc::new(VectorIndex::new(config.index.clone()));
		Self {
			catalog: Arc::new(ContentCatalog::new(config.content.clone(), index.clone())),
			trends: Arc::new(TrendStore::new(config.trend.clone())),
			users: Arc::new(UserStore::new()),
			cache: Arc::new(AggregateCache::new()),
			topics: TopicRegistry::new(),
			save_lock: Mutex::new(()),
			index,
			config,
		}
	}

	fn storage_dir(&self) -> Option<PathBuf> {
		self.config.storage_path.as_ref().map(PathBuf::from)
	}

	fn build_payload(&self, key: &AggregateKey, now: u64) -> Result<serde_json::Value, EngineError> {
		let value = match key {
			AggregateKey::User(user_id) => serde_json::to_value(aggregates::user_analytics(
				&self.users,
				&self.trends,
				user_id,
			)),
			AggregateKey::Topic(topic) => serde_json::to_value(aggregates::topic_health(
				&self.trends,
				&self.catalog,
				&self.users,
				topic,
			)?),
			AggregateKey::Leaderboard => serde_json::to_value(aggregates::leaderboard(
				&self.trends,
				self.config.refresh.leaderboard_size,
				now,
			)),
			AggregateKey::ContentDerived => serde_json::to_value(
				self.catalog
					.refresh_derived(|t| self.trends.momentum_score(t), now),
			),
		};
		value.map_err(|e| EngineError::Serialization(format!("aggregate {}: {}", key, e)))
	}

	// -- Checkpoints ---------------------------------------------------------

	fn checkpoint(&self, now: u64) -> Checkpoint {
		Checkpoint {
			version: CHECKPOINT_VERSION,
			saved_at: now,
			dimension: self.index.dimension(),
			topics: self.topics.sections().into_iter().map(|s| s.topic).collect(),
			aliases: self.topics.aliases(),
			content: self
				.catalog
				.all_items()
				.iter()
				.map(|item| StoredContent::from_item(item))
				.collect(),
			trends: self.trends.export(),
			users: self.users.export(),
			snapshots: self.cache.export(),
		}
	}

	/// Write a checkpoint when a storage path is configured.
	fn save(&self, now: u64) -> Result<Option<SaveSummary>, EngineError> {
		let Some(dir) = self.storage_dir() else {
			return Ok(None);
		};
		let _saving = self.save_lock.lock();
		let summary = persistence::save_checkpoint(&dir, &self.checkpoint(now))?;
		tracing::info!(
			path = %summary.path,
			bytes = summary.bytes,
			content = summary.content,
			users = summary.users,
			"Saved checkpoint"
		);
		Ok(Some(summary))
	}

	fn restore(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
		if !checkpoint.content.is_empty() && checkpoint.dimension != self.index.dimension() {
			return Err(EngineError::DimensionMismatch {
				expected: self.index.dimension(),
				actual: checkpoint.dimension,
			});
		}
		for topic in &checkpoint.topics {
			self.topics.canonical(topic)?;
		}
		for (alias, target) in &checkpoint.aliases {
			self.topics.add_alias(alias, target)?;
		}
		let items = checkpoint
			.content
			.into_iter()
			.map(StoredContent::into_item)
			.collect::<Result<Vec<ContentItem>, _>>()?;
		self.catalog.restore(items)?;
		self.trends.restore(checkpoint.trends);
		self.users.restore(checkpoint.users);
		self.cache.restore(checkpoint.snapshots);
		Ok(())
	}
}

impl JobRunner for EngineState {
	fn run(&self, job: &Job, now: u64) -> Result<Option<serde_json::Value>, EngineError> {
		match job {
			Job::Aggregate(key) => self.build_payload(key, now).map(Some),
			Job::TrendRecompute => {
				let report = self.trends.recompute_all(now);
				if report.recomputed == 0 && !report.failed.is_empty() {
					return Err(EngineError::RecomputeFailed {
						key: job.to_string(),
						reason: format!("all {} topics failed", report.failed.len()),
					});
				}
				Ok(None)
			}
			Job::Checkpoint => {
				self.save(now)?;
				Ok(None)
			}
		}
	}
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
	state: Arc<EngineState>,
	recommender: Recommender,
	orchestrator: Arc<RefreshOrchestrator>,
}

impl Engine {
	/// Build an empty engine and schedule the standing jobs.
	pub fn new(config: EngineConfig, now: u64) -> Self {
		let state = Arc::new(EngineState::new(config));
		let recommender = Recommender::new(
			state.config.scoring.clone(),
			state.catalog.clone(),
			state.trends.clone(),
			state.users.clone(),
		);
		let orchestrator = Arc::new(RefreshOrchestrator::new(
			state.config.refresh.clone(),
			state.cache.clone(),
			state.clone(),
		));

		orchestrator.schedule_refresh(AggregateKey::Leaderboard, None, now);
		orchestrator.schedule_refresh(AggregateKey::ContentDerived, None, now);
		orchestrator.schedule_job(Job::TrendRecompute, state.config.trend.cadence_ms, now);
		if state.config.storage_path.is_some() {
			orchestrator.schedule_job(
				Job::Checkpoint,
				state.config.refresh.checkpoint_interval_ms,
				now,
			);
		}

		Self {
			state,
			recommender,
			orchestrator,
		}
	}

	/// Build an engine and load the checkpoint under the storage path, if any.
	pub fn open(config: EngineConfig, now: u64) -> Result<Self, EngineError> {
		let engine = Self::new(config, now);
		let Some(dir) = engine.state.storage_dir() else {
			return Ok(engine);
		};
		if let Some(checkpoint) = persistence::load_checkpoint(&dir)? {
			let saved_at = checkpoint.saved_at;
			engine.state.restore(checkpoint)?;
			for key in engine.state.cache.keys() {
				engine.orchestrator.schedule_refresh(key, None, now);
			}
			tracing::info!(
				path = %dir.display(),
				saved_at,
				content = engine.state.catalog.len(),
				topics = engine.state.trends.len(),
				users = engine.state.users.len(),
				"Loaded checkpoint"
			);
		}
		Ok(engine)
	}

	pub fn config(&self) -> &EngineConfig {
		&self.state.config
	}

	pub fn orchestrator(&self) -> &Arc<RefreshOrchestrator> {
		&self.orchestrator
	}

	/// Deadline for a request, falling back to the configured default.
	pub fn deadline(&self, deadline_ms: Option<u64>) -> Deadline {
		Deadline::after_ms(deadline_ms.unwrap_or(self.state.config.scoring.default_deadline_ms))
	}

	fn signal_topic(&self, raw: &str) -> Result<String, EngineError> {
		self.state.topics.canonical(raw).map_err(|e| match e {
			EngineError::InvalidParams(msg) => EngineError::InvalidSignal(msg),
			other => other,
		})
	}

	fn resolve_key(&self, key: AggregateKey) -> Result<AggregateKey, EngineError> {
		match key {
			AggregateKey::Topic(raw) => Ok(AggregateKey::Topic(self.state.topics.resolve(&raw)?)),
			other => Ok(other),
		}
	}

	// -- Content -------------------------------------------------------------

	pub fn upsert_content(
		&self,
		input: ContentInput,
		now: u64,
	) -> Result<ContentUpsertResult, EngineError> {
		let tags = self.state.topics.canonical_all(&input.tags)?;
		let trends = &self.state.trends;
		let result = self
			.state
			.catalog
			.upsert(input, tags, |t| trends.momentum_score(t), now)?;
		self.orchestrator
			.notify_changed(&AggregateKey::ContentDerived, now);
		Ok(result)
	}

	pub fn retire_content(&self, id: &str, now: u64) -> Result<bool, EngineError> {
		let retired = self.state.catalog.retire(id, now)?;
		if retired {
			self.orchestrator
				.notify_changed(&AggregateKey::ContentDerived, now);
		}
		Ok(retired)
	}

	pub fn content(&self, id: &str) -> Option<Arc<ContentItem>> {
		self.state.catalog.get(id)
	}

	pub fn search(
		&self,
		query: &[f32],
		k: usize,
		tags: &[String],
		deadline: &Deadline,
	) -> Result<SearchOutcome, EngineError> {
		let tags = tags
			.iter()
			.map(|t| self.state.topics.resolve(t))
			.collect::<Result<Vec<String>, _>>()?;
		let filter = SearchFilter::tags(tags);
		self.state.index.search(query, k, Some(&filter), deadline)
	}

	// -- Signals & trends ----------------------------------------------------

	/// Record one signal; returns the canonical topic it landed on.
	pub fn record_signal(
		&self,
		topic: &str,
		kind: &str,
		delta: f64,
		now: u64,
	) -> Result<String, EngineError> {
		let kind: SignalKind = kind.parse()?;
		let topic = self.signal_topic(topic)?;
		self.state.trends.record_signal(&topic, kind, delta, now)?;
		Ok(topic)
	}

	pub fn ingest_signals(&self, batch: &[SignalTuple], now: u64) -> IngestReport {
		self.state
			.trends
			.ingest(batch, now, |raw| self.signal_topic(raw))
	}

	pub fn recompute_trend(&self, topic: &str, now: u64) -> Result<TopicTrend, EngineError> {
		let topic = self.state.topics.resolve(topic)?;
		let trend = self.state.trends.recompute(&topic, now)?;
		self.orchestrator
			.notify_changed(&AggregateKey::Leaderboard, now);
		Ok(trend)
	}

	pub fn recompute_all(&self, now: u64) -> RecomputeReport {
		let report = self.state.trends.recompute_all(now);
		self.orchestrator
			.notify_changed(&AggregateKey::Leaderboard, now);
		self.orchestrator
			.notify_changed(&AggregateKey::ContentDerived, now);
		report
	}

	/// Last recomputed trend; `None` for topics never recomputed.
	pub fn trend(&self, topic: &str) -> Result<Option<TopicTrend>, EngineError> {
		let topic = self.state.topics.resolve(topic)?;
		Ok(self.state.trends.get(&topic))
	}

	pub fn leaderboard(&self, n: usize) -> Vec<TopicTrend> {
		self.state.trends.leaderboard(n)
	}

	// -- Topics --------------------------------------------------------------

	pub fn add_topic_alias(&self, alias: &str, topic: &str) -> Result<String, EngineError> {
		self.state.topics.add_alias(alias, topic)
	}

	pub fn topic_sections(&self) -> Vec<TopicSection> {
		self.state.topics.sections()
	}

	// -- Users ---------------------------------------------------------------

	pub fn upsert_profile(
		&self,
		user_id: &str,
		preferred_tags: &[String],
		preferred_modes: Vec<LearningMode>,
		now: u64,
	) -> Result<UserProfile, EngineError> {
		let tags = self.state.topics.canonical_all(preferred_tags)?;
		let profile = self
			.state
			.users
			.upsert_profile(user_id, tags, preferred_modes, now)?;
		self.orchestrator
			.notify_changed(&AggregateKey::User(user_id.to_string()), now);
		Ok(profile)
	}

	/// Fast-path update of a user's derived fields, then a change
	/// notification for their analytics aggregate.
	pub fn record_event(&self, event: &ActivityEvent, now: u64) -> Result<EventOutcome, EngineError> {
		let item = self
			.state
			.catalog
			.get(&event.content_id)
			.ok_or_else(|| EngineError::NotFound(format!("content '{}'", event.content_id)))?;
		let outcome = self.state.users.record_event(event, &item.tags, now)?;
		if outcome.counted {
			self.orchestrator
				.notify_changed(&AggregateKey::User(event.user_id.clone()), now);
		}
		Ok(outcome)
	}

	pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
		self.state.users.profile(user_id)
	}

	pub fn history(&self, user_id: &str) -> Option<UserHistory> {
		self.state.users.history(user_id)
	}

	pub fn recommend(
		&self,
		user_id: &str,
		mode: LearningMode,
		k: usize,
		deadline: &Deadline,
		now: u64,
	) -> Result<Recommendations, EngineError> {
		self.recommender.recommend(user_id, mode, k, deadline, now)
	}

	// -- Snapshots -----------------------------------------------------------

	pub fn snapshot(&self, key: AggregateKey, now: u64) -> Result<SnapshotRead, EngineError> {
		let key = self.resolve_key(key)?;
		Ok(self.state.cache.get(&key, now))
	}

	pub fn schedule_refresh(
		&self,
		key: AggregateKey,
		cadence_ms: Option<u64>,
		now: u64,
	) -> Result<ScheduleInfo, EngineError> {
		let key = self.resolve_key(key)?;
		Ok(self.orchestrator.schedule_refresh(key, cadence_ms, now))
	}

	pub fn force_refresh(
		&self,
		key: AggregateKey,
		now: u64,
	) -> Result<Arc<AggregateSnapshot>, EngineError> {
		let key = self.resolve_key(key)?;
		self.orchestrator.force_refresh(&key, now)
	}

	pub fn schedules(&self) -> Vec<ScheduleInfo> {
		self.orchestrator.schedules()
	}

	// -- Engine --------------------------------------------------------------

	pub fn stats(&self) -> EngineStats {
		EngineStats {
			index: self.state.index.stats(),
			content: self.state.catalog.len(),
			live_content: self.state.catalog.live_len(),
			topics: self.state.topics.len(),
			trends: self.state.trends.len(),
			users: self.state.users.len(),
			snapshots: self.state.cache.len(),
			schedules: self.orchestrator.schedules().len(),
		}
	}

	pub fn has_storage(&self) -> bool {
		self.state.config.storage_path.is_some()
	}

	pub fn save(&self, now: u64) -> Result<SaveSummary, EngineError> {
		self.state.save(now)?.ok_or_else(|| {
			EngineError::InvalidParams("no storage path configured".into())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::SnapshotStatus;
	use crate::content::LearningMode;
	use crate::orchestrator::JobOutcome;
	use crate::profile::ActivityKind;
	use crate::scoring::RankingStrategy;

	const HOUR: u64 = 60 * 60 * 1000;
	const T0: u64 = 1_000 * HOUR;

	fn config() -> EngineConfig {
		let mut cfg = EngineConfig::default();
		cfg.index.dimension = 3;
		cfg
	}

	fn input(id: &str, embedding: [f32; 3], tags: &[&str], modes: &[LearningMode]) -> ContentInput {
		ContentInput {
			id: id.into(),
			embedding: embedding.to_vec(),
			tags: tags.iter().map(|s| s.to_string()).collect(),
			modes: modes.to_vec(),
			duration_minutes: 20.0,
			novelty_base: 5.0,
			published_at: Some(T0),
		}
	}

	fn event(user: &str, content: &str, kind: ActivityKind) -> ActivityEvent {
		ActivityEvent {
			user_id: user.into(),
			content_id: content.into(),
			kind,
			minutes: 15.0,
			timestamp: None,
		}
	}

	#[test]
	fn standing_jobs_are_scheduled() {
		let engine = Engine::new(config(), T0);
		let jobs: Vec<String> = engine.schedules().into_iter().map(|s| s.job).collect();
		assert!(jobs.contains(&"trends:leaderboard".to_string()));
		assert!(jobs.contains(&"content:derived".to_string()));
		assert!(jobs.contains(&"job:trend-recompute".to_string()));
		assert!(!jobs.contains(&"job:checkpoint".to_string()));
	}

	#[test]
	fn content_tags_are_canonicalized() {
		let engine = Engine::new(config(), T0);
		engine
			.upsert_content(input("c1", [1.0, 0.0, 0.0], &[" ML/LLM "], &[]), T0)
			.unwrap();
		assert_eq!(engine.content("c1").unwrap().tags, vec!["ml/llm".to_string()]);
		assert_eq!(engine.stats().topics, 2);

		let err = engine
			.upsert_content(input("c2", [1.0, 0.0, 0.0], &["not a topic"], &[]), T0)
			.unwrap_err();
		assert_eq!(err.code(), "INVALID_PARAMS");
		assert!(engine.content("c2").is_none());
	}

	#[test]
	fn wrong_dimension_leaves_everything_untouched() {
		let engine = Engine::new(config(), T0);
		let mut bad = input("c1", [1.0, 0.0, 0.0], &["ml"], &[]);
		bad.embedding = vec![1.0, 0.0];
		let err = engine.upsert_content(bad, T0).unwrap_err();
		assert_eq!(err.code(), "DIMENSION_MISMATCH");
		assert_eq!(engine.stats().index.live, 0);
		assert_eq!(engine.stats().content, 0);
	}

	#[test]
	fn bad_signal_topics_are_invalid_signals() {
		let engine = Engine::new(config(), T0);
		let err = engine.record_signal("no spaces", "popularity", 1.0, T0).unwrap_err();
		assert_eq!(err.code(), "INVALID_SIGNAL");
		let err = engine.record_signal("ml", "likes", 1.0, T0).unwrap_err();
		assert_eq!(err.code(), "INVALID_SIGNAL");
		assert_eq!(engine.record_signal("ML", "mentions", 2.0, T0).unwrap(), "ml");

		let report = engine.ingest_signals(
			&[
				SignalTuple {
					topic: "rust".into(),
					kind: "adoption".into(),
					delta: 3.0,
				},
				SignalTuple {
					topic: "???".into(),
					kind: "adoption".into(),
					delta: 3.0,
				},
			],
			T0,
		);
		assert_eq!(report.accepted, 1);
		assert_eq!(report.rejected[0].index, 1);
		assert!(report.rejected[0].reason.starts_with("Invalid signal"));
	}

	#[test]
	fn events_need_known_content_and_pull_user_refresh_forward() {
		let engine = Engine::new(config(), T0);
		let err = engine
			.record_event(&event("u1", "missing", ActivityKind::Completed), T0)
			.unwrap_err();
		assert_eq!(err.code(), "NOT_FOUND");

		engine
			.upsert_content(input("c1", [1.0, 0.0, 0.0], &["rust"], &[]), T0)
			.unwrap();
		let key = AggregateKey::User("u1".into());
		engine.force_refresh(key.clone(), T0).unwrap();
		let before = engine.orchestrator().schedule_of(&Job::Aggregate(key.clone())).unwrap();
		assert!(before.next_due > T0 + HOUR);

		let outcome = engine
			.record_event(&event("u1", "c1", ActivityKind::Completed), T0 + 1_000)
			.unwrap();
		assert!(outcome.counted);
		assert_eq!(outcome.skills[0].skill, "rust");
		let after = engine.orchestrator().schedule_of(&Job::Aggregate(key)).unwrap();
		assert_eq!(
			after.next_due,
			T0 + engine.config().refresh.min_refresh_gap_ms
		);

		let again = engine
			.record_event(&event("u1", "c1", ActivityKind::Completed), T0 + 2_000)
			.unwrap();
		assert!(!again.counted);
		assert_eq!(engine.history("u1").unwrap().completed.len(), 1);
	}

	#[test]
	fn user_snapshot_reflects_activity_after_refresh() {
		let engine = Engine::new(config(), T0);
		engine
			.upsert_content(input("c1", [0.0, 1.0, 0.0], &["go"], &[]), T0)
			.unwrap();
		let key = AggregateKey::User("u1".into());
		assert_eq!(engine.snapshot(key.clone(), T0).unwrap().status, SnapshotStatus::Empty);

		engine
			.record_event(&event("u1", "c1", ActivityKind::Applied), T0)
			.unwrap();
		let snap = engine.force_refresh(key.clone(), T0).unwrap();
		assert_eq!(snap.version, 1);
		assert_eq!(snap.payload["events"], 1);
		assert_eq!(snap.payload["topSkills"][0], "go");

		let read = engine.snapshot(key, T0 + 1).unwrap();
		assert_eq!(read.status, SnapshotStatus::Fresh);
	}

	#[test]
	fn topic_snapshot_for_unknown_topic_fails_and_keeps_nothing() {
		let engine = Engine::new(config(), T0);
		let err = engine
			.force_refresh(AggregateKey::Topic("Haskell".into()), T0)
			.unwrap_err();
		assert_eq!(err.code(), "RECOMPUTE_FAILED");
		let read = engine.snapshot(AggregateKey::Topic("haskell".into()), T0).unwrap();
		assert_eq!(read.status, SnapshotStatus::Empty);
		let info = engine
			.orchestrator()
			.schedule_of(&Job::Aggregate(AggregateKey::Topic("haskell".into())))
			.unwrap();
		assert_eq!(info.failures, 1);
	}

	#[test]
	fn zero_history_user_gets_trending_ml_content() {
		let engine = Engine::new(config(), T0);
		engine
			.upsert_content(
				input("basics", [1.0, 0.0, 0.0], &["ml"], &[LearningMode::Discovery]),
				T0,
			)
			.unwrap();
		engine
			.upsert_content(
				input("agents", [0.0, 1.0, 0.0], &["ml/agents"], &[LearningMode::Discovery]),
				T0,
			)
			.unwrap();
		engine
			.upsert_content(
				input("web", [0.0, 0.0, 1.0], &["web"], &[LearningMode::Discovery]),
				T0,
			)
			.unwrap();
		engine.record_signal("ml/agents", "popularity", 900.0, T0).unwrap();
		engine.record_signal("ml", "popularity", 20.0, T0).unwrap();
		engine.record_signal("web", "popularity", 2000.0, T0).unwrap();
		engine.recompute_all(T0);
		engine
			.upsert_profile("new", &["ml".to_string()], vec![LearningMode::Discovery], T0)
			.unwrap();

		let recs = engine
			.recommend("new", LearningMode::Discovery, 5, &Deadline::none(), T0)
			.unwrap();
		assert_eq!(recs.strategy, RankingStrategy::MomentumOnly);
		let ids: Vec<&str> = recs.items.iter().map(|r| r.item.id.as_str()).collect();
		assert_eq!(ids, vec!["agents", "basics"]);
	}

	#[test]
	fn checkpoint_round_trip_through_open() {
		let dir = tempfile::tempdir().unwrap();
		let mut cfg = config();
		cfg.storage_path = Some(dir.path().display().to_string());

		let engine = Engine::new(cfg.clone(), T0);
		assert!(engine
			.schedules()
			.iter()
			.any(|s| s.job == "job:checkpoint"));
		engine.add_topic_alias("golang", "go").unwrap();
		engine
			.upsert_content(input("c1", [1.0, 0.0, 0.0], &["golang"], &[]), T0)
			.unwrap();
		engine
			.upsert_content(input("c2", [0.0, 1.0, 0.0], &["go"], &[]), T0)
			.unwrap();
		engine.retire_content("c2", T0).unwrap();
		engine.record_signal("go", "adoption", 40.0, T0).unwrap();
		engine.recompute_trend("go", T0).unwrap();
		engine
			.record_event(&event("u1", "c1", ActivityKind::Completed), T0)
			.unwrap();
		engine.force_refresh(AggregateKey::Leaderboard, T0).unwrap();
		let summary = engine.save(T0).unwrap();
		assert_eq!(summary.content, 2);

		let reopened = Engine::open(cfg, T0 + 1).unwrap();
		assert_eq!(reopened.stats().content, 2);
		assert_eq!(reopened.stats().index.live, 1);
		assert!(reopened.content("c2").unwrap().retired);
		assert_eq!(reopened.trend("golang").unwrap().unwrap().topic, "go");
		assert_eq!(reopened.history("u1").unwrap().completed.len(), 1);
		assert_eq!(
			reopened.snapshot(AggregateKey::Leaderboard, T0 + 1).unwrap().status,
			SnapshotStatus::Fresh
		);

		let hits = reopened
			.search(&[1.0, 0.0, 0.0], 5, &[], &Deadline::none())
			.unwrap();
		assert_eq!(hits.hits[0].id, "c1");
	}

	#[test]
	fn checkpoint_with_other_dimension_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let mut cfg = config();
		cfg.storage_path = Some(dir.path().display().to_string());
		let engine = Engine::new(cfg.clone(), T0);
		engine
			.upsert_content(input("c1", [1.0, 0.0, 0.0], &["ml"], &[]), T0)
			.unwrap();
		engine.save(T0).unwrap();

		cfg.index.dimension = 4;
		let err = Engine::open(cfg, T0).err().unwrap();
		assert_eq!(err.code(), "DIMENSION_MISMATCH");
	}

	#[test]
	fn explicit_saves_and_checkpoint_jobs_can_overlap() {
		let dir = tempfile::tempdir().unwrap();
		let mut cfg = config();
		cfg.storage_path = Some(dir.path().display().to_string());
		let engine = Engine::new(cfg.clone(), T0);
		engine
			.upsert_content(input("c1", [1.0, 0.0, 0.0], &["ml"], &[]), T0)
			.unwrap();

		std::thread::scope(|s| {
			for _ in 0..2 {
				s.spawn(|| {
					for i in 0..40 {
						engine.save(T0 + i).unwrap();
					}
				});
				s.spawn(|| {
					for i in 0..40 {
						let outcome = engine.orchestrator().run_job(&Job::Checkpoint, T0 + i);
						assert!(matches!(outcome, JobOutcome::Completed), "{:?}", outcome);
					}
				});
			}
		});

		let reopened = Engine::open(cfg, T0 + 100).unwrap();
		assert_eq!(reopened.stats().content, 1);
	}

	#[test]
	fn save_without_storage_is_rejected() {
		let engine = Engine::new(config(), T0);
		assert!(!engine.has_storage());
		assert_eq!(engine.save(T0).unwrap_err().code(), "INVALID_PARAMS");
	}
}
