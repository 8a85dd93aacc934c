// ---------------------------------------------------------------------------
// Refresh Orchestrator
// ---------------------------------------------------------------------------
//
// Owns the refresh schedule for every aggregate key plus the engine's
// maintenance jobs (trend recompute, checkpoint). Callers never pick when a
// refresh happens; they can only schedule a key, force it, or report that
// its inputs changed.
//
// `due_jobs(now)` and `run_job(job, now)` are synchronous so the schedule
// can be driven deterministically; `spawn` wraps them in a tokio interval
// loop that runs due jobs on a bounded blocking pool.
// ---------------------------------------------------------------------------

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cache::{AggregateCache, AggregateKey, AggregateKind, AggregateSnapshot};
use crate::config::RefreshConfig;
use crate::deadline::current_timestamp_ms;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {
	Aggregate(AggregateKey),
	TrendRecompute,
	Checkpoint,
}

impl fmt::Display for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Aggregate(key) => write!(f, "{}", key),
			Self::TrendRecompute => f.write_str("job:trend-recompute"),
			Self::Checkpoint => f.write_str("job:checkpoint"),
		}
	}
}

/// Does the actual work of a job. Aggregate jobs return the payload to
/// publish; maintenance jobs return `None`.
pub trait JobRunner: Send + Sync {
	fn run(&self, job: &Job, now: u64) -> Result<Option<serde_json::Value>, EngineError>;
}

/// Retry delay after `failures` consecutive failures:
/// `min(base * 2^(failures - 1), max)`.
pub fn backoff_ms(failures: u32, base_ms: u64, max_ms: u64) -> u64 {
	if failures == 0 {
		return 0;
	}
	let shift = (failures - 1).min(32);
	base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

struct Entry {
	cadence_ms: u64,
	next_due: u64,
	last_refresh: Option<u64>,
	failures: u32,
	last_error: Option<String>,
	/// Set while a background run is queued or running.
	dispatched: bool,
	/// Held for the duration of a run; one run per job at a time.
	run_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInfo {
	pub job: String,
	pub cadence_ms: u64,
	pub next_due: u64,
	pub last_refresh: Option<u64>,
	pub failures: u32,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
	Published(Arc<AggregateSnapshot>),
	Completed,
	Failed(String),
}

pub struct RefreshOrchestrator {
	config: RefreshConfig,
	cache: Arc<AggregateCache>,
	runner: Arc<dyn JobRunner>,
	entries: Mutex<HashMap<Job, Entry>>,
}

impl RefreshOrchestrator {
	pub fn new(config: RefreshConfig, cache: Arc<AggregateCache>, runner: Arc<dyn JobRunner>) -> Self {
		Self {
			config,
			cache,
			runner,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub fn cache(&self) -> &Arc<AggregateCache> {
		&self.cache
	}

	/// Configured cadence for a kind of aggregate.
	pub fn default_cadence(&self, kind: AggregateKind) -> u64 {
		match kind {
			AggregateKind::TopicHealth => self.config.topic_health_cadence_ms,
			AggregateKind::Leaderboard => self.config.leaderboard_cadence_ms,
			AggregateKind::UserAnalytics => self.config.user_analytics_cadence_ms,
			AggregateKind::ContentDerived => self.config.content_derived_cadence_ms,
		}
	}

	fn clamp_cadence(&self, cadence_ms: u64) -> u64 {
		cadence_ms.max(self.config.min_cadence_ms).max(1)
	}

	fn new_entry(&self, cadence_ms: u64, now: u64) -> Entry {
		Entry {
			cadence_ms,
			next_due: now,
			last_refresh: None,
			failures: 0,
			last_error: None,
			dispatched: false,
			run_lock: Arc::new(Mutex::new(())),
		}
	}

	// -- Scheduling ----------------------------------------------------------

	/// Schedule `key` at `cadence_ms` (or its kind's default). A new key is
	/// due immediately; an existing key keeps its last refresh time.
	pub fn schedule_refresh(&self, key: AggregateKey, cadence_ms: Option<u64>, now: u64) -> ScheduleInfo {
		let cadence = cadence_ms.unwrap_or_else(|| self.default_cadence(key.kind()));
		self.schedule_job(Job::Aggregate(key), cadence, now)
	}

	pub fn schedule_job(&self, job: Job, cadence_ms: u64, now: u64) -> ScheduleInfo {
		let cadence = self.clamp_cadence(cadence_ms);
		let mut entries = self.entries.lock();
		let entry = entries
			.entry(job.clone())
			.or_insert_with(|| self.new_entry(cadence, now));
		entry.cadence_ms = cadence;
		if entry.failures == 0 {
			if let Some(last) = entry.last_refresh {
				entry.next_due = last + cadence;
			}
		}
		tracing::debug!(job = %job, cadence_ms = cadence, next_due = entry.next_due, "Scheduled refresh");
		info(&job, entry)
	}

	/// Inputs of `key` changed: pull its next refresh forward, but no earlier
	/// than `min_refresh_gap_ms` after the last one. Unscheduled keys are
	/// scheduled at their kind's cadence.
	pub fn notify_changed(&self, key: &AggregateKey, now: u64) {
		let job = Job::Aggregate(key.clone());
		let default_cadence = self.clamp_cadence(self.default_cadence(key.kind()));
		let mut entries = self.entries.lock();
		let entry = entries
			.entry(job)
			.or_insert_with(|| self.new_entry(default_cadence, now));
		let earliest = entry
			.last_refresh
			.map_or(now, |last| (last + self.config.min_refresh_gap_ms).max(now));
		if entry.failures == 0 && earliest < entry.next_due {
			entry.next_due = earliest;
		}
	}

	/// Jobs due at `now`, marked dispatched so the next tick skips them.
	pub fn due_jobs(&self, now: u64) -> Vec<Job> {
		let mut entries = self.entries.lock();
		let mut due: Vec<Job> = entries
			.iter_mut()
			.filter(|(_, e)| !e.dispatched && e.next_due <= now)
			.map(|(job, e)| {
				e.dispatched = true;
				job.clone()
			})
			.collect();
		due.sort();
		due
	}

	pub fn schedules(&self) -> Vec<ScheduleInfo> {
		let entries = self.entries.lock();
		let mut out: Vec<ScheduleInfo> = entries.iter().map(|(job, e)| info(job, e)).collect();
		out.sort_by(|a, b| a.job.cmp(&b.job));
		out
	}

	pub fn schedule_of(&self, job: &Job) -> Option<ScheduleInfo> {
		self.entries.lock().get(job).map(|e| info(job, e))
	}

	// -- Running -------------------------------------------------------------

	/// Run one job now and record the outcome in the schedule. Blocks while
	/// another run of the same job is in progress.
	pub fn run_job(&self, job: &Job, now: u64) -> JobOutcome {
		let run_lock = {
			let mut entries = self.entries.lock();
			let cadence = match job {
				Job::Aggregate(key) => self.clamp_cadence(self.default_cadence(key.kind())),
				_ => self.clamp_cadence(self.config.tick_ms),
			};
			entries
				.entry(job.clone())
				.or_insert_with(|| self.new_entry(cadence, now))
				.run_lock
				.clone()
		};
		let _running = run_lock.lock();

		// A panicking runner is recorded as a failure so the job is released
		// and retried with backoff.
		let run_id = Uuid::new_v4();
		let result = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(job, now)))
			.unwrap_or_else(|cause| {
				Err(EngineError::RecomputeFailed {
					key: job.to_string(),
					reason: format!("job panicked: {}", panic_message(cause.as_ref())),
				})
			});

		let mut entries = self.entries.lock();
		let Some(entry) = entries.get_mut(job) else {
			return JobOutcome::Failed("job unscheduled during run".into());
		};
		entry.dispatched = false;

		match result {
			Ok(payload) => {
				entry.failures = 0;
				entry.last_error = None;
				entry.last_refresh = Some(now);
				entry.next_due = now + entry.cadence_ms;
				let budget = entry.cadence_ms.saturating_mul(2);
				drop(entries);
				match (job, payload) {
					(Job::Aggregate(key), Some(payload)) => {
						let snap = self.cache.publish(key, payload, now, budget, run_id);
						tracing::debug!(job = %job, version = snap.version, run = %run_id, "Published snapshot");
						JobOutcome::Published(snap)
					}
					_ => JobOutcome::Completed,
				}
			}
			Err(e) => {
				entry.failures += 1;
				let delay = backoff_ms(entry.failures, self.config.retry_base_ms, self.config.max_backoff_ms);
				entry.next_due = now + delay;
				entry.last_error = Some(e.to_string());
				tracing::warn!(
					job = %job,
					run = %run_id,
					failures = entry.failures,
					retry_in_ms = delay,
					error = %e,
					"Refresh failed, keeping previous snapshot"
				);
				JobOutcome::Failed(e.to_string())
			}
		}
	}

	/// Refresh `key` immediately on the caller's thread.
	pub fn force_refresh(&self, key: &AggregateKey, now: u64) -> Result<Arc<AggregateSnapshot>, EngineError> {
		match self.run_job(&Job::Aggregate(key.clone()), now) {
			JobOutcome::Published(snap) => Ok(snap),
			JobOutcome::Completed => Err(EngineError::RecomputeFailed {
				key: key.to_string(),
				reason: "refresh produced no payload".into(),
			}),
			JobOutcome::Failed(reason) => Err(EngineError::RecomputeFailed {
				key: key.to_string(),
				reason,
			}),
		}
	}

	/// Run everything due at `now` on the caller's thread.
	pub fn tick(&self, now: u64) -> Vec<(Job, JobOutcome)> {
		self.due_jobs(now)
			.into_iter()
			.map(|job| {
				let outcome = self.run_job(&job, now);
				(job, outcome)
			})
			.collect()
	}

	// -- Background loop -----------------------------------------------------

	/// Tick every `tick_ms` until `stop` is set, running due jobs on at most
	/// `workers` blocking threads.
	pub fn spawn(
		self: Arc<Self>,
		handle: &tokio::runtime::Handle,
		workers: usize,
		stop: Arc<AtomicBool>,
	) -> tokio::task::JoinHandle<()> {
		let permits = Arc::new(Semaphore::new(workers.max(1)));
		let tick = Duration::from_millis(self.config.tick_ms.max(10));
		handle.spawn(async move {
			let mut interval = tokio::time::interval(tick);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			tracing::info!(tick_ms = tick.as_millis() as u64, workers, "Refresh loop started");
			loop {
				interval.tick().await;
				if stop.load(Ordering::Relaxed) {
					break;
				}
				let now = current_timestamp_ms();
				for job in self.due_jobs(now) {
					let Ok(permit) = permits.clone().acquire_owned().await else {
						break;
					};
					let this = self.clone();
					tokio::task::spawn_blocking(move || {
						let _permit = permit;
						this.run_job(&job, current_timestamp_ms());
					});
				}
			}
			tracing::info!("Refresh loop stopped");
		})
	}
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
	if let Some(s) = cause.downcast_ref::<&str>() {
		s
	} else if let Some(s) = cause.downcast_ref::<String>() {
		s
	} else {
		"unknown cause"
	}
}

fn info(job: &Job, e: &Entry) -> ScheduleInfo {
	ScheduleInfo {
		job: job.to_string(),
		cadence_ms: e.cadence_ms,
		next_due: e.next_due,
		last_refresh: e.last_refresh,
		failures: e.failures,
		last_error: e.last_error.clone(),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicU32;

	use serde_json::json;

	use super::*;

	/// Counts runs; fails while `failing` is set.
	struct Counter {
		runs: AtomicU32,
		failing: AtomicBool,
	}

	impl JobRunner for Counter {
		fn run(&self, job: &Job, _now: u64) -> Result<Option<serde_json::Value>, EngineError> {
			let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
			if self.failing.load(Ordering::SeqCst) {
				return Err(EngineError::RecomputeFailed {
					key: job.to_string(),
					reason: "source unavailable".into(),
				});
			}
			match job {
				Job::Aggregate(_) => Ok(Some(json!({ "run": n }))),
				_ => Ok(None),
			}
		}
	}

	fn setup() -> (Arc<Counter>, RefreshOrchestrator) {
		let runner = Arc::new(Counter {
			runs: AtomicU32::new(0),
			failing: AtomicBool::new(false),
		});
		let orch = RefreshOrchestrator::new(
			RefreshConfig::default(),
			Arc::new(AggregateCache::new()),
			runner.clone(),
		);
		(runner, orch)
	}

	const MIN: u64 = 60 * 1000;

	struct Exploding;

	impl JobRunner for Exploding {
		fn run(&self, _job: &Job, _now: u64) -> Result<Option<serde_json::Value>, EngineError> {
			panic!("payload builder blew up");
		}
	}

	#[test]
	fn panicking_job_fails_and_is_rescheduled() {
		let orch = RefreshOrchestrator::new(
			RefreshConfig::default(),
			Arc::new(AggregateCache::new()),
			Arc::new(Exploding),
		);
		let job = Job::Aggregate(AggregateKey::Leaderboard);
		orch.schedule_refresh(AggregateKey::Leaderboard, Some(10 * MIN), 0);

		let ran = orch.tick(0);
		assert_eq!(ran.len(), 1);
		match &ran[0].1 {
			JobOutcome::Failed(reason) => assert!(reason.contains("blew up"), "{}", reason),
			other => panic!("expected failure, got {:?}", other),
		}

		let info = orch.schedule_of(&job).unwrap();
		assert_eq!(info.failures, 1);
		assert!(info.next_due > 0);
		assert!(orch.due_jobs(info.next_due - 1).is_empty());
		assert_eq!(orch.due_jobs(info.next_due), vec![job]);
		assert!(orch.cache().get(&AggregateKey::Leaderboard, 0).snapshot.is_none());
	}

	#[test]
	fn backoff_doubles_and_caps() {
		assert_eq!(backoff_ms(0, 5_000, 60_000), 0);
		assert_eq!(backoff_ms(1, 5_000, 60_000), 5_000);
		assert_eq!(backoff_ms(2, 5_000, 60_000), 10_000);
		assert_eq!(backoff_ms(3, 5_000, 60_000), 20_000);
		assert_eq!(backoff_ms(5, 5_000, 60_000), 60_000);
		assert_eq!(backoff_ms(200, 5_000, 60_000), 60_000);
	}

	#[test]
	fn new_key_is_due_then_follows_cadence() {
		let (runner, orch) = setup();
		let key = AggregateKey::Leaderboard;
		orch.schedule_refresh(key.clone(), Some(10 * MIN), 0);

		let ran = orch.tick(0);
		assert_eq!(ran.len(), 1);
		assert!(matches!(ran[0].1, JobOutcome::Published(_)));
		assert!(orch.tick(5 * MIN).is_empty());
		assert_eq!(orch.tick(10 * MIN).len(), 1);
		assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
		assert_eq!(orch.cache().get(&key, 10 * MIN).snapshot.unwrap().version, 2);
	}

	#[test]
	fn cadence_is_clamped_and_defaults_per_kind() {
		let (_, orch) = setup();
		let tiny = orch.schedule_refresh(AggregateKey::ContentDerived, Some(1), 0);
		assert_eq!(tiny.cadence_ms, RefreshConfig::default().min_cadence_ms);
		let user = orch.schedule_refresh(AggregateKey::User("u".into()), None, 0);
		assert_eq!(user.cadence_ms, RefreshConfig::default().user_analytics_cadence_ms);
	}

	#[test]
	fn dispatched_jobs_are_not_handed_out_twice() {
		let (_, orch) = setup();
		orch.schedule_refresh(AggregateKey::Topic("ml".into()), None, 0);
		assert_eq!(orch.due_jobs(0).len(), 1);
		assert!(orch.due_jobs(1).is_empty());
	}

	#[test]
	fn failure_keeps_snapshot_and_backs_off() {
		let (runner, orch) = setup();
		let key = AggregateKey::Topic("ml".into());
		orch.schedule_refresh(key.clone(), Some(10 * MIN), 0);
		orch.tick(0);
		let good = orch.cache().get(&key, 0).snapshot.unwrap();

		runner.failing.store(true, Ordering::SeqCst);
		let cfg = RefreshConfig::default();
		let t1 = 10 * MIN;
		orch.tick(t1);
		let s = orch.schedule_of(&Job::Aggregate(key.clone())).unwrap();
		assert_eq!(s.failures, 1);
		assert_eq!(s.next_due, t1 + cfg.retry_base_ms);
		assert!(s.last_error.is_some());

		let t2 = s.next_due;
		orch.tick(t2);
		let s = orch.schedule_of(&Job::Aggregate(key.clone())).unwrap();
		assert_eq!(s.next_due, t2 + 2 * cfg.retry_base_ms);

		// Readers still see the last good snapshot.
		let read = orch.cache().get(&key, t2);
		assert_eq!(read.snapshot.unwrap().version, good.version);

		runner.failing.store(false, Ordering::SeqCst);
		orch.tick(s.next_due);
		let s = orch.schedule_of(&Job::Aggregate(key.clone())).unwrap();
		assert_eq!(s.failures, 0);
		assert_eq!(orch.cache().get(&key, 0).snapshot.unwrap().version, good.version + 1);
	}

	#[test]
	fn notify_changed_pulls_refresh_forward_but_respects_gap() {
		let (_, orch) = setup();
		let key = AggregateKey::User("u".into());
		orch.schedule_refresh(key.clone(), None, 0);
		orch.tick(0);
		let job = Job::Aggregate(key.clone());
		let cadence = RefreshConfig::default().user_analytics_cadence_ms;
		assert_eq!(orch.schedule_of(&job).unwrap().next_due, cadence);

		orch.notify_changed(&key, 1_000);
		let gap = RefreshConfig::default().min_refresh_gap_ms;
		assert_eq!(orch.schedule_of(&job).unwrap().next_due, gap);
		assert!(orch.tick(gap - 1).is_empty());
		assert_eq!(orch.tick(gap).len(), 1);
	}

	#[test]
	fn notify_changed_schedules_unknown_keys() {
		let (_, orch) = setup();
		let key = AggregateKey::User("new".into());
		orch.notify_changed(&key, 500);
		assert_eq!(orch.due_jobs(500), vec![Job::Aggregate(key)]);
	}

	#[test]
	fn force_refresh_reports_failures() {
		let (runner, orch) = setup();
		let key = AggregateKey::ContentDerived;
		let snap = orch.force_refresh(&key, 0).unwrap();
		assert_eq!(snap.version, 1);
		runner.failing.store(true, Ordering::SeqCst);
		let err = orch.force_refresh(&key, 1).unwrap_err();
		assert_eq!(err.code(), "RECOMPUTE_FAILED");
		assert_eq!(orch.cache().get(&key, 1).snapshot.unwrap().version, 1);
	}

	#[test]
	fn concurrent_force_refresh_never_tears_reads() {
		let (_, orch) = setup();
		let orch = Arc::new(orch);
		let key = AggregateKey::Leaderboard;
		orch.force_refresh(&key, 0).unwrap();

		let writers: Vec<_> = (0..4)
			.map(|i| {
				let orch = orch.clone();
				let key = key.clone();
				std::thread::spawn(move || {
					for n in 0..25u64 {
						orch.force_refresh(&key, i * 100 + n).unwrap();
					}
				})
			})
			.collect();
		let reader = {
			let orch = orch.clone();
			let key = key.clone();
			std::thread::spawn(move || {
				for _ in 0..500 {
					let snap = orch.cache().get(&key, 0).snapshot.unwrap();
					assert!(snap.payload["run"].as_u64().is_some());
				}
			})
		};
		for w in writers {
			w.join().unwrap();
		}
		reader.join().unwrap();
		assert_eq!(orch.cache().get(&key, 0).snapshot.unwrap().version, 101);
	}

	#[test]
	fn maintenance_jobs_complete_without_publishing() {
		let (runner, orch) = setup();
		orch.schedule_job(Job::Checkpoint, 10 * MIN, 0);
		let ran = orch.tick(0);
		assert!(matches!(ran[0].1, JobOutcome::Completed));
		assert!(orch.cache().is_empty());
		assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn background_loop_runs_due_jobs_until_stopped() {
		let (runner, _) = setup();
		let mut config = RefreshConfig::default();
		config.tick_ms = 20;
		let orch = Arc::new(RefreshOrchestrator::new(
			config,
			Arc::new(AggregateCache::new()),
			runner.clone() as Arc<dyn JobRunner>,
		));
		orch.schedule_refresh(AggregateKey::Leaderboard, None, 0);

		let stop = Arc::new(AtomicBool::new(false));
		let handle = orch
			.clone()
			.spawn(&tokio::runtime::Handle::current(), 2, stop.clone());

		for _ in 0..100 {
			if orch.cache().get(&AggregateKey::Leaderboard, 0).snapshot.is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		stop.store(true, Ordering::Relaxed);
		handle.await.unwrap();
		assert!(orch.cache().get(&AggregateKey::Leaderboard, 0).snapshot.is_some());
		assert!(runner.runs.load(Ordering::SeqCst) >= 1);
	}
}
