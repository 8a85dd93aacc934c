// ---------------------------------------------------------------------------
// EngineServer: JSON-RPC dispatcher
// ---------------------------------------------------------------------------
//
// Reads NDJSON requests from stdin and hands each one to the tokio
// runtime's blocking pool. Routing is a single `route()` match onto free-standing
// `handle_*` functions, each of which parses its params, calls the engine and
// shapes the JSON result. Responses can leave out of order; clients match
// them by id.
// ---------------------------------------------------------------------------

use std::io::{self, BufRead};
use std::sync::Arc;

use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::content::ContentInput;
use crate::deadline::current_timestamp_ms;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::profile::ActivityEvent;
use crate::protocol::methods::*;
use crate::protocol::*;
use crate::trend::{RejectedSignal, SignalTuple};
use crate::transport::NdjsonTransport;

type HandlerResult = Result<serde_json::Value, EngineError>;

pub struct EngineServer {
	transport: NdjsonTransport,
	engine: Arc<Engine>,
}

impl EngineServer {
	pub fn new(transport: NdjsonTransport, engine: Arc<Engine>) -> Self {
		Self { transport, engine }
	}

	pub fn engine(&self) -> &Arc<Engine> {
		&self.engine
	}

	/// Read requests until stdin closes, dispatching each on `handle`.
	/// Returns once every in-flight request has been answered.
	pub fn run(self: Arc<Self>, handle: &Handle) -> Result<(), EngineError> {
		let stdin = io::stdin();
		let reader = stdin.lock();
		let mut in_flight = JoinSet::new();

		for line_result in reader.lines() {
			let line = line_result?;
			if line.trim().is_empty() {
				continue;
			}

			let request: JsonRpcRequest = match serde_json::from_str(&line) {
				Ok(r) => r,
				Err(e) => {
					tracing::error!("Failed to parse request: {}", e);
					continue;
				}
			};

			let server = self.clone();
			spawn_request(&mut in_flight, handle, move || server.dispatch(request));
			while let Some(done) = in_flight.try_join_next() {
				log_join(done);
			}
		}

		let pending = in_flight.len();
		if pending > 0 {
			tracing::debug!(pending, "Draining in-flight requests");
		}
		handle.block_on(async {
			while let Some(done) = in_flight.join_next().await {
				log_join(done);
			}
		});
		Ok(())
	}

	// -- Dispatch ------------------------------------------------------------

	pub fn dispatch(&self, req: JsonRpcRequest) {
		let id = req.id;
		let Some(result) = self.route(&req.method, req.params, current_timestamp_ms()) else {
			self.transport.write_error(
				id,
				METHOD_NOT_FOUND,
				format!("Unknown method: {}", req.method),
				None,
			);
			return;
		};

		match result {
			Ok(value) => self.transport.write_response(id, value),
			Err(e) => {
				if !e.is_rejection() {
					tracing::warn!(method = %req.method, error = %e, "Request failed");
				}
				self.transport.write_error(
					id,
					error_code(&e),
					e.to_string(),
					Some(e.to_json_rpc_error()),
				)
			}
		}
	}

	/// `None` for an unknown method.
	pub fn route(&self, method: &str, params: serde_json::Value, now: u64) -> Option<HandlerResult> {
		let e = &*self.engine;
		let result = match method {
			// -- Content -------------------------------------------------
			CONTENT_UPSERT => handle_content_upsert(e, params, now),
			CONTENT_RETIRE => handle_content_retire(e, params, now),
			CONTENT_GET => handle_content_get(e, params),
			INDEX_SEARCH => handle_index_search(e, params),

			// -- Signals & trends ----------------------------------------
			SIGNALS_RECORD => handle_signals_record(e, params, now),
			SIGNALS_INGEST => handle_signals_ingest(e, params, now),
			TREND_RECOMPUTE => handle_trend_recompute(e, params, now),
			TREND_RECOMPUTE_ALL => Ok(json!(e.recompute_all(now))),
			TREND_GET => handle_trend_get(e, params),
			TREND_LEADERBOARD => handle_trend_leaderboard(e, params),

			// -- Topics --------------------------------------------------
			TOPICS_ALIAS => handle_topics_alias(e, params),
			TOPICS_LIST => Ok(json!({ "sections": e.topic_sections() })),

			// -- Users ---------------------------------------------------
			PROFILE_UPSERT => handle_profile_upsert(e, params, now),
			PROFILE_HISTORY => handle_profile_history(e, params),
			EVENTS_RECORD => handle_events_record(e, params, now),
			RECOMMEND => handle_recommend(e, params, now),

			// -- Snapshots -----------------------------------------------
			SNAPSHOT_GET => handle_snapshot_get(e, params, now),
			SNAPSHOT_SCHEDULE => handle_snapshot_schedule(e, params, now),
			SNAPSHOT_FORCE_REFRESH => handle_snapshot_force_refresh(e, params, now),
			SNAPSHOT_SCHEDULES => Ok(json!({ "schedules": e.schedules() })),

			// -- Engine --------------------------------------------------
			ENGINE_STATS => Ok(json!(e.stats())),
			ENGINE_SAVE => e.save(now).map(|summary| json!(summary)),

			_ => return None,
		};
		Some(result)
	}
}

/// Requests may wait on refresh locks or do checkpoint I/O, so they run on
/// the blocking pool and never hold an async worker.
fn spawn_request<F>(in_flight: &mut JoinSet<()>, handle: &Handle, work: F)
where
	F: FnOnce() + Send + 'static,
{
	in_flight.spawn_blocking_on(work, handle);
}

fn log_join(done: Result<(), tokio::task::JoinError>) {
	if let Err(e) = done {
		tracing::error!("Request worker failed: {}", e);
	}
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_content_upsert(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let input: ContentInput = parse_params(params)?;
	let result = engine.upsert_content(input, now)?;
	Ok(json!(result))
}

fn handle_content_retire(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: IdParams = parse_params(params)?;
	let retired = engine.retire_content(&p.id, now)?;
	Ok(json!({ "id": p.id, "retired": retired }))
}

fn handle_content_get(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: IdParams = parse_params(params)?;
	Ok(json!({ "item": engine.content(&p.id) }))
}

fn handle_index_search(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: SearchParams = parse_params(params)?;
	let deadline = engine.deadline(p.deadline_ms);
	let outcome = engine.search(&p.query_embedding, p.k, &p.tags, &deadline)?;
	Ok(json!(outcome))
}

fn handle_signals_record(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: RecordSignalParams = parse_params(params)?;
	let topic = engine.record_signal(&p.topic, &p.kind, p.delta, now)?;
	Ok(json!({ "topic": topic }))
}

/// Tuples that are not even shaped like a signal are rejected here; the
/// rest go to the store, whose rejections are mapped back to batch
/// positions.
fn handle_signals_ingest(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: IngestParams = parse_params(params)?;
	let mut positions = Vec::with_capacity(p.signals.len());
	let mut tuples = Vec::with_capacity(p.signals.len());
	let mut malformed = Vec::new();

	for (index, raw) in p.signals.into_iter().enumerate() {
		match serde_json::from_value::<SignalTuple>(raw) {
			Ok(tuple) => {
				positions.push(index);
				tuples.push(tuple);
			}
			Err(err) => malformed.push(RejectedSignal {
				index,
				reason: format!("Invalid signal: {}", err),
			}),
		}
	}

	let mut report = engine.ingest_signals(&tuples, now);
	for rejected in &mut report.rejected {
		rejected.index = positions[rejected.index];
	}
	report.rejected.extend(malformed);
	report.rejected.sort_by_key(|r| r.index);
	Ok(json!(report))
}

fn handle_trend_recompute(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: TopicParams = parse_params(params)?;
	Ok(json!(engine.recompute_trend(&p.topic, now)?))
}

fn handle_trend_get(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: TopicParams = parse_params(params)?;
	Ok(json!({ "trend": engine.trend(&p.topic)? }))
}

fn handle_trend_leaderboard(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: LeaderboardParams = parse_params(params)?;
	let n = p.n.unwrap_or(engine.config().refresh.leaderboard_size);
	Ok(json!({ "topics": engine.leaderboard(n) }))
}

fn handle_topics_alias(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: AliasParams = parse_params(params)?;
	let topic = engine.add_topic_alias(&p.alias, &p.topic)?;
	Ok(json!({ "alias": p.alias, "topic": topic }))
}

fn handle_profile_upsert(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: ProfileParams = parse_params(params)?;
	let profile = engine.upsert_profile(&p.user_id, &p.preferred_tags, p.preferred_modes, now)?;
	Ok(json!({ "profile": profile }))
}

fn handle_profile_history(engine: &Engine, params: serde_json::Value) -> HandlerResult {
	let p: UserParams = parse_params(params)?;
	Ok(json!({
		"userId": p.user_id,
		"profile": engine.profile(&p.user_id),
		"history": engine.history(&p.user_id),
	}))
}

fn handle_events_record(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let event: ActivityEvent = parse_params(params)?;
	Ok(json!(engine.record_event(&event, now)?))
}

fn handle_recommend(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: RecommendParams = parse_params(params)?;
	let deadline = engine.deadline(p.deadline_ms);
	let recs = engine.recommend(&p.user_id, p.mode, p.k, &deadline, now)?;
	Ok(json!(recs))
}

fn handle_snapshot_get(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: SnapshotKeyParams = parse_params(params)?;
	let read = engine.snapshot(p.key, now)?;
	Ok(json!({
		"key": read.key,
		"status": read.status,
		"stale": read.stale(),
		"snapshot": read.snapshot,
	}))
}

fn handle_snapshot_schedule(engine: &Engine, params: serde_json::Value, now: u64) -> HandlerResult {
	let p: ScheduleParams = parse_params(params)?;
	Ok(json!(engine.schedule_refresh(p.key, p.cadence_ms, now)?))
}

fn handle_snapshot_force_refresh(
	engine: &Engine,
	params: serde_json::Value,
	now: u64,
) -> HandlerResult {
	let p: SnapshotKeyParams = parse_params(params)?;
	let snapshot = engine.force_refresh(p.key, now)?;
	Ok(json!({ "snapshot": snapshot }))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::EngineConfig;

	const NOW: u64 = 1_700_000_000_000;

	fn server() -> EngineServer {
		let mut cfg = EngineConfig::default();
		cfg.index.dimension = 2;
		EngineServer::new(NdjsonTransport::new(), Arc::new(Engine::new(cfg, NOW)))
	}

	fn call(s: &EngineServer, method: &str, params: serde_json::Value) -> HandlerResult {
		s.route(method, params, NOW).expect("known method")
	}

	#[test]
	fn blocked_request_leaves_runtime_free() {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.enable_all()
			.build()
			.unwrap();
		let (tx, rx) = std::sync::mpsc::channel::<()>();
		let (done_tx, done_rx) = std::sync::mpsc::channel::<bool>();
		let mut in_flight = JoinSet::new();

		// Waits until a task on the (single) async worker answers.
		spawn_request(&mut in_flight, runtime.handle(), move || {
			let answered = rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok();
			done_tx.send(answered).unwrap();
		});
		runtime.spawn(async move {
			tx.send(()).unwrap();
		});

		assert!(done_rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap());
		runtime.block_on(async { while in_flight.join_next().await.is_some() {} });
	}

	#[test]
	fn unknown_methods_are_not_routed() {
		assert!(server().route("store/add", json!({}), NOW).is_none());
	}

	#[test]
	fn ingest_reports_original_positions() {
		let s = server();
		let report = call(
			&s,
			SIGNALS_INGEST,
			json!({ "signals": [
				{ "topic": "rust", "kind": "popularity", "delta": 5 },
				{ "topic": "rust" },
				{ "topic": "rust", "kind": "adoption", "delta": -1 },
				{ "topic": "go", "kind": "mentions", "delta": 1 },
			]}),
		)
		.unwrap();
		assert_eq!(report["accepted"], 2);
		let rejected: Vec<u64> = report["rejected"]
			.as_array()
			.unwrap()
			.iter()
			.map(|r| r["index"].as_u64().unwrap())
			.collect();
		assert_eq!(rejected, vec![1, 2]);
	}

	#[test]
	fn missing_params_are_invalid_params() {
		let s = server();
		let err = call(&s, RECOMMEND, json!({ "userId": "u" })).unwrap_err();
		assert_eq!(error_code(&err), INVALID_PARAMS);
		let err = call(&s, CONTENT_RETIRE, json!({ "id": "nope" })).unwrap_err();
		assert_eq!(error_code(&err), ENGINE_ERROR);
		assert_eq!(err.code(), "NOT_FOUND");
	}

	#[test]
	fn unknown_reads_return_null() {
		let s = server();
		let got = call(&s, CONTENT_GET, json!({ "id": "nope" })).unwrap();
		assert!(got["item"].is_null());
		let got = call(&s, TREND_GET, json!({ "topic": "rust" })).unwrap();
		assert!(got["trend"].is_null());
		let got = call(&s, PROFILE_HISTORY, json!({ "userId": "ghost" })).unwrap();
		assert!(got["history"].is_null());
		let got = call(&s, SNAPSHOT_GET, json!({ "key": "user:ghost" })).unwrap();
		assert_eq!(got["status"], "empty");
		assert!(got["snapshot"].is_null());
	}

	#[test]
	fn content_round_trip_over_routes() {
		let s = server();
		let up = call(
			&s,
			CONTENT_UPSERT,
			json!({ "id": "c1", "embedding": [1.0, 0.0], "tags": ["Rust"], "modes": ["practice"] }),
		)
		.unwrap();
		assert_eq!(up["created"], true);

		let got = call(&s, CONTENT_GET, json!({ "id": "c1" })).unwrap();
		assert_eq!(got["item"]["tags"][0], "rust");
		assert!(got["item"].get("embedding").is_none());

		let hits = call(&s, INDEX_SEARCH, json!({ "queryEmbedding": [1.0, 0.1], "k": 3 })).unwrap();
		assert_eq!(hits["hits"][0]["id"], "c1");

		let stats = call(&s, ENGINE_STATS, serde_json::Value::Null).unwrap();
		assert_eq!(stats["liveContent"], 1);
	}
}
