// ---------------------------------------------------------------------------
// Wire protocol: JSON-RPC 2.0 envelopes, method names and params
// ---------------------------------------------------------------------------

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::cache::AggregateKey;
use crate::content::LearningMode;
use crate::error::EngineError;

// JSON-RPC 2.0 error codes
pub const INTERNAL_ERROR: i32 = -32603;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const ENGINE_ERROR: i32 = -32000;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: serde_json::Value,
}

/// Error code for a failed request. Malformed input gets the standard
/// invalid-params code; everything else is an engine error.
pub fn error_code(e: &EngineError) -> i32 {
	match e {
		EngineError::InvalidParams(_) => INVALID_PARAMS,
		_ => ENGINE_ERROR,
	}
}

pub fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, EngineError> {
	// Methods without params accept a missing or null `params`.
	let params = if params.is_null() {
		serde_json::Value::Object(Default::default())
	} else {
		params
	};
	serde_json::from_value(params).map_err(|e| EngineError::InvalidParams(e.to_string()))
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

pub mod methods {
	pub const CONTENT_UPSERT: &str = "content/upsert";
	pub const CONTENT_RETIRE: &str = "content/retire";
	pub const CONTENT_GET: &str = "content/get";
	pub const INDEX_SEARCH: &str = "index/search";

	pub const SIGNALS_RECORD: &str = "signals/record";
	pub const SIGNALS_INGEST: &str = "signals/ingest";
	pub const TREND_RECOMPUTE: &str = "trend/recompute";
	pub const TREND_RECOMPUTE_ALL: &str = "trend/recomputeAll";
	pub const TREND_GET: &str = "trend/get";
	pub const TREND_LEADERBOARD: &str = "trend/leaderboard";

	pub const TOPICS_ALIAS: &str = "topics/alias";
	pub const TOPICS_LIST: &str = "topics/list";

	pub const PROFILE_UPSERT: &str = "profile/upsert";
	pub const PROFILE_HISTORY: &str = "profile/history";
	pub const EVENTS_RECORD: &str = "events/record";
	pub const RECOMMEND: &str = "recommend";

	pub const SNAPSHOT_GET: &str = "snapshot/get";
	pub const SNAPSHOT_SCHEDULE: &str = "snapshot/schedule";
	pub const SNAPSHOT_FORCE_REFRESH: &str = "snapshot/forceRefresh";
	pub const SNAPSHOT_SCHEDULES: &str = "snapshot/schedules";

	pub const ENGINE_STATS: &str = "engine/stats";
	pub const ENGINE_SAVE: &str = "engine/save";

	/// Notification sent once the engine accepts requests.
	pub const ENGINE_READY: &str = "engine/ready";
}

// ---------------------------------------------------------------------------
// Param types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdParams {
	pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
	pub query_embedding: Vec<f32>,
	#[serde(default = "default_k")]
	pub k: usize,
	#[serde(default)]
	pub tags: Vec<String>,
	pub deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSignalParams {
	pub topic: String,
	pub kind: String,
	pub delta: f64,
}

/// Tuples stay raw so one malformed entry cannot sink the batch.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestParams {
	pub signals: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicParams {
	pub topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardParams {
	pub n: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasParams {
	pub alias: String,
	pub topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileParams {
	pub user_id: String,
	#[serde(default)]
	pub preferred_tags: Vec<String>,
	#[serde(default)]
	pub preferred_modes: Vec<LearningMode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserParams {
	pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendParams {
	pub user_id: String,
	pub mode: LearningMode,
	#[serde(default = "default_k")]
	pub k: usize,
	pub deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotKeyParams {
	pub key: AggregateKey,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleParams {
	pub key: AggregateKey,
	pub cadence_ms: Option<u64>,
}

fn default_k() -> usize {
	10
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn null_params_parse_as_empty_object() {
		let p: LeaderboardParams = parse_params(serde_json::Value::Null).unwrap();
		assert!(p.n.is_none());
	}

	#[test]
	fn bad_params_are_invalid_params() {
		let err = parse_params::<RecommendParams>(json!({ "userId": "u", "mode": "binge" }))
			.unwrap_err();
		assert_eq!(err.code(), "INVALID_PARAMS");
		assert_eq!(error_code(&err), INVALID_PARAMS);

		let err = parse_params::<SnapshotKeyParams>(json!({ "key": "team:1" })).unwrap_err();
		assert!(err.to_string().contains("invalid aggregate key"));
	}

	#[test]
	fn defaults_fill_optional_fields() {
		let p: RecommendParams =
			parse_params(json!({ "userId": "u", "mode": "discovery" })).unwrap();
		assert_eq!(p.k, 10);
		assert_eq!(p.mode, LearningMode::Discovery);
		assert!(p.deadline_ms.is_none());

		let p: ScheduleParams =
			parse_params(json!({ "key": "user:42", "cadenceMs": 5000 })).unwrap();
		assert_eq!(p.key, AggregateKey::User("42".into()));
		assert_eq!(p.cadence_ms, Some(5000));
	}

	#[test]
	fn engine_errors_map_to_engine_code() {
		assert_eq!(error_code(&EngineError::NotFound("x".into())), ENGINE_ERROR);
	}
}
