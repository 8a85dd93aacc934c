// ---------------------------------------------------------------------------
// Configuration: CLI arguments and tunable engine parameters
// ---------------------------------------------------------------------------
//
// `CliArgs` covers process-level knobs (log level, workers, storage). Every
// algorithmic constant lives in `EngineConfig`, which can be loaded from a
// JSON file; missing fields fall back to their defaults.
// ---------------------------------------------------------------------------

use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Parser, Debug)]
#[command(
	name = "momentum-engine",
	about = "Trend-aware recommendation and analytics engine over JSON-RPC stdio"
)]
pub struct CliArgs {
	/// JSON file with engine tuning parameters
	#[arg(long, env = "MOMENTUM_CONFIG")]
	pub config: Option<String>,

	/// Embedding dimension accepted by the vector index (overrides config file)
	#[arg(long, env = "MOMENTUM_DIMENSION")]
	pub dimension: Option<usize>,

	/// Directory for engine checkpoints; no persistence when unset
	#[arg(long, env = "MOMENTUM_STORAGE_PATH")]
	pub storage_path: Option<String>,

	/// Async runtime worker threads; request bodies run on its blocking pool
	#[arg(long, default_value = "4", env = "MOMENTUM_REQUEST_WORKERS")]
	pub request_workers: usize,

	/// Background refresh workers
	#[arg(long, default_value = "2", env = "MOMENTUM_BACKGROUND_WORKERS")]
	pub background_workers: usize,

	/// Disable the background refresh loop (refreshes only run when forced)
	#[arg(long)]
	pub no_background: bool,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, default_value = "info", env = "MOMENTUM_LOG_LEVEL")]
	pub log_level: String,
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
	pub index: IndexConfig,
	pub trend: TrendConfig,
	pub scoring: ScoringConfig,
	pub content: ContentConfig,
	pub refresh: RefreshConfig,
	pub storage_path: Option<String>,
}

impl EngineConfig {
	/// Load a config file. Unknown fields are ignored, missing ones defaulted.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
		let raw = std::fs::read_to_string(path.as_ref())?;
		serde_json::from_str(&raw)
			.map_err(|e| EngineError::Serialization(format!("Invalid config file: {}", e)))
	}

	/// Apply CLI overrides on top of a loaded (or default) config.
	pub fn with_cli(mut self, args: &CliArgs) -> Self {
		if let Some(dim) = args.dimension {
			self.index.dimension = dim;
		}
		if args.storage_path.is_some() {
			self.storage_path = args.storage_path.clone();
		}
		self
	}
}

/// HNSW parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexConfig {
	pub dimension: usize,
	/// Max links per node on upper layers (layer 0 keeps twice as many).
	pub m: usize,
	pub ef_construction: usize,
	pub ef_search: usize,
	/// Minimum expected recall for filtered searches.
	pub recall_floor: f64,
	/// Cap on the post-filter over-fetch factor.
	pub max_overfetch: usize,
	/// Rebuild the graph once tombstones exceed this share of nodes.
	pub compact_ratio: f64,
	pub seed: u64,
}

impl Default for IndexConfig {
	fn default() -> Self {
		Self {
			dimension: 384,
			m: 16,
			ef_construction: 100,
			ef_search: 64,
			recall_floor: 0.9,
			max_overfetch: 8,
			compact_ratio: 0.3,
			seed: 0x5eed,
		}
	}
}

/// Weights of the three signal kinds in the momentum score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MomentumWeights {
	pub popularity: f64,
	pub adoption: f64,
	pub mentions: f64,
}

impl Default for MomentumWeights {
	fn default() -> Self {
		Self {
			popularity: 0.4,
			adoption: 0.3,
			mentions: 0.3,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrendConfig {
	pub cadence_ms: u64,
	pub weights: MomentumWeights,
	pub min_momentum: f64,
	pub max_momentum: f64,
	pub baseline: f64,
	/// Per-window decay of momentum above baseline when signals stall.
	pub decay: f64,
	/// Damps growth rates for topics with little history.
	pub growth_smoothing: f64,
	pub recent_window_ms: u64,
	pub velocity_bonus: f64,
	pub status_lookback: usize,
	pub status_epsilon: f64,
	pub confidence_scale: f64,
	pub inactive_after_windows: u64,
}

impl Default for TrendConfig {
	fn default() -> Self {
		Self {
			cadence_ms: HOUR_MS,
			weights: MomentumWeights::default(),
			min_momentum: 1.0,
			max_momentum: 10.0,
			baseline: 1.0,
			decay: 0.9,
			growth_smoothing: 100.0,
			recent_window_ms: 90 * DAY_MS,
			velocity_bonus: 0.15,
			status_lookback: 3,
			status_epsilon: 0.05,
			confidence_scale: 500.0,
			inactive_after_windows: 24 * 30,
		}
	}
}

/// Weights of the four composite sub-scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoreWeights {
	pub alignment: f64,
	pub mode: f64,
	pub momentum: f64,
	pub novelty: f64,
}

impl Default for ScoreWeights {
	fn default() -> Self {
		Self {
			alignment: 0.3,
			mode: 0.25,
			momentum: 0.25,
			novelty: 0.2,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringConfig {
	pub weights: ScoreWeights,
	/// Candidate pool is `k * candidate_multiplier` (+ completed count).
	pub candidate_multiplier: usize,
	pub max_k: usize,
	/// Half-life for the interest centroid over completed items.
	pub interest_half_life_ms: f64,
	pub default_deadline_ms: u64,
}

impl Default for ScoringConfig {
	fn default() -> Self {
		Self {
			weights: ScoreWeights::default(),
			candidate_multiplier: 4,
			max_k: 100,
			interest_half_life_ms: 7.0 * DAY_MS as f64,
			default_deadline_ms: 250,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContentConfig {
	/// Half-life of an item's novelty since publication.
	pub novelty_half_life_ms: f64,
}

impl Default for ContentConfig {
	fn default() -> Self {
		Self {
			novelty_half_life_ms: 180.0 * DAY_MS as f64,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
	pub tick_ms: u64,
	pub topic_health_cadence_ms: u64,
	pub leaderboard_cadence_ms: u64,
	pub user_analytics_cadence_ms: u64,
	pub content_derived_cadence_ms: u64,
	pub min_cadence_ms: u64,
	/// Earliest re-refresh after a change notification.
	pub min_refresh_gap_ms: u64,
	pub retry_base_ms: u64,
	pub max_backoff_ms: u64,
	pub checkpoint_interval_ms: u64,
	pub leaderboard_size: usize,
}

impl Default for RefreshConfig {
	fn default() -> Self {
		Self {
			tick_ms: 1000,
			topic_health_cadence_ms: HOUR_MS,
			leaderboard_cadence_ms: HOUR_MS,
			user_analytics_cadence_ms: 4 * HOUR_MS,
			content_derived_cadence_ms: HOUR_MS,
			min_cadence_ms: 1000,
			min_refresh_gap_ms: 30_000,
			retry_base_ms: 5_000,
			max_backoff_ms: 15 * 60 * 1000,
			checkpoint_interval_ms: 10 * 60 * 1000,
			leaderboard_size: 20,
		}
	}
}
