use serde::{Deserialize, Serialize};

use crate::config::ScoreWeights;

/// Composite weights scaled to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWeights {
	pub alignment: f64,
	pub mode: f64,
	pub momentum: f64,
	pub novelty: f64,
}

/// Normalize configured weights so they sum to 1. Negative or non-finite
/// weights count as zero; an all-zero profile falls back to the defaults.
pub fn normalize_weights(weights: &ScoreWeights) -> NormalizedWeights {
	let sane = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
	let (a, m, t, n) = (
		sane(weights.alignment),
		sane(weights.mode),
		sane(weights.momentum),
		sane(weights.novelty),
	);
	let total = a + m + t + n;
	if total == 0.0 {
		return normalize_weights(&ScoreWeights::default());
	}
	NormalizedWeights {
		alignment: a / total,
		mode: m / total,
		momentum: t / total,
		novelty: n / total,
	}
}
