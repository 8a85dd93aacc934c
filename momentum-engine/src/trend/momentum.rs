// ---------------------------------------------------------------------------
// Momentum arithmetic
// ---------------------------------------------------------------------------
//
// Pure functions from per-window signal counters to a momentum value. The
// store owns the counters; everything here is deterministic in its inputs,
// which is what makes recompute idempotent.
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
	Popularity,
	Adoption,
	Mentions,
}

impl SignalKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Popularity => "popularity",
			Self::Adoption => "adoption",
			Self::Mentions => "mentions",
		}
	}
}

impl FromStr for SignalKind {
	type Err = EngineError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_lowercase().as_str() {
			"popularity" => Ok(Self::Popularity),
			"adoption" => Ok(Self::Adoption),
			"mentions" => Ok(Self::Mentions),
			other => Err(EngineError::InvalidSignal(format!(
				"unknown signal kind '{}'",
				other
			))),
		}
	}
}

/// Signal totals, either for one window or cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
	pub popularity: f64,
	pub adoption: f64,
	pub mentions: f64,
}

impl Counters {
	pub fn get(&self, kind: SignalKind) -> f64 {
		match kind {
			SignalKind::Popularity => self.popularity,
			SignalKind::Adoption => self.adoption,
			SignalKind::Mentions => self.mentions,
		}
	}

	pub fn add(&mut self, kind: SignalKind, delta: f64) {
		match kind {
			SignalKind::Popularity => self.popularity += delta,
			SignalKind::Adoption => self.adoption += delta,
			SignalKind::Mentions => self.mentions += delta,
		}
	}

	pub fn accumulate(&mut self, other: &Counters) {
		self.popularity += other.popularity;
		self.adoption += other.adoption;
		self.mentions += other.mentions;
	}

	pub fn total(&self) -> f64 {
		self.popularity + self.adoption + self.mentions
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStatus {
	Rising,
	Flat,
	Falling,
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// Growth of one counter in a window relative to everything before it,
/// squashed into `[0, 1)`.
pub fn squashed_growth(delta: f64, prior: f64, smoothing: f64) -> f64 {
	if delta <= 0.0 {
		return 0.0;
	}
	let g = delta / (prior + smoothing.max(f64::EPSILON));
	g / (1.0 + g)
}

/// Weighted combination of the per-kind growth rates.
pub fn raw_momentum(delta: &Counters, prior: &Counters, config: &TrendConfig) -> f64 {
	let w = &config.weights;
	let s = config.growth_smoothing;
	w.popularity * squashed_growth(delta.popularity, prior.popularity, s)
		+ w.adoption * squashed_growth(delta.adoption, prior.adoption, s)
		+ w.mentions * squashed_growth(delta.mentions, prior.mentions, s)
}

/// Bonus for topics first seen less than `recent_window_ms` ago; shrinks
/// linearly to zero over that window.
pub fn velocity_bonus(age_ms: u64, config: &TrendConfig) -> f64 {
	if config.recent_window_ms == 0 || age_ms >= config.recent_window_ms {
		return 0.0;
	}
	config.velocity_bonus * (1.0 - age_ms as f64 / config.recent_window_ms as f64)
}

/// Map a unit-range score onto `[min_momentum, max_momentum]`.
pub fn scale_momentum(unit: f64, config: &TrendConfig) -> f64 {
	let span = config.max_momentum - config.min_momentum;
	config.min_momentum + span * unit.clamp(0.0, 1.0)
}

/// Momentum `gap` windows after `m`, absent new signals.
pub fn decay_toward_baseline(m: f64, gap: u64, config: &TrendConfig) -> f64 {
	let exp = gap.min(i32::MAX as u64) as i32;
	let decayed = config.baseline + (m - config.baseline) * config.decay.powi(exp);
	decayed.clamp(config.min_momentum, config.max_momentum)
}

/// Rescale a momentum from `[min_momentum, max_momentum]` onto `[0, 10]`.
pub fn to_score_scale(m: f64, config: &TrendConfig) -> f64 {
	let span = config.max_momentum - config.min_momentum;
	if span <= 0.0 {
		return 0.0;
	}
	((m - config.min_momentum) / span * 10.0).clamp(0.0, 10.0)
}

pub fn classify(newest: f64, oldest: f64, epsilon: f64) -> TrendStatus {
	let diff = newest - oldest;
	if diff > epsilon {
		TrendStatus::Rising
	} else if diff < -epsilon {
		TrendStatus::Falling
	} else {
		TrendStatus::Flat
	}
}

pub fn confidence(total_signals: f64, scale: f64) -> f64 {
	if total_signals <= 0.0 || scale <= 0.0 {
		return 0.0;
	}
	1.0 - (-total_signals / scale).exp()
}

// ---------------------------------------------------------------------------
// Fold over windows
// ---------------------------------------------------------------------------

/// Result of folding a topic's windows up to a target window.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
	pub momentum: f64,
	pub cumulative: Counters,
	pub last_signal_window: u64,
	/// Momentum at each of the last `status_lookback` windows, oldest first.
	pub recent: Vec<f64>,
	pub status: TrendStatus,
}

/// Fold `windows` (window index -> deltas) up to and including `target`.
///
/// Each signal window produces a fresh momentum from its growth rates; the
/// carried value decays toward baseline across gaps, and the larger of the
/// two wins. Windows after `target` are ignored.
pub fn evaluate(
	windows: &BTreeMap<u64, Counters>,
	first_seen_ms: u64,
	target: u64,
	config: &TrendConfig,
) -> Result<Evaluation, String> {
	if config.cadence_ms == 0 {
		return Err("cadence must be positive".into());
	}

	let mut cumulative = Counters::default();
	let mut folded: Vec<(u64, f64)> = Vec::new();

	for (&w, delta) in windows.range(..=target) {
		let raw = raw_momentum(delta, &cumulative, config);
		let age = (w * config.cadence_ms).saturating_sub(first_seen_ms);
		let fresh = scale_momentum(raw + velocity_bonus(age, config), config);
		let m = match folded.last() {
			Some(&(prev_w, prev_m)) => {
				fresh.max(decay_toward_baseline(prev_m, w - prev_w, config))
			}
			None => fresh,
		};
		if !m.is_finite() {
			return Err(format!("non-finite momentum in window {}", w));
		}
		folded.push((w, m));
		cumulative.accumulate(delta);
	}

	let Some(&(last_w, _)) = folded.last() else {
		return Err(format!("no signal windows at or before window {}", target));
	};

	let at = |window: u64| -> f64 {
		let idx = folded.partition_point(|&(w, _)| w <= window);
		if idx == 0 {
			return config.baseline.clamp(config.min_momentum, config.max_momentum);
		}
		let (w, m) = folded[idx - 1];
		decay_toward_baseline(m, window - w, config)
	};

	let lookback = config.status_lookback.max(2) as u64;
	let recent: Vec<f64> = (0..lookback)
		.rev()
		.map(|back| match target.checked_sub(back) {
			Some(w) => at(w),
			None => config.baseline,
		})
		.collect();

	let momentum = at(target);
	let oldest = recent.first().copied().unwrap_or(config.baseline);
	let status = classify(momentum, oldest, config.status_epsilon);

	Ok(Evaluation {
		momentum,
		cumulative,
		last_signal_window: last_w,
		recent,
		status,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> TrendConfig {
		TrendConfig::default()
	}

	fn single(kind: SignalKind, delta: f64) -> Counters {
		let mut c = Counters::default();
		c.add(kind, delta);
		c
	}

	#[test]
	fn signal_kind_parses_case_insensitively() {
		assert_eq!("Popularity".parse::<SignalKind>().unwrap(), SignalKind::Popularity);
		assert_eq!(" mentions ".parse::<SignalKind>().unwrap(), SignalKind::Mentions);
		assert_eq!(
			"stars".parse::<SignalKind>().unwrap_err().code(),
			"INVALID_SIGNAL"
		);
	}

	#[test]
	fn growth_is_bounded_and_monotone() {
		assert_eq!(squashed_growth(0.0, 10.0, 100.0), 0.0);
		let small = squashed_growth(10.0, 0.0, 100.0);
		let large = squashed_growth(1000.0, 0.0, 100.0);
		assert!(small > 0.0 && small < large && large < 1.0);
		// Same delta on a larger base grows less.
		assert!(squashed_growth(100.0, 10_000.0, 100.0) < squashed_growth(100.0, 0.0, 100.0));
	}

	#[test]
	fn momentum_stays_in_range() {
		let c = cfg();
		assert_eq!(scale_momentum(-3.0, &c), 1.0);
		assert_eq!(scale_momentum(7.0, &c), 10.0);
		assert!((scale_momentum(0.5, &c) - 5.5).abs() < 1e-12);
	}

	#[test]
	fn score_scale_maps_range_onto_zero_to_ten() {
		let c = cfg();
		assert_eq!(to_score_scale(1.0, &c), 0.0);
		assert_eq!(to_score_scale(10.0, &c), 10.0);
		assert!((to_score_scale(5.5, &c) - 5.0).abs() < 1e-12);
	}

	#[test]
	fn bonus_fades_with_age() {
		let c = cfg();
		assert!((velocity_bonus(0, &c) - c.velocity_bonus).abs() < 1e-12);
		assert!(velocity_bonus(c.recent_window_ms / 2, &c) < c.velocity_bonus);
		assert_eq!(velocity_bonus(c.recent_window_ms, &c), 0.0);
	}

	#[test]
	fn decay_approaches_baseline() {
		let c = cfg();
		let m1 = decay_toward_baseline(8.0, 1, &c);
		let m10 = decay_toward_baseline(8.0, 10, &c);
		assert!(m1 < 8.0 && m10 < m1 && m10 > c.baseline);
		assert_eq!(decay_toward_baseline(8.0, 0, &c), 8.0);
	}

	#[test]
	fn burst_in_first_window_is_rising_above_baseline() {
		let c = cfg();
		let mut windows = BTreeMap::new();
		windows.insert(5, single(SignalKind::Popularity, 500.0));
		let eval = evaluate(&windows, 5 * c.cadence_ms, 5, &c).unwrap();
		assert!(eval.momentum > c.baseline);
		assert_eq!(eval.status, TrendStatus::Rising);
		assert_eq!(eval.cumulative.popularity, 500.0);
	}

	#[test]
	fn silence_after_burst_is_falling() {
		let c = cfg();
		let mut windows = BTreeMap::new();
		windows.insert(0, single(SignalKind::Adoption, 400.0));
		let at_burst = evaluate(&windows, 0, 0, &c).unwrap();
		let later = evaluate(&windows, 0, 6, &c).unwrap();
		assert!(later.momentum < at_burst.momentum);
		assert_eq!(later.status, TrendStatus::Falling);
		assert_eq!(later.last_signal_window, 0);
	}

	#[test]
	fn windows_after_target_are_ignored() {
		let c = cfg();
		let mut windows = BTreeMap::new();
		windows.insert(1, single(SignalKind::Mentions, 50.0));
		let before = evaluate(&windows, c.cadence_ms, 1, &c).unwrap();
		windows.insert(2, single(SignalKind::Mentions, 5000.0));
		let again = evaluate(&windows, c.cadence_ms, 1, &c).unwrap();
		assert_eq!(before, again);
	}

	#[test]
	fn target_before_first_window_fails() {
		let c = cfg();
		let mut windows = BTreeMap::new();
		windows.insert(4, single(SignalKind::Popularity, 1.0));
		assert!(evaluate(&windows, 0, 3, &c).is_err());
	}

	#[test]
	fn more_signal_never_lowers_momentum() {
		let c = cfg();
		let mut low = BTreeMap::new();
		low.insert(0, single(SignalKind::Popularity, 10.0));
		let mut high = BTreeMap::new();
		high.insert(0, single(SignalKind::Popularity, 200.0));
		let a = evaluate(&low, 0, 0, &c).unwrap().momentum;
		let b = evaluate(&high, 0, 0, &c).unwrap().momentum;
		assert!(b > a);
	}

	#[test]
	fn confidence_grows_with_volume() {
		assert_eq!(confidence(0.0, 500.0), 0.0);
		let a = confidence(100.0, 500.0);
		let b = confidence(1000.0, 500.0);
		assert!(a > 0.0 && a < b && b < 1.0);
	}
}
