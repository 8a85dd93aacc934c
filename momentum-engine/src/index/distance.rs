use crate::error::EngineError;

/// L2 norm of a vector, accumulated in f64.
pub fn magnitude(v: &[f32]) -> f64 {
	v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Cosine distance (`1 - cos`) with both magnitudes known.
///
/// Lies in `[0, 2]`. Zero-magnitude or mismatched inputs are maximally
/// distant rather than NaN.
pub fn cosine_distance(a: &[f32], b: &[f32], mag_a: f64, mag_b: f64) -> f64 {
	if a.len() != b.len() || a.is_empty() {
		return 2.0;
	}
	let denom = mag_a * mag_b;
	if denom == 0.0 {
		return 2.0;
	}
	let dot: f64 = a
		.iter()
		.zip(b.iter())
		.map(|(&x, &y)| (x as f64) * (y as f64))
		.sum();
	let sim = dot / denom;
	if !sim.is_finite() {
		return 2.0;
	}
	1.0 - sim.clamp(-1.0, 1.0)
}

/// Convert a cosine distance back into a similarity in `[-1, 1]`.
pub fn similarity_from_distance(distance: f64) -> f64 {
	(1.0 - distance).clamp(-1.0, 1.0)
}

/// Reject vectors the index cannot use. Returns the magnitude on success.
pub fn validate(v: &[f32], dimension: usize) -> Result<f64, EngineError> {
	if v.len() != dimension {
		return Err(EngineError::DimensionMismatch {
			expected: dimension,
			actual: v.len(),
		});
	}
	if v.iter().any(|x| !x.is_finite()) {
		return Err(EngineError::InvalidVector(
			"vector contains NaN or infinite components".into(),
		));
	}
	let mag = magnitude(v);
	if mag == 0.0 {
		return Err(EngineError::InvalidVector("zero-magnitude vector".into()));
	}
	Ok(mag)
}
