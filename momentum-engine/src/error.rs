use thiserror::Error;

use crate::persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Dimension mismatch: expected {expected}, got {actual}")]
	DimensionMismatch { expected: usize, actual: usize },
	#[error("Invalid vector: {0}")]
	InvalidVector(String),
	#[error("Invalid signal: {0}")]
	InvalidSignal(String),
	#[error("Invalid params: {0}")]
	InvalidParams(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Recompute failed for '{key}': {reason}")]
	RecomputeFailed { key: String, reason: String },
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Storage corruption: {0}")]
	Corruption(String),
}

impl EngineError {
	pub fn code(&self) -> &str {
		match self {
			Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
			Self::InvalidVector(_) => "INVALID_VECTOR",
			Self::InvalidSignal(_) => "INVALID_SIGNAL",
			Self::InvalidParams(_) => "INVALID_PARAMS",
			Self::NotFound(_) => "NOT_FOUND",
			Self::RecomputeFailed { .. } => "RECOMPUTE_FAILED",
			Self::Io(_) => "IO_ERROR",
			Self::Serialization(_) => "SERIALIZATION_ERROR",
			Self::Corruption(_) => "STORAGE_CORRUPT",
		}
	}

	/// Input-validation errors are rejected at the boundary; everything else
	/// is an infrastructure fault.
	pub fn is_rejection(&self) -> bool {
		matches!(
			self,
			Self::DimensionMismatch { .. }
				| Self::InvalidVector(_)
				| Self::InvalidSignal(_)
				| Self::InvalidParams(_)
				| Self::NotFound(_)
		)
	}

	pub fn to_json_rpc_error(&self) -> serde_json::Value {
		serde_json::json!({
			"engineCode": self.code(),
			"message": self.to_string(),
		})
	}
}

impl From<PersistenceError> for EngineError {
	fn from(e: PersistenceError) -> Self {
		match e {
			PersistenceError::Io(io) => Self::Io(io),
			PersistenceError::Corruption(msg) => Self::Corruption(msg),
			PersistenceError::Serialization(msg) => Self::Serialization(msg),
		}
	}
}
