// ---------------------------------------------------------------------------
// Trend Store
// ---------------------------------------------------------------------------
//
// Append-only signal counters per topic and cadence window, and the momentum
// derived from them. `momentum` holds the arithmetic, `store` the per-topic
// cells and the parallel recompute.
// ---------------------------------------------------------------------------

pub mod momentum;
pub mod store;

pub use momentum::{Counters, SignalKind, TrendStatus};
pub use store::{
	IngestReport, RecomputeReport, RejectedSignal, SignalTuple, TopicRecord, TopicTrend, TrendStore,
};
