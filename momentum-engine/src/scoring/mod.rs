// ---------------------------------------------------------------------------
// Scoring Engine
// ---------------------------------------------------------------------------
//
// Turns a user's history and preferences into a ranked list:
//
// 1. Query vector from the latest interaction, else a decayed centroid of
//    completed items.
// 2. Index search under the user's preferred tags (unfiltered fallback).
// 3. Drop completed and retired items.
// 4. Composite of alignment, mode match, momentum and novelty on 0–10.
// 5. Sort with momentum and duration tie-breaks; truncate to `k`.
//
// Users without history get a momentum-only ranking instead.
// ---------------------------------------------------------------------------

pub mod composite;
pub mod recommender;
pub mod weights;

pub use composite::{RankedItem, ScoreBreakdown};
pub use recommender::{RankingStrategy, Recommendations, Recommender};
pub use weights::{normalize_weights, NormalizedWeights};
