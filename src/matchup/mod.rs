//! Matchup insight: prediction decoding, per-game detail aggregation and the
//! process-wide detail cache.

pub mod aggregator;
pub mod cache;
pub mod predictions;

pub use aggregator::{MatchDetailAggregator, MatchDetailHandle, MatchDetailState};
pub use cache::{CacheEntry, MatchCache};
pub use predictions::{PredictionSet, PredictionTexts};
